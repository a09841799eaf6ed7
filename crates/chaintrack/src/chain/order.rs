//! Static stage-name → position lookup used for display ordering.

use std::collections::HashMap;

/// Position assigned to stage names the resolver does not know.
pub const UNKNOWN_ORDER: i64 = 999;

/// Default document pipeline: store → convert → extract → analyze.
pub const DEFAULT_STAGE_ORDER: &[&str] = &[
    "Process File",
    "Convert Document",
    "Extract Text",
    "Analyze Document",
];

/// Maps stage names to their 1-based position in the chain.
///
/// Lookups ignore case and surrounding whitespace. The position is
/// display-only and never influences aggregation.
#[derive(Debug, Clone)]
pub struct ChainOrderResolver {
    positions: HashMap<String, i64>,
}

impl ChainOrderResolver {
    /// Builds a resolver from an ordered list of stage names. Later
    /// duplicates are ignored.
    pub fn new<I, S>(stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut positions = HashMap::new();
        for stage in stages {
            let key = normalize(stage.as_ref());
            let next = positions.len() as i64 + 1;
            positions.entry(key).or_insert(next);
        }
        Self { positions }
    }

    /// Position of `stage_name`, or [`UNKNOWN_ORDER`].
    pub fn order_of(&self, stage_name: &str) -> i64 {
        self.positions
            .get(&normalize(stage_name))
            .copied()
            .unwrap_or(UNKNOWN_ORDER)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl Default for ChainOrderResolver {
    fn default() -> Self {
        Self::new(DEFAULT_STAGE_ORDER)
    }
}

fn normalize(stage_name: &str) -> String {
    stage_name.trim().to_lowercase()
}

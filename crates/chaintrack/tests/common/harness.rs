//! Test harness for isolated test execution.
//!
//! Every harness owns a temporary directory holding one SQLite registry.
//! Each call to [`TestHarness::tracker`] opens a fresh handle on that file,
//! which behaves like a separate worker process.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use chaintrack::chain::MemoryQueue;
use chaintrack::{ChainTracker, Database, TrackerConfig};

pub struct TestHarness {
    temp_dir: TempDir,
    /// Path of the shared registry database.
    pub db_path: PathBuf,
    pub config: TrackerConfig,
}

impl TestHarness {
    /// Create a harness with the default configuration.
    pub fn new() -> Self {
        Self::with_config(TrackerConfig::default())
    }

    /// Create a harness; `databasePath` is pointed at the temp directory.
    pub fn with_config(mut config: TrackerConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("data").join("chaintrack.db");
        config.database_path = Some(db_path.to_string_lossy().into_owned());

        Self {
            temp_dir,
            db_path,
            config,
        }
    }

    /// Open a new tracker handle on the shared database.
    pub fn tracker(&self) -> ChainTracker {
        ChainTracker::from_config(&self.config).expect("Failed to open tracker")
    }

    /// Open a tracker that reads unclaimed work from `queue`.
    pub fn tracker_with_queue(&self, queue: Arc<MemoryQueue>) -> ChainTracker {
        let db = Database::open(&self.db_path).expect("Failed to open database");
        ChainTracker::with_queue(db, &self.config, queue)
    }

    /// Root directory of this harness.
    pub fn root(&self) -> &std::path::Path {
        self.temp_dir.path()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

//! Two-tier per-chain metadata store.
//!
//! The `chain_metadata` table is the source of truth. The moka cache in
//! front of it is a hint: entries expire after the configured TTL and are
//! repopulated from the table on the next read.

use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde_json::Value;

use crate::chain::record::format_timestamp;
use crate::db::metadata_repo::{self, MetadataRow};
use crate::db::Database;
use crate::error::MetadataError;

/// Default cache lifetime: six hours.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(6 * 60 * 60);

pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

#[derive(Clone)]
pub struct MetadataStore {
    db: Database,
    cache: Cache<String, Value>,
}

impl MetadataStore {
    pub fn new(db: Database) -> Self {
        Self::with_cache(db, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }

    pub fn with_cache(db: Database, capacity: u64, ttl: Duration) -> Self {
        Self {
            db,
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Write-through store. The durable write happens first; the cache is
    /// only updated once it succeeded.
    pub fn store(&self, chain_id: &str, metadata: &Value) -> Result<(), MetadataError> {
        self.store_at(chain_id, metadata, Utc::now())
    }

    pub fn store_at(
        &self,
        chain_id: &str,
        metadata: &Value,
        now: DateTime<Utc>,
    ) -> Result<(), MetadataError> {
        let row = MetadataRow {
            chain_id: chain_id.to_string(),
            payload: serde_json::to_string(metadata)?,
            updated_at: format_timestamp(now),
        };
        if let Err(e) = metadata_repo::upsert(&self.db, &row) {
            self.cache.invalidate(chain_id);
            return Err(e.into());
        }
        self.cache.insert(chain_id.to_string(), metadata.clone());
        Ok(())
    }

    /// Cache first, then the durable layer. A durable hit repopulates the cache.
    pub fn retrieve(&self, chain_id: &str) -> Result<Option<Value>, MetadataError> {
        if let Some(value) = self.cache.get(chain_id) {
            return Ok(Some(value));
        }

        let Some(row) = metadata_repo::find(&self.db, chain_id)? else {
            return Ok(None);
        };
        let value: Value = serde_json::from_str(&row.payload)?;
        log::debug!("Metadata cache miss for chain {}, repopulated", chain_id);
        self.cache.insert(chain_id.to_string(), value.clone());
        Ok(Some(value))
    }

    /// Like [`retrieve`](Self::retrieve), but absence is an error.
    pub fn require(&self, chain_id: &str) -> Result<Value, MetadataError> {
        self.retrieve(chain_id)?
            .ok_or_else(|| MetadataError::Missing {
                chain_id: chain_id.to_string(),
            })
    }

    /// Drops the cached copy. The durable copy is untouched.
    pub fn evict(&self, chain_id: &str) {
        self.cache.invalidate(chain_id);
    }

    pub fn is_cached(&self, chain_id: &str) -> bool {
        self.cache.contains_key(chain_id)
    }
}

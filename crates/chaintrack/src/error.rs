use std::path::PathBuf;
use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum ChaintrackError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("No database path configured and no home directory available")]
    NoDatabasePath,
}

/// Errors raised by registry, aggregation and read-model operations.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Registry storage failed: {0}")]
    Database(#[from] DatabaseError),

    #[error("Metadata store failed: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Queue source failed: {0}")]
    Queue(#[from] QueueError),

    /// The stage itself failed; the failure has already been recorded on its row.
    #[error("Stage '{stage_name}' failed: {source}")]
    Stage {
        stage_name: String,
        #[source]
        source: StageError,
    },

    #[error("Chain not found: {0}")]
    RootNotFound(String),

    #[error("Stage '{stage_name}' not found in chain '{chain_id}'")]
    StageNotFound { chain_id: String, stage_name: String },

    #[error("Stage '{stage_name}' in chain '{chain_id}' is {status}, only failed stages can be restarted")]
    NotRestartable {
        chain_id: String,
        stage_name: String,
        status: String,
    },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Root '{root_id}' kept changing underneath recomputation after {attempts} attempts")]
    RecomputeConflict { root_id: String, attempts: u32 },
}

/// Errors from the two-tier metadata store.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Durable metadata layer failed: {0}")]
    Database(#[from] DatabaseError),

    #[error("Metadata is not valid JSON: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("No metadata stored for chain '{chain_id}'")]
    Missing { chain_id: String },
}

/// Failure reported by a stage body.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("{0}")]
    Failed(String),

    #[error("Upstream metadata missing for chain '{chain_id}'")]
    MetadataMissing { chain_id: String },

    #[error("Metadata unavailable: {0}")]
    Metadata(#[source] MetadataError),

    #[error("Stage has no chain linkage, metadata cannot be resolved")]
    Unlinked,
}

impl From<MetadataError> for StageError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::Missing { chain_id } => StageError::MetadataMissing { chain_id },
            other => StageError::Metadata(other),
        }
    }
}

/// Failure reading the external queue runtime.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Failed to install log bridge: {0}")]
    LogBridge(#[from] log::SetLoggerError),

    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub type Result<T> = std::result::Result<T, ChaintrackError>;

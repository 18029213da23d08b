pub mod cache;
pub mod pool;

use thiserror::Error;

pub use cache::{IssuanceCache, Lookup};
pub use pool::{IssuancePool, IssuanceStats, StatsSnapshot, DEFAULT_SHUTDOWN_GRACE};

/// Failure delivered to every client waiting on the same subject
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IssueError {
    #[error("key generation failed: {0}")]
    Generation(String),

    #[error("server is shutting down")]
    ShuttingDown,
}

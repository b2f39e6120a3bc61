use serde_json::Value;
use thiserror::Error;

use qvarn_client::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Topology validation or configuration loading failed. Terminates the
    /// worker at startup.
    #[error("{0}")]
    Config(String),

    /// Another worker holds a live lease on one of our source types.
    #[error("map/reduce engine is already running on {owner}")]
    Busy { owner: String },

    /// Mapped rows for a key carry mixed `_mr_version` values — resync is
    /// mid-flight for that key and the reduce must wait.
    #[error("inconsistent mapped resource versions for key {key}")]
    VersionSkew { key: Value },

    /// A user-supplied handler failed.
    #[error("handler failed: {0}")]
    Handler(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    /// Errors the engine must never absorb into the retry ledger.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Store(StoreError::Unauthorized(_)) | Error::Busy { .. }
        )
    }
}

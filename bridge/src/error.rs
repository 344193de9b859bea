//! Store-side error taxonomy.

use rule_engine::CodecError;
use thiserror::Error;

/// Errors surfaced by store operations.
///
/// Transport failures abort the current operation. `OutOfSync` and
/// `Contention` are logical conflicts: the caller should refresh its
/// baseline and retry rather than treat them as fatal.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store transport error: {0}")]
    Transport(#[from] redis::RedisError),

    #[error("rule list is out of sync: index {index} is not valid for {len} stored rules; refresh and retry")]
    OutOfSync { index: usize, len: usize },

    #[error("rule list changed concurrently on {attempts} consecutive attempts; refresh and retry")]
    Contention { attempts: u32 },

    #[error("rule codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("malformed observation data: {0}")]
    Observation(String),
}

impl StoreError {
    /// True for conflicts that a refresh-and-retry can resolve.
    pub fn is_out_of_sync(&self) -> bool {
        matches!(self, StoreError::OutOfSync { .. } | StoreError::Contention { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, StoreError::Transport(_))
    }
}

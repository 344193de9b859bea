//! # Smart Cache Bridge
//!
//! Store-facing half of the smart cache rule tooling: the backing-store seam
//! and its Redis and in-memory implementations, the rule store client, and
//! the editing session used by the CLI.

pub mod backend;
pub mod config;
pub mod editor;
pub mod error;
pub mod store;

// Re-export commonly used types
pub use backend::{MemoryBackend, ObservationSource, RedisBackend, RuleBackend, VersionId};
pub use config::{config_key, RuleEncoding, StoreConfig};
pub use editor::{EditError, RowStatus, RuleSetEditor};
pub use error::StoreError;
pub use store::{apply_changes, RuleSnapshot, RuleStore, SnapshotState};

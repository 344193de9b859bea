//! Backing-store seam.
//!
//! The store client and the CLI only talk to the store through these two
//! traits. `RedisBackend` is the production implementation; `MemoryBackend`
//! keeps everything in process for tests and dry runs.

pub mod memory;
pub mod redis_store;

use rule_engine::{aggregate_tables, ObservedQuery, ObservedTable};

use crate::config::RuleEncoding;
use crate::error::StoreError;

pub use self::memory::MemoryBackend;
pub use self::redis_store::RedisBackend;

// ================================================================================================
// STORED VERSIONS
// ================================================================================================

/// Identifier of one committed version (stream entry id or document counter).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionId(pub String);

impl VersionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw payload of one version, in the shape of the configured encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredEntry {
    /// Flattened `rules.<n>.<component>[.<i>]` field/value pairs.
    Fields(Vec<(String, String)>),
    /// `{"rules": [...]}` JSON text.
    Document(String),
}

/// The latest version found under a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredVersion {
    pub id: VersionId,
    pub entry: StoredEntry,
}

// ================================================================================================
// TRAITS
// ================================================================================================

/// Versioned storage of rule lists.
pub trait RuleBackend {
    /// Latest version under `key`, or `None` if nothing was ever written.
    fn read_latest(
        &mut self,
        key: &str,
        encoding: RuleEncoding,
    ) -> Result<Option<StoredVersion>, StoreError>;

    /// Reads the latest version, lets `decide` compute the next one, and
    /// writes it. No other writer can commit between the read and the write;
    /// if `decide` fails nothing is written.
    fn read_then_write(
        &mut self,
        key: &str,
        encoding: RuleEncoding,
        decide: &mut dyn FnMut(Option<&StoredVersion>) -> Result<StoredEntry, StoreError>,
    ) -> Result<VersionId, StoreError>;
}

/// Query statistics recorded by the caching layer.
pub trait ObservationSource {
    fn observed_queries(&mut self, namespace: &str) -> Result<Vec<ObservedQuery>, StoreError>;

    /// Per-table statistics derived from the query statistics.
    fn observed_tables(&mut self, namespace: &str) -> Result<Vec<ObservedTable>, StoreError> {
        let queries = self.observed_queries(namespace)?;
        Ok(aggregate_tables(&queries))
    }

    /// Drops all recorded samples. Returns how many samples were removed.
    fn clear_metrics(&mut self, namespace: &str) -> Result<u64, StoreError>;
}

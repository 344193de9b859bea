//! In-process backend.
//!
//! Keeps the full version history per key behind a single lock, so
//! `read_then_write` is trivially indivisible. Cloning shares the state,
//! which lets tests keep a handle while a store client owns another.

use parking_lot::Mutex;
use rule_engine::ObservedQuery;
use std::collections::HashMap;
use std::sync::Arc;

use super::{ObservationSource, RuleBackend, StoredEntry, StoredVersion, VersionId};
use crate::config::RuleEncoding;
use crate::error::StoreError;

#[derive(Debug, Default)]
struct MemoryState {
    versions: HashMap<String, Vec<StoredVersion>>,
    queries: HashMap<String, Vec<ObservedQuery>>,
    next_seq: u64,
    /// Number of upcoming calls that fail with a transport error.
    failures: u32,
}

impl MemoryState {
    fn check_transport(&mut self) -> Result<(), StoreError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(StoreError::Transport(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "simulated transport failure",
            ))));
        }
        Ok(())
    }

    fn next_id(&mut self, encoding: RuleEncoding) -> VersionId {
        self.next_seq += 1;
        match encoding {
            RuleEncoding::Stream => VersionId(format!("{}-0", self.next_seq)),
            RuleEncoding::Document => VersionId(self.next_seq.to_string()),
        }
    }
}

/// Rule backend and observation source held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers query statistics for `namespace`.
    pub fn with_queries(self, namespace: &str, queries: Vec<ObservedQuery>) -> Self {
        self.state.lock().queries.insert(namespace.to_string(), queries);
        self
    }

    /// Appends a raw version under `key`, bypassing the codec.
    pub fn seed(&self, key: &str, encoding: RuleEncoding, entry: StoredEntry) -> VersionId {
        let mut state = self.state.lock();
        let id = state.next_id(encoding);
        state
            .versions
            .entry(key.to_string())
            .or_default()
            .push(StoredVersion { id: id.clone(), entry });
        id
    }

    /// Makes the next `n` backend calls fail as if the connection dropped.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().failures = n;
    }

    /// Every version written under `key`, oldest first.
    pub fn history(&self, key: &str) -> Vec<StoredVersion> {
        self.state
            .lock()
            .versions
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn version_count(&self, key: &str) -> usize {
        self.state.lock().versions.get(key).map_or(0, Vec::len)
    }
}

impl RuleBackend for MemoryBackend {
    fn read_latest(
        &mut self,
        key: &str,
        _encoding: RuleEncoding,
    ) -> Result<Option<StoredVersion>, StoreError> {
        let mut state = self.state.lock();
        state.check_transport()?;
        Ok(state.versions.get(key).and_then(|v| v.last()).cloned())
    }

    fn read_then_write(
        &mut self,
        key: &str,
        encoding: RuleEncoding,
        decide: &mut dyn FnMut(Option<&StoredVersion>) -> Result<StoredEntry, StoreError>,
    ) -> Result<VersionId, StoreError> {
        let mut state = self.state.lock();
        state.check_transport()?;

        let current = state.versions.get(key).and_then(|v| v.last()).cloned();
        let entry = decide(current.as_ref())?;

        let id = state.next_id(encoding);
        state
            .versions
            .entry(key.to_string())
            .or_default()
            .push(StoredVersion { id: id.clone(), entry });
        Ok(id)
    }
}

impl ObservationSource for MemoryBackend {
    fn observed_queries(&mut self, namespace: &str) -> Result<Vec<ObservedQuery>, StoreError> {
        let mut state = self.state.lock();
        state.check_transport()?;
        Ok(state.queries.get(namespace).cloned().unwrap_or_default())
    }

    fn clear_metrics(&mut self, namespace: &str) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        state.check_transport()?;
        let mut cleared = 0;
        if let Some(queries) = state.queries.get_mut(namespace) {
            for q in queries.iter_mut() {
                // one count sample and one mean sample per query
                cleared += 2;
                q.count = 0;
                q.mean_latency = 0.0;
            }
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_then_write_appends_version() {
        let mut backend = MemoryBackend::new();
        assert!(backend.read_latest("k", RuleEncoding::Stream).unwrap().is_none());

        let id = backend
            .read_then_write("k", RuleEncoding::Stream, &mut |current| {
                assert!(current.is_none());
                Ok(StoredEntry::Fields(vec![("rules.1.ttl".into(), "5m".into())]))
            })
            .unwrap();
        assert_eq!(id.as_str(), "1-0");

        let latest = backend.read_latest("k", RuleEncoding::Stream).unwrap().unwrap();
        assert_eq!(latest.id, id);
        assert_eq!(backend.version_count("k"), 1);
    }

    #[test]
    fn test_failed_decision_writes_nothing() {
        let mut backend = MemoryBackend::new();
        let result = backend.read_then_write("k", RuleEncoding::Stream, &mut |_| {
            Err(StoreError::OutOfSync { index: 1, len: 0 })
        });
        assert!(matches!(result, Err(StoreError::OutOfSync { .. })));
        assert_eq!(backend.version_count("k"), 0);
    }

    #[test]
    fn test_injected_transport_failure() {
        let mut backend = MemoryBackend::new();
        backend.fail_next(1);
        assert!(backend.read_latest("k", RuleEncoding::Stream).unwrap_err().is_transport());
        assert!(backend.read_latest("k", RuleEncoding::Stream).is_ok());
    }

    #[test]
    fn test_clones_share_state() {
        let handle = MemoryBackend::new();
        let mut owned = handle.clone();
        owned
            .read_then_write("k", RuleEncoding::Document, &mut |_| {
                Ok(StoredEntry::Document(r#"{"rules":[]}"#.into()))
            })
            .unwrap();
        assert_eq!(handle.history("k").len(), 1);
    }

    #[test]
    fn test_observed_tables_derived_from_queries() {
        let mut backend = MemoryBackend::new().with_queries(
            "ns",
            vec![ObservedQuery {
                id: "1".into(),
                table_csv: "orders,items".into(),
                sql: "select".into(),
                count: 4,
                mean_latency: 2.0,
            }],
        );
        let tables = backend.observed_tables("ns").unwrap();
        assert_eq!(tables.len(), 2);
        assert!(backend.observed_tables("other").unwrap().is_empty());
        assert_eq!(backend.clear_metrics("ns").unwrap(), 2);
    }
}

//! Rule store client.
//!
//! Reads and commits whole rule lists for a namespace. Every commit is a
//! read-decide-write executed through `RuleBackend::read_then_write`, so the
//! list a change is applied to is the list that gets replaced.

use log::{debug, error, info, warn};
use rule_engine::{
    decode_document, decode_log_entry, encode_document, encode_log_entry, Rule,
};
use std::collections::BTreeMap;

use crate::backend::{RuleBackend, StoredEntry, StoredVersion, VersionId};
use crate::config::{config_key, RuleEncoding};
use crate::error::StoreError;

// ================================================================================================
// SNAPSHOTS
// ================================================================================================

/// What the latest version under a namespace says about its rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    /// Nothing has ever been committed.
    Missing,
    /// An empty list was committed on purpose.
    Cleared,
    Populated,
}

/// Latest committed rule list together with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSnapshot {
    pub version: Option<VersionId>,
    pub rules: Vec<Rule>,
    pub state: SnapshotState,
}

impl RuleSnapshot {
    fn missing() -> Self {
        Self {
            version: None,
            rules: Vec::new(),
            state: SnapshotState::Missing,
        }
    }
}

fn decode_version(stored: &StoredVersion) -> Result<RuleSnapshot, StoreError> {
    let (rules, cleared) = match &stored.entry {
        StoredEntry::Fields(fields) => {
            let entry = decode_log_entry(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            if !entry.warnings.is_empty() {
                warn!(
                    "Version {} decoded with {} skipped field(s)",
                    stored.id,
                    entry.warnings.len()
                );
            }
            (entry.rules, entry.cleared)
        }
        StoredEntry::Document(doc) => {
            let rules = decode_document(doc)?;
            let cleared = rules.is_empty();
            (rules, cleared)
        }
    };

    let state = if cleared {
        SnapshotState::Cleared
    } else {
        SnapshotState::Populated
    };
    Ok(RuleSnapshot {
        version: Some(stored.id.clone()),
        rules,
        state,
    })
}

fn encode_version(rules: &[Rule], encoding: RuleEncoding) -> Result<StoredEntry, StoreError> {
    match encoding {
        RuleEncoding::Stream => Ok(StoredEntry::Fields(encode_log_entry(rules))),
        RuleEncoding::Document => Ok(StoredEntry::Document(encode_document(rules)?)),
    }
}

// ================================================================================================
// RECONCILIATION
// ================================================================================================

/// Applies one batch of changes to `current`.
///
/// Update and delete indices refer to positions in `current`. Any index out
/// of range fails the whole batch with `OutOfSync`. Updates are applied in
/// place, deletes from the highest index down, and each add is inserted at
/// the front, so the last add ends up first.
pub fn apply_changes(
    mut current: Vec<Rule>,
    adds: &[Rule],
    updates: &BTreeMap<usize, Rule>,
    deletes: &BTreeMap<usize, Rule>,
) -> Result<Vec<Rule>, StoreError> {
    let len = current.len();
    if let Some(&index) = updates.keys().chain(deletes.keys()).find(|&&i| i >= len) {
        return Err(StoreError::OutOfSync { index, len });
    }

    for (&index, rule) in updates {
        current[index] = rule.clone();
    }

    for (&index, expected) in deletes.iter().rev() {
        if &current[index] != expected {
            warn!(
                "Rule at index {} changed since it was read ({} instead of {}); deleting anyway",
                index,
                current[index].describe_match(),
                expected.describe_match()
            );
        }
        current.remove(index);
    }

    for rule in adds {
        current.insert(0, rule.clone());
    }
    Ok(current)
}

// ================================================================================================
// STORE CLIENT
// ================================================================================================

/// Session handle on the rule lists in a backing store.
pub struct RuleStore<B: RuleBackend> {
    backend: B,
    encoding: RuleEncoding,
}

impl<B: RuleBackend> RuleStore<B> {
    pub fn new(backend: B, encoding: RuleEncoding) -> Self {
        Self { backend, encoding }
    }

    pub fn encoding(&self) -> RuleEncoding {
        self.encoding
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Latest version for `namespace`, distinguishing a never-written list
    /// from one that was cleared.
    pub fn read_snapshot(&mut self, namespace: &str) -> Result<RuleSnapshot, StoreError> {
        let key = config_key(namespace);
        let snapshot = match self.backend.read_latest(&key, self.encoding)? {
            Some(stored) => decode_version(&stored)?,
            None => RuleSnapshot::missing(),
        };
        debug!(
            "Read {} rule(s) from {} ({:?})",
            snapshot.rules.len(),
            key,
            snapshot.state
        );
        Ok(snapshot)
    }

    /// Latest committed rules for `namespace`; empty when nothing exists.
    pub fn read_latest_rules(&mut self, namespace: &str) -> Result<Vec<Rule>, StoreError> {
        Ok(self.read_snapshot(namespace)?.rules)
    }

    /// Prepends `rules` to the latest list and commits the result.
    pub fn commit_append(&mut self, rules: &[Rule], namespace: &str) -> Result<VersionId, StoreError> {
        // a single front insert of the whole batch keeps its order
        self.commit_with(namespace, |mut current| {
            let mut next = rules.to_vec();
            next.append(&mut current);
            Ok(next)
        })
    }

    /// Re-reads the latest list, applies the batch with `apply_changes` and
    /// commits the outcome as a new version. Nothing is written on error.
    pub fn reconcile_and_commit(
        &mut self,
        adds: &[Rule],
        updates: &BTreeMap<usize, Rule>,
        deletes: &BTreeMap<usize, Rule>,
        namespace: &str,
    ) -> Result<VersionId, StoreError> {
        self.commit_with(namespace, |current| apply_changes(current, adds, updates, deletes))
    }

    /// Replaces the whole list, regardless of what is stored.
    pub fn commit_all(&mut self, rules: &[Rule], namespace: &str) -> Result<VersionId, StoreError> {
        self.commit_with(namespace, |_| Ok(rules.to_vec()))
    }

    fn commit_with<F>(&mut self, namespace: &str, mut change: F) -> Result<VersionId, StoreError>
    where
        F: FnMut(Vec<Rule>) -> Result<Vec<Rule>, StoreError>,
    {
        let key = config_key(namespace);
        let encoding = self.encoding;
        let mut committed_len = 0;

        let result = self.backend.read_then_write(&key, encoding, &mut |latest| {
            let current = match latest {
                Some(stored) => decode_version(stored)?.rules,
                None => Vec::new(),
            };
            let next = change(current)?;
            committed_len = next.len();
            encode_version(&next, encoding)
        });

        match &result {
            Ok(version) => info!(
                "Committed {} rule(s) to {} as version {}",
                committed_len, key, version
            ),
            Err(e) if e.is_out_of_sync() => warn!("Commit to {} rejected: {}", key, e),
            Err(e) => error!("Commit to {} failed: {}", key, e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn rule(name: &str) -> Rule {
        Rule::for_table(name, "5m")
    }

    fn store(encoding: RuleEncoding) -> (MemoryBackend, RuleStore<MemoryBackend>) {
        let backend = MemoryBackend::new();
        (backend.clone(), RuleStore::new(backend, encoding))
    }

    #[test]
    fn test_apply_changes_delete_then_add() {
        let current = vec![rule("a"), rule("b"), rule("c")];
        let deletes = BTreeMap::from([(2, rule("c")), (0, rule("a"))]);
        let next = apply_changes(current, &[rule("new")], &BTreeMap::new(), &deletes).unwrap();
        assert_eq!(next, vec![rule("new"), rule("b")]);
    }

    #[test]
    fn test_apply_changes_adds_reverse_order() {
        let next = apply_changes(
            vec![rule("old")],
            &[rule("x"), rule("y")],
            &BTreeMap::new(),
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(next, vec![rule("y"), rule("x"), rule("old")]);
    }

    #[test]
    fn test_apply_changes_rejects_stale_indices() {
        let updates = BTreeMap::from([(3, rule("z"))]);
        let err = apply_changes(vec![rule("a")], &[], &updates, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, StoreError::OutOfSync { index: 3, len: 1 }));

        let deletes = BTreeMap::from([(1, rule("b"))]);
        let err = apply_changes(vec![rule("a")], &[], &BTreeMap::new(), &deletes).unwrap_err();
        assert!(err.is_out_of_sync());
    }

    #[test]
    fn test_read_missing_namespace() {
        let (_, mut store) = store(RuleEncoding::Stream);
        let snapshot = store.read_snapshot("app").unwrap();
        assert_eq!(snapshot.state, SnapshotState::Missing);
        assert!(snapshot.rules.is_empty());
        assert!(snapshot.version.is_none());
    }

    #[test]
    fn test_commit_append_prepends_batch() {
        let (backend, mut store) = store(RuleEncoding::Stream);
        store.commit_append(&[rule("a")], "app").unwrap();
        let version = store.commit_append(&[rule("b"), rule("c")], "app").unwrap();

        let snapshot = store.read_snapshot("app").unwrap();
        assert_eq!(snapshot.rules, vec![rule("b"), rule("c"), rule("a")]);
        assert_eq!(snapshot.version, Some(version));
        assert_eq!(snapshot.state, SnapshotState::Populated);
        assert_eq!(backend.version_count("app:config"), 2);
    }

    #[test]
    fn test_out_of_sync_writes_nothing() {
        let (backend, mut store) = store(RuleEncoding::Stream);
        store.commit_append(&[rule("a")], "app").unwrap();

        let updates = BTreeMap::from([(1, rule("b"))]);
        let err = store
            .reconcile_and_commit(&[], &updates, &BTreeMap::new(), "app")
            .unwrap_err();
        assert!(err.is_out_of_sync());
        assert_eq!(backend.version_count("app:config"), 1);
        assert_eq!(store.read_latest_rules("app").unwrap(), vec![rule("a")]);
    }

    #[test]
    fn test_empty_commit_writes_sentinel() {
        let (backend, mut store) = store(RuleEncoding::Stream);
        store.commit_append(&[rule("a")], "app").unwrap();
        let deletes = BTreeMap::from([(0, rule("a"))]);
        store
            .reconcile_and_commit(&[], &BTreeMap::new(), &deletes, "app")
            .unwrap();

        let latest = backend.history("app:config").pop().unwrap();
        assert_eq!(
            latest.entry,
            StoredEntry::Fields(vec![("rules.1.ttl".to_string(), "0s".to_string())])
        );
        let snapshot = store.read_snapshot("app").unwrap();
        assert_eq!(snapshot.state, SnapshotState::Cleared);
        assert!(snapshot.rules.is_empty());
    }

    #[test]
    fn test_document_encoding_commit_and_clear() {
        let (backend, mut store) = store(RuleEncoding::Document);
        store.commit_all(&[rule("a"), rule("b")], "app").unwrap();
        assert_eq!(store.read_latest_rules("app").unwrap(), vec![rule("a"), rule("b")]);
        assert!(matches!(
            backend.history("app:config")[0].entry,
            StoredEntry::Document(_)
        ));

        store.commit_all(&[], "app").unwrap();
        assert_eq!(store.read_snapshot("app").unwrap().state, SnapshotState::Cleared);
    }

    #[test]
    fn test_transport_error_propagates() {
        let (backend, mut store) = store(RuleEncoding::Stream);
        backend.fail_next(1);
        let err = store.commit_append(&[rule("a")], "app").unwrap_err();
        assert!(err.is_transport());
        assert_eq!(backend.version_count("app:config"), 0);
    }

    #[test]
    fn test_malformed_fields_are_skipped() {
        let (backend, mut store) = store(RuleEncoding::Stream);
        backend.seed(
            "app:config",
            RuleEncoding::Stream,
            StoredEntry::Fields(vec![
                ("rules.1.ttl".into(), "5m".into()),
                ("rules.1.tables-any.1".into(), "orders".into()),
                ("rules.x.ttl".into(), "1m".into()),
            ]),
        );
        let rules = store.read_latest_rules("app").unwrap();
        assert_eq!(rules, vec![Rule::for_table("orders", "5m")]);
    }
}

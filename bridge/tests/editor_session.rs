//! End-to-end editing sessions against the in-memory backend.

use bridge::backend::{StoredEntry, StoredVersion};
use bridge::{
    MemoryBackend, RowStatus, RuleBackend, RuleEncoding, RuleSetEditor, RuleStore, SnapshotState,
    StoreError, VersionId,
};
use rule_engine::{resolve_queries, ObservedQuery, Rule};
use std::collections::BTreeMap;

const NS: &str = "shop";
const KEY: &str = "shop:config";

fn rule(name: &str) -> Rule {
    Rule::for_table(name, "5m")
}

fn seeded(encoding: RuleEncoding, rules: &[Rule]) -> (MemoryBackend, RuleStore<MemoryBackend>) {
    let backend = MemoryBackend::new();
    let mut store = RuleStore::new(backend.clone(), encoding);
    if !rules.is_empty() {
        store.commit_all(rules, NS).unwrap();
    }
    (backend, store)
}

#[test]
fn test_delete_two_and_add_one() {
    let (_, store) = seeded(RuleEncoding::Stream, &[rule("a"), rule("b"), rule("c")]);
    let mut editor = RuleSetEditor::open(store, NS).unwrap();

    editor.propose_delete(2).unwrap();
    editor.propose_delete(0).unwrap();
    editor.propose_add(rule("new")).unwrap();
    editor.commit().unwrap();

    assert_eq!(editor.baseline(), &[rule("new"), rule("b")]);
    assert!(!editor.has_pending_changes());
}

#[test]
fn test_commit_preserves_add_order_and_updates() {
    let (backend, store) = seeded(RuleEncoding::Stream, &[rule("a"), rule("b")]);
    let mut editor = RuleSetEditor::open(store, NS).unwrap();

    editor.propose_add(rule("x")).unwrap();
    editor.propose_add(rule("y")).unwrap();
    // rows: [y, x, a, b]
    editor.propose_update(3, Rule::for_query("q1", "1h")).unwrap();
    let version = editor.commit().unwrap().unwrap();

    assert_eq!(
        editor.rows(),
        &[rule("y"), rule("x"), rule("a"), Rule::for_query("q1", "1h")]
    );
    assert_eq!(editor.version(), Some(&version));
    assert_eq!(backend.version_count(KEY), 2);
}

#[test]
fn test_concurrent_shrink_is_out_of_sync() {
    let (backend, store) = seeded(RuleEncoding::Stream, &[rule("a"), rule("b"), rule("c")]);
    let mut editor = RuleSetEditor::open(store, NS).unwrap();
    editor.propose_update(2, rule("z")).unwrap();

    // another session deletes two rules in the meantime
    let mut other = RuleStore::new(backend.clone(), RuleEncoding::Stream);
    other
        .reconcile_and_commit(
            &[],
            &BTreeMap::new(),
            &BTreeMap::from([(1, rule("b")), (2, rule("c"))]),
            NS,
        )
        .unwrap();
    let versions = backend.version_count(KEY);

    let err = editor.commit().unwrap_err();
    assert!(matches!(err, StoreError::OutOfSync { index: 2, len: 1 }));
    assert_eq!(backend.version_count(KEY), versions);
    assert_eq!(editor.row_status(2), Some(RowStatus::Updated));

    editor.refresh().unwrap();
    assert_eq!(editor.rows(), &[rule("a")]);
    assert!(!editor.has_pending_changes());
}

#[test]
fn test_clearing_all_rules_is_distinguishable() {
    for encoding in [RuleEncoding::Stream, RuleEncoding::Document] {
        let (_, mut fresh) = seeded(encoding, &[]);
        assert_eq!(fresh.read_snapshot(NS).unwrap().state, SnapshotState::Missing);

        let (_, store) = seeded(encoding, &[rule("a")]);
        let mut editor = RuleSetEditor::open(store, NS).unwrap();
        editor.propose_delete(0).unwrap();
        editor.commit().unwrap();

        let mut store = editor.into_store();
        let snapshot = store.read_snapshot(NS).unwrap();
        assert!(snapshot.rules.is_empty());
        assert_eq!(snapshot.state, SnapshotState::Cleared);
    }
}

#[test]
fn test_revert_then_commit_is_noop() {
    let (backend, store) = seeded(RuleEncoding::Document, &[rule("a"), rule("b")]);
    let mut editor = RuleSetEditor::open(store, NS).unwrap();

    editor.propose_update(0, rule("z")).unwrap();
    editor.propose_delete(1).unwrap();
    editor.revert(0).unwrap();
    editor.revert(1).unwrap();

    assert_eq!(editor.rows(), &[rule("a"), rule("b")]);
    assert_eq!(editor.commit().unwrap(), None);
    assert_eq!(backend.version_count(KEY), 1);
}

#[test]
fn test_pending_rule_annotation() {
    let (_, mut store) = seeded(RuleEncoding::Stream, &[Rule::new("1m")]);
    let observed = vec![
        ObservedQuery {
            id: "q1".into(),
            table_csv: "orders,customers".into(),
            sql: "SELECT * FROM orders JOIN customers".into(),
            count: 12,
            mean_latency: 3.5,
        },
        ObservedQuery {
            id: "q2".into(),
            table_csv: "items".into(),
            sql: "SELECT * FROM items".into(),
            count: 2,
            mean_latency: 1.0,
        },
    ];
    let rules = store.read_latest_rules(NS).unwrap();
    let mut queries = resolve_queries(NS, observed, &rules);
    assert!(queries.iter().all(|q| q.current_ttl() == "1m"));

    let mut editor = RuleSetEditor::open(store, NS).unwrap();
    editor.propose_add(Rule::new("5m").with_tables_any(["orders"])).unwrap();
    editor.annotate_pending(&mut queries);

    assert_eq!(queries[0].pending_ttl(), "5m");
    assert_eq!(queries[1].pending_ttl(), "");
    assert_eq!(queries[0].key, "shop:queries:q1");
}

#[test]
fn test_transport_failure_keeps_pending_state() {
    let (backend, store) = seeded(RuleEncoding::Stream, &[rule("a")]);
    let mut editor = RuleSetEditor::open(store, NS).unwrap();
    editor.propose_add(rule("b")).unwrap();

    backend.fail_next(1);
    assert!(editor.commit().unwrap_err().is_transport());
    assert!(editor.has_pending_changes());

    editor.commit().unwrap();
    assert_eq!(editor.rows(), &[rule("b"), rule("a")]);
}

/// Loses the connection right after every successful write.
struct DropAfterWrite(MemoryBackend);

impl RuleBackend for DropAfterWrite {
    fn read_latest(
        &mut self,
        key: &str,
        encoding: RuleEncoding,
    ) -> Result<Option<StoredVersion>, StoreError> {
        self.0.read_latest(key, encoding)
    }

    fn read_then_write(
        &mut self,
        key: &str,
        encoding: RuleEncoding,
        decide: &mut dyn FnMut(Option<&StoredVersion>) -> Result<StoredEntry, StoreError>,
    ) -> Result<VersionId, StoreError> {
        let version = self.0.read_then_write(key, encoding, decide)?;
        self.0.fail_next(1);
        Ok(version)
    }
}

#[test]
fn test_failed_reload_after_commit_does_not_replay_changes() {
    let (backend, _) = seeded(RuleEncoding::Stream, &[rule("a"), rule("b"), rule("c")]);
    let store = RuleStore::new(DropAfterWrite(backend.clone()), RuleEncoding::Stream);
    let mut editor = RuleSetEditor::open(store, NS).unwrap();

    editor.propose_delete(2).unwrap();
    editor.propose_add(rule("new")).unwrap();
    let version = editor.commit().unwrap();
    assert!(version.is_some());
    assert!(!editor.has_pending_changes());
    assert_eq!(editor.rows(), &[rule("new"), rule("a"), rule("b")]);
    assert_eq!(editor.version(), version.as_ref());

    // a second commit has nothing left to apply
    assert_eq!(editor.commit().unwrap(), None);
    assert_eq!(backend.version_count(KEY), 2);

    let mut reader = RuleStore::new(backend, RuleEncoding::Stream);
    assert_eq!(
        reader.read_latest_rules(NS).unwrap(),
        vec![rule("new"), rule("a"), rule("b")]
    );
}

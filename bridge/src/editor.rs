//! Rule set editing session.
//!
//! The editor holds a working copy of the committed list. New rows live at
//! the front of the working copy, most recent first; every other row maps to
//! a baseline index. Pending updates and deletes are tracked per baseline
//! index and folded into one `reconcile_and_commit` call on commit.

use log::{debug, info, warn};
use rule_engine::{match_query, Query, Rule, ValidationError};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

use crate::backend::{RuleBackend, VersionId};
use crate::error::StoreError;
use crate::store::{apply_changes, RuleStore};

/// Rejected editor proposals. Nothing changes in the session when one is
/// returned.
#[derive(Debug, Error)]
pub enum EditError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("no row {index} (session has {len} rows)")]
    NoSuchRow { index: usize, len: usize },
}

/// Display state of one working-copy row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Current,
    New,
    Updated,
    Deleted,
}

enum Row {
    New(usize),
    Baseline(usize),
}

/// One editing session over the rule list of a namespace.
pub struct RuleSetEditor<B: RuleBackend> {
    store: RuleStore<B>,
    namespace: String,
    baseline: Vec<Rule>,
    version: Option<VersionId>,
    rows: Vec<Rule>,
    new_count: usize,
    /// Baseline index -> fingerprint of the rule before the edit.
    pending_updates: BTreeMap<usize, u64>,
    pending_deletes: BTreeSet<usize>,
    backups: HashMap<u64, Rule>,
}

impl<B: RuleBackend> RuleSetEditor<B> {
    /// Starts a session by reading the latest list for `namespace`.
    pub fn open(store: RuleStore<B>, namespace: impl Into<String>) -> Result<Self, StoreError> {
        let mut editor = Self {
            store,
            namespace: namespace.into(),
            baseline: Vec::new(),
            version: None,
            rows: Vec::new(),
            new_count: 0,
            pending_updates: BTreeMap::new(),
            pending_deletes: BTreeSet::new(),
            backups: HashMap::new(),
        };
        editor.refresh()?;
        Ok(editor)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Working copy, new rows first.
    pub fn rows(&self) -> &[Rule] {
        &self.rows
    }

    pub fn baseline(&self) -> &[Rule] {
        &self.baseline
    }

    /// Version the baseline was read from; `None` if nothing was committed yet.
    pub fn version(&self) -> Option<&VersionId> {
        self.version.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut RuleStore<B> {
        &mut self.store
    }

    pub fn into_store(self) -> RuleStore<B> {
        self.store
    }

    pub fn has_pending_changes(&self) -> bool {
        self.new_count > 0 || !self.pending_updates.is_empty() || !self.pending_deletes.is_empty()
    }

    pub fn row_status(&self, index: usize) -> Option<RowStatus> {
        let status = match self.locate(index).ok()? {
            Row::New(_) => RowStatus::New,
            Row::Baseline(b) if self.pending_deletes.contains(&b) => RowStatus::Deleted,
            Row::Baseline(b) if self.pending_updates.contains_key(&b) => RowStatus::Updated,
            Row::Baseline(_) => RowStatus::Current,
        };
        Some(status)
    }

    fn locate(&self, index: usize) -> Result<Row, EditError> {
        if index >= self.rows.len() {
            return Err(EditError::NoSuchRow {
                index,
                len: self.rows.len(),
            });
        }
        if index < self.new_count {
            Ok(Row::New(index))
        } else {
            Ok(Row::Baseline(index - self.new_count))
        }
    }

    // ============================================================================================
    // PROPOSALS
    // ============================================================================================

    /// Inserts an uncommitted rule at the front of the working copy.
    pub fn propose_add(&mut self, rule: Rule) -> Result<(), EditError> {
        rule.validate()?;
        self.rows.insert(0, rule);
        self.new_count += 1;
        Ok(())
    }

    /// Replaces the rule at `index`. A pending delete on the row is cancelled.
    pub fn propose_update(&mut self, index: usize, rule: Rule) -> Result<(), EditError> {
        rule.validate()?;
        match self.locate(index)? {
            Row::New(i) => self.rows[i] = rule,
            Row::Baseline(b) => {
                if !self.pending_updates.contains_key(&b) {
                    let original = self.rows[index].clone();
                    let fingerprint = original.content_hash();
                    self.backups.entry(fingerprint).or_insert(original);
                    self.pending_updates.insert(b, fingerprint);
                }
                self.pending_deletes.remove(&b);
                self.rows[index] = rule;
            }
        }
        Ok(())
    }

    /// Marks the rule at `index` for deletion. New rows are dropped at once,
    /// which shifts the rows after them up by one.
    pub fn propose_delete(&mut self, index: usize) -> Result<(), EditError> {
        match self.locate(index)? {
            Row::New(i) => {
                self.rows.remove(i);
                self.new_count -= 1;
            }
            Row::Baseline(b) => {
                self.restore(index, b);
                self.pending_deletes.insert(b);
            }
        }
        Ok(())
    }

    /// Undoes the pending change on `index`. Reverting a new row discards it.
    pub fn revert(&mut self, index: usize) -> Result<(), EditError> {
        match self.locate(index)? {
            Row::New(i) => {
                self.rows.remove(i);
                self.new_count -= 1;
            }
            Row::Baseline(b) => {
                self.pending_deletes.remove(&b);
                self.restore(index, b);
            }
        }
        Ok(())
    }

    fn restore(&mut self, index: usize, b: usize) {
        let Some(fingerprint) = self.pending_updates.remove(&b) else {
            return;
        };
        let original = match self.backups.get(&fingerprint) {
            Some(rule) => rule.clone(),
            None => self.baseline[b].clone(),
        };
        self.rows[index] = original;
        let pending = &self.pending_updates;
        self.backups.retain(|hash, _| pending.values().any(|h| h == hash));
    }

    // ============================================================================================
    // QUERIES AGAINST PENDING STATE
    // ============================================================================================

    /// First new or updated rule that would match `query`.
    pub fn pending_rule_for(&self, query: &Query) -> Option<&Rule> {
        let subject = query.subject();
        self.rows
            .iter()
            .enumerate()
            .filter(|(i, _)| matches!(self.row_status(*i), Some(RowStatus::New | RowStatus::Updated)))
            .find_map(|(_, rule)| match_query(&subject, std::slice::from_ref(rule)))
    }

    /// Fills `pending_rule` on every row of `queries`.
    pub fn annotate_pending(&self, queries: &mut [Query]) {
        for query in queries.iter_mut() {
            query.pending_rule = self.pending_rule_for(query).cloned();
        }
    }

    // ============================================================================================
    // COMMIT
    // ============================================================================================

    fn clear_pending(&mut self) {
        self.new_count = 0;
        self.pending_updates.clear();
        self.pending_deletes.clear();
        self.backups.clear();
    }

    /// Drops all pending state and re-reads the baseline.
    pub fn refresh(&mut self) -> Result<(), StoreError> {
        let snapshot = self.store.read_snapshot(&self.namespace)?;
        self.baseline = snapshot.rules;
        self.version = snapshot.version;
        self.rows = self.baseline.clone();
        self.clear_pending();
        debug!(
            "Editor for {} loaded {} rule(s)",
            self.namespace,
            self.baseline.len()
        );
        Ok(())
    }

    /// Commits every pending change as one new version and reloads the
    /// baseline. Returns `None` when there was nothing to commit. If the
    /// commit fails the pending changes are kept so the caller can refresh or
    /// retry. Once the version is stored they are always cleared; if the
    /// reload then fails the baseline is the committed list as computed
    /// locally.
    pub fn commit(&mut self) -> Result<Option<VersionId>, StoreError> {
        if !self.has_pending_changes() {
            return Ok(None);
        }

        // reconcile inserts each add at the front, so oldest goes first
        let adds: Vec<Rule> = self.rows[..self.new_count].iter().rev().cloned().collect();
        let updates: BTreeMap<usize, Rule> = self
            .pending_updates
            .keys()
            .map(|&b| (b, self.rows[self.new_count + b].clone()))
            .collect();
        let deletes: BTreeMap<usize, Rule> = self
            .pending_deletes
            .iter()
            .map(|&b| (b, self.baseline[b].clone()))
            .collect();

        let version = self
            .store
            .reconcile_and_commit(&adds, &updates, &deletes, &self.namespace)?;
        info!(
            "Editor for {} committed {} add(s), {} update(s), {} delete(s)",
            self.namespace,
            adds.len(),
            updates.len(),
            deletes.len()
        );

        // the version is stored; pending state must not outlive it even if
        // the reload below fails
        if let Ok(expected) = apply_changes(self.baseline.clone(), &adds, &updates, &deletes) {
            self.baseline = expected;
        }
        self.clear_pending();
        self.rows = self.baseline.clone();
        self.version = Some(version.clone());
        if let Err(e) = self.refresh() {
            warn!(
                "Editor for {} committed version {} but could not reload it: {}",
                self.namespace, version, e
            );
        }
        Ok(Some(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::RuleEncoding;

    fn rule(name: &str) -> Rule {
        Rule::for_table(name, "5m")
    }

    fn editor_with(rules: &[Rule]) -> RuleSetEditor<MemoryBackend> {
        let mut store = RuleStore::new(MemoryBackend::new(), RuleEncoding::Stream);
        if !rules.is_empty() {
            store.commit_all(rules, "app").unwrap();
        }
        RuleSetEditor::open(store, "app").unwrap()
    }

    #[test]
    fn test_add_goes_to_front() {
        let mut editor = editor_with(&[rule("a")]);
        editor.propose_add(rule("x")).unwrap();
        editor.propose_add(rule("y")).unwrap();
        assert_eq!(editor.rows(), &[rule("y"), rule("x"), rule("a")]);
        assert_eq!(editor.row_status(0), Some(RowStatus::New));
        assert_eq!(editor.row_status(2), Some(RowStatus::Current));
    }

    #[test]
    fn test_invalid_rule_is_rejected() {
        let mut editor = editor_with(&[]);
        let err = editor.propose_add(Rule::new("soon")).unwrap_err();
        assert!(matches!(err, EditError::Invalid(ValidationError::InvalidDuration(_))));
        assert!(!editor.has_pending_changes());
    }

    #[test]
    fn test_update_cancels_delete() {
        let mut editor = editor_with(&[rule("a"), rule("b")]);
        editor.propose_delete(1).unwrap();
        assert_eq!(editor.row_status(1), Some(RowStatus::Deleted));
        editor.propose_update(1, rule("c")).unwrap();
        assert_eq!(editor.row_status(1), Some(RowStatus::Updated));
    }

    #[test]
    fn test_delete_restores_updated_row() {
        let mut editor = editor_with(&[rule("a")]);
        editor.propose_update(0, rule("b")).unwrap();
        editor.propose_delete(0).unwrap();
        assert_eq!(editor.rows()[0], rule("a"));
        assert_eq!(editor.row_status(0), Some(RowStatus::Deleted));
    }

    #[test]
    fn test_revert_update_uses_backup() {
        let mut editor = editor_with(&[rule("a")]);
        editor.propose_update(0, rule("b")).unwrap();
        editor.propose_update(0, rule("c")).unwrap();
        editor.revert(0).unwrap();
        assert_eq!(editor.rows()[0], rule("a"));
        assert!(!editor.has_pending_changes());
    }

    #[test]
    fn test_delete_new_row_renumbers() {
        let mut editor = editor_with(&[rule("a")]);
        editor.propose_add(rule("x")).unwrap();
        editor.propose_add(rule("y")).unwrap();
        editor.propose_delete(0).unwrap();
        assert_eq!(editor.rows(), &[rule("x"), rule("a")]);
        assert_eq!(editor.row_status(1), Some(RowStatus::Current));
    }

    #[test]
    fn test_out_of_range_row() {
        let mut editor = editor_with(&[rule("a")]);
        assert!(matches!(
            editor.propose_delete(3),
            Err(EditError::NoSuchRow { index: 3, len: 1 })
        ));
        assert_eq!(editor.row_status(3), None);
    }

    #[test]
    fn test_commit_without_changes_is_noop() {
        let mut editor = editor_with(&[rule("a")]);
        assert_eq!(editor.commit().unwrap(), None);
    }
}

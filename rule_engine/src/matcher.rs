// Rule matching
//
// Rules are evaluated in list order and the first rule with any passing
// check wins. Index 0 of the list has the highest precedence. Per rule the
// checks run cheapest first:
//
// 1. exact tables    every observed table is accepted by `tables`
// 2. tables-all      every table in `tables_all` is observed
// 3. tables-any      some observed table is in `tables_any`
// 4. regex           pattern matches the SQL text
// 5. query ids       query id is listed
// 6. catch-all       rule has no criteria at all
//
// The exact-tables check is one-directional: it does not require the rule's
// tables to all be observed.

use regex::Regex;

use crate::rule::Rule;

// ============================================================================
// QUERY SUBJECT
// ============================================================================

/// The parts of an observed query the matcher looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySubject<'a> {
    pub tables: Vec<&'a str>,
    pub id: &'a str,
    pub sql: &'a str,
}

impl<'a> QuerySubject<'a> {
    /// Builds a subject from the comma-joined table list stored per query.
    ///
    /// The split keeps empty segments, so a query with no recorded tables
    /// carries a single empty table name and never passes the exact check
    /// of a rule that does not list `""`.
    pub fn from_csv(table_csv: &'a str, id: &'a str, sql: &'a str) -> Self {
        QuerySubject {
            tables: table_csv.split(',').collect(),
            id,
            sql,
        }
    }

    fn touches(&self, table: &str) -> bool {
        self.tables.iter().any(|t| *t == table)
    }
}

fn listed(list: &Option<Vec<String>>, value: &str) -> bool {
    list.as_ref()
        .map(|items| items.iter().any(|item| item == value))
        .unwrap_or(false)
}

fn query_checks_pass(rule: &Rule, subject: &QuerySubject<'_>, regex: Option<&Regex>) -> bool {
    if subject.tables.iter().all(|t| listed(&rule.tables, t)) {
        return true;
    }

    if let Some(all) = &rule.tables_all {
        if !all.is_empty() && all.iter().all(|t| subject.touches(t)) {
            return true;
        }
    }

    if subject.tables.iter().any(|t| listed(&rule.tables_any, t)) {
        return true;
    }

    if let Some(re) = regex {
        if re.is_match(subject.sql) {
            return true;
        }
    }

    if listed(&rule.query_ids, subject.id) {
        return true;
    }

    rule.is_catch_all()
}

/// Returns the position and rule of the first rule matching `subject`.
///
/// An unparseable regex counts as a non-match for that check only.
pub fn match_query_indexed<'r>(
    subject: &QuerySubject<'_>,
    rules: &'r [Rule],
) -> Option<(usize, &'r Rule)> {
    rules.iter().enumerate().find(|(_, rule)| {
        let compiled = rule.regex.as_deref().and_then(|p| Regex::new(p).ok());
        query_checks_pass(rule, subject, compiled.as_ref())
    })
}

/// Returns the first rule matching `subject`, or `None` when caching is off
/// for it.
pub fn match_query<'r>(subject: &QuerySubject<'_>, rules: &'r [Rule]) -> Option<&'r Rule> {
    match_query_indexed(subject, rules).map(|(_, rule)| rule)
}

// ============================================================================
// TABLE MATCHING
// ============================================================================

/// Returns the first rule applying to a single table.
///
/// Per rule: tables-any membership, catch-all, exact-tables membership,
/// tables-all membership. Regex and query-id criteria have no meaning for a
/// bare table name and are ignored.
pub fn match_table<'r>(table: &str, rules: &'r [Rule]) -> Option<&'r Rule> {
    rules.iter().find(|rule| {
        listed(&rule.tables_any, table)
            || rule.is_catch_all()
            || listed(&rule.tables, table)
            || listed(&rule.tables_all, table)
    })
}

// ============================================================================
// PRECOMPILED MATCHER
// ============================================================================

/// Matcher over a fixed rule list with regexes compiled once.
///
/// Use this when resolving many queries against the same snapshot.
#[derive(Debug)]
pub struct RuleMatcher<'r> {
    rules: &'r [Rule],
    compiled: Vec<Option<Regex>>,
}

impl<'r> RuleMatcher<'r> {
    pub fn new(rules: &'r [Rule]) -> Self {
        let compiled = rules
            .iter()
            .map(|rule| rule.regex.as_deref().and_then(|p| Regex::new(p).ok()))
            .collect();
        RuleMatcher { rules, compiled }
    }

    pub fn match_query(&self, subject: &QuerySubject<'_>) -> Option<&'r Rule> {
        self.rules
            .iter()
            .zip(&self.compiled)
            .find(|(rule, re)| query_checks_pass(rule, subject, re.as_ref()))
            .map(|(rule, _)| rule)
    }

    pub fn match_table(&self, table: &str) -> Option<&'r Rule> {
        match_table(table, self.rules)
    }

    pub fn rules(&self) -> &'r [Rule] {
        self.rules
    }
}

// Observed queries and tables, and the view rows built from them.
//
// The aggregation source reports raw statistics; the rows handed to the
// presentation layer additionally carry the rule currently in force and any
// rule proposed in the running session.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::matcher::{QuerySubject, RuleMatcher};
use crate::rule::Rule;

// ============================================================================
// RAW OBSERVATIONS
// ============================================================================

/// One query as reported by the aggregation source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedQuery {
    pub id: String,
    /// Comma-joined names of the tables the query touches.
    pub table_csv: String,
    pub sql: String,
    pub count: u64,
    /// Mean latency in milliseconds.
    pub mean_latency: f64,
}

/// One table as reported (or derived) by the aggregation source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedTable {
    pub name: String,
    pub access_frequency: u64,
    /// Average query time in milliseconds.
    pub avg_query_time: f64,
}

/// Rolls per-query statistics up to per-table statistics.
///
/// Access frequency is the sum of the counts of every query touching the
/// table; query time is the plain average of those queries' means. Output is
/// ordered by table name.
pub fn aggregate_tables(queries: &[ObservedQuery]) -> Vec<ObservedTable> {
    let mut acc: BTreeMap<&str, (u64, f64, u32)> = BTreeMap::new();
    for query in queries {
        for name in query.table_csv.split(',') {
            if name.is_empty() {
                continue;
            }
            let entry = acc.entry(name).or_insert((0, 0.0, 0));
            entry.0 += query.count;
            entry.1 += query.mean_latency;
            entry.2 += 1;
        }
    }

    acc.into_iter()
        .map(|(name, (count, total_mean, n))| ObservedTable {
            name: name.to_string(),
            access_frequency: count,
            avg_query_time: if n == 0 { 0.0 } else { total_mean / f64::from(n) },
        })
        .collect()
}

// ============================================================================
// VIEW ROWS
// ============================================================================

/// A query row with its resolved rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: String,
    /// Store key holding the cached results, `<namespace>:queries:<id>`.
    pub key: String,
    pub table_csv: String,
    pub sql: String,
    pub count: u64,
    pub mean_latency: f64,
    pub rule: Option<Rule>,
    pub pending_rule: Option<Rule>,
}

impl Query {
    pub fn subject(&self) -> QuerySubject<'_> {
        QuerySubject::from_csv(&self.table_csv, &self.id, &self.sql)
    }

    /// TTL currently in force, empty when the query is not cached.
    pub fn current_ttl(&self) -> &str {
        self.rule.as_ref().map(|r| r.ttl.as_str()).unwrap_or("")
    }

    pub fn pending_ttl(&self) -> &str {
        self.pending_rule.as_ref().map(|r| r.ttl.as_str()).unwrap_or("")
    }
}

/// A table row with its resolved rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub access_frequency: u64,
    pub avg_query_time: f64,
    pub rule: Option<Rule>,
}

impl Table {
    pub fn current_ttl(&self) -> &str {
        self.rule.as_ref().map(|r| r.ttl.as_str()).unwrap_or("")
    }
}

/// Resolves the rule in force for every observed query.
pub fn resolve_queries(namespace: &str, observed: Vec<ObservedQuery>, rules: &[Rule]) -> Vec<Query> {
    let matcher = RuleMatcher::new(rules);
    observed
        .into_iter()
        .map(|q| {
            let rule = matcher
                .match_query(&QuerySubject::from_csv(&q.table_csv, &q.id, &q.sql))
                .cloned();
            Query {
                key: format!("{}:queries:{}", namespace, q.id),
                id: q.id,
                table_csv: q.table_csv,
                sql: q.sql,
                count: q.count,
                mean_latency: q.mean_latency,
                rule,
                pending_rule: None,
            }
        })
        .collect()
}

/// Resolves the rule in force for every observed table.
pub fn resolve_tables(observed: Vec<ObservedTable>, rules: &[Rule]) -> Vec<Table> {
    let matcher = RuleMatcher::new(rules);
    observed
        .into_iter()
        .map(|t| Table {
            rule: matcher.match_table(&t.name).cloned(),
            name: t.name,
            access_frequency: t.access_frequency,
            avg_query_time: t.avg_query_time,
        })
        .collect()
}

// ============================================================================
// SORTING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn apply(self, ord: Ordering) -> Ordering {
        match self {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuerySortField {
    QueryTime,
    AccessFrequency,
    Tables,
    Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableSortField {
    QueryTime,
    AccessFrequency,
    Name,
}

pub fn sort_queries(queries: &mut [Query], field: QuerySortField, direction: SortDirection) {
    queries.sort_by(|a, b| {
        let ord = match field {
            QuerySortField::QueryTime => a.mean_latency.total_cmp(&b.mean_latency),
            QuerySortField::AccessFrequency => a.count.cmp(&b.count),
            QuerySortField::Tables => a.table_csv.cmp(&b.table_csv),
            QuerySortField::Id => a.id.cmp(&b.id),
        };
        direction.apply(ord)
    });
}

pub fn sort_tables(tables: &mut [Table], field: TableSortField, direction: SortDirection) {
    tables.sort_by(|a, b| {
        let ord = match field {
            TableSortField::QueryTime => a.avg_query_time.total_cmp(&b.avg_query_time),
            TableSortField::AccessFrequency => a.access_frequency.cmp(&b.access_frequency),
            TableSortField::Name => a.name.cmp(&b.name),
        };
        direction.apply(ord)
    });
}

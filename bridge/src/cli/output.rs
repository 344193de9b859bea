//! Output formatting utilities.

use rule_engine::{Query, Rule, Table as TableView};
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::cli::error::Result;
use crate::OutputFormat;

fn render<T: Tabled>(rows: Vec<T>, empty: &str) -> String {
    if rows.is_empty() {
        return empty.to_string();
    }
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    table.to_string()
}

fn json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Milliseconds with three decimals, as shown in every listing.
fn format_ms(ms: f64) -> String {
    format!("{:.3}", ms)
}

/// A query listing row.
#[derive(Tabled)]
pub struct QueryRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Tables")]
    pub tables: String,
    #[tabled(rename = "Count")]
    pub count: u64,
    #[tabled(rename = "Mean (ms)")]
    pub mean: String,
    #[tabled(rename = "TTL")]
    pub ttl: String,
    #[tabled(rename = "SQL")]
    pub sql: String,
}

impl From<&Query> for QueryRow {
    fn from(q: &Query) -> Self {
        Self {
            id: q.id.clone(),
            tables: q.table_csv.clone(),
            count: q.count,
            mean: format_ms(q.mean_latency),
            ttl: q.current_ttl().to_string(),
            sql: q.sql.clone(),
        }
    }
}

/// A table listing row.
#[derive(Tabled)]
pub struct TableRow {
    #[tabled(rename = "Table")]
    pub name: String,
    #[tabled(rename = "Accesses")]
    pub access_frequency: u64,
    #[tabled(rename = "Avg query (ms)")]
    pub avg_query_time: String,
    #[tabled(rename = "TTL")]
    pub ttl: String,
}

impl From<&TableView> for TableRow {
    fn from(t: &TableView) -> Self {
        Self {
            name: t.name.clone(),
            access_frequency: t.access_frequency,
            avg_query_time: format_ms(t.avg_query_time),
            ttl: t.current_ttl().to_string(),
        }
    }
}

/// A rule listing row.
#[derive(Tabled)]
pub struct RuleRow {
    #[tabled(rename = "#")]
    pub index: usize,
    #[tabled(rename = "Match")]
    pub criteria: String,
    #[tabled(rename = "TTL")]
    pub ttl: String,
}

pub fn format_queries(queries: &[Query], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(render(
            queries.iter().map(QueryRow::from).collect(),
            "(no queries)",
        )),
        OutputFormat::Json => json(queries),
    }
}

pub fn format_tables(tables: &[TableView], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(render(
            tables.iter().map(TableRow::from).collect(),
            "(no tables)",
        )),
        OutputFormat::Json => json(tables),
    }
}

pub fn format_rules(rules: &[Rule], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Table => {
            let rows = rules
                .iter()
                .enumerate()
                .map(|(index, rule)| RuleRow {
                    index,
                    criteria: rule.describe_match(),
                    ttl: rule.ttl.clone(),
                })
                .collect();
            Ok(render(rows, "(no rules)"))
        }
        OutputFormat::Json => json(rules),
    }
}

//! Command implementations.

use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};

use bridge::{ObservationSource, RedisBackend, RuleSetEditor, RuleStore, StoreConfig};
use clap::Args;
use rule_engine::{
    resolve_queries, resolve_tables, sort_queries, sort_tables, QuerySortField, Rule,
    SortDirection, TableSortField, ValidationError,
};

use crate::cli::error::{CliError, Result};
use crate::cli::output;
use crate::{DirectionArg, OutputFormat, QuerySortArg, TableSortArg};

/// Match criteria and TTL of a rule given on the command line.
#[derive(Args, Debug, Clone)]
pub struct RuleArgs {
    /// Cache duration, e.g. 300s, 5m, 1h
    #[arg(long)]
    pub ttl: String,

    /// Match queries whose tables are all in this list
    #[arg(long, value_delimiter = ',')]
    pub tables_exact: Option<Vec<String>>,

    /// Match queries touching any of these tables
    #[arg(long, value_delimiter = ',')]
    pub tables_any: Option<Vec<String>>,

    /// Match queries touching all of these tables
    #[arg(long, value_delimiter = ',')]
    pub tables_all: Option<Vec<String>>,

    /// Match these query ids
    #[arg(long, value_delimiter = ',')]
    pub query_ids: Option<Vec<String>>,

    /// Match queries whose SQL matches this pattern
    #[arg(long)]
    pub regex: Option<String>,

    /// Match every query
    #[arg(
        long,
        conflicts_with_all = ["tables_exact", "tables_any", "tables_all", "query_ids", "regex"]
    )]
    pub catch_all: bool,
}

impl RuleArgs {
    /// Builds and validates the rule. At least one criterion or `--catch-all`
    /// is required.
    pub fn to_rule(&self) -> std::result::Result<Rule, ValidationError> {
        let rule = Rule {
            tables: self.tables_exact.clone(),
            tables_any: self.tables_any.clone(),
            tables_all: self.tables_all.clone(),
            regex: self.regex.clone(),
            query_ids: self.query_ids.clone(),
            ttl: self.ttl.clone(),
        };
        if rule.is_catch_all() && !self.catch_all {
            return Err(ValidationError::NoCriteria);
        }
        rule.validate()?;
        Ok(rule)
    }
}

fn connect(config: &StoreConfig) -> Result<RuleStore<RedisBackend>> {
    let backend = RedisBackend::connect(config)?;
    Ok(RuleStore::new(backend, config.encoding))
}

/// Asks on stdin; anything but y/yes declines.
fn confirm(prompt: &str, yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    let accepted = matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes");
    if !accepted {
        println!("Aborted.");
    }
    Ok(accepted)
}

fn direction(arg: DirectionArg) -> SortDirection {
    match arg {
        DirectionArg::Asc => SortDirection::Asc,
        DirectionArg::Desc => SortDirection::Desc,
    }
}

// ================================================================================================
// LISTINGS
// ================================================================================================

pub fn list_queries(
    config: &StoreConfig,
    sort_by: QuerySortArg,
    sort_direction: DirectionArg,
    format: OutputFormat,
) -> Result<()> {
    let mut store = connect(config)?;
    let rules = store.read_latest_rules(&config.application)?;
    let observed = store.backend_mut().observed_queries(&config.application)?;

    let mut queries = resolve_queries(&config.application, observed, &rules);
    let field = match sort_by {
        QuerySortArg::QueryTime => QuerySortField::QueryTime,
        QuerySortArg::AccessFrequency => QuerySortField::AccessFrequency,
        QuerySortArg::Tables => QuerySortField::Tables,
        QuerySortArg::Id => QuerySortField::Id,
    };
    sort_queries(&mut queries, field, direction(sort_direction));

    println!("{}", output::format_queries(&queries, format)?);
    Ok(())
}

pub fn list_tables(
    config: &StoreConfig,
    sort_by: TableSortArg,
    sort_direction: DirectionArg,
    format: OutputFormat,
) -> Result<()> {
    let mut store = connect(config)?;
    let rules = store.read_latest_rules(&config.application)?;
    let observed = store.backend_mut().observed_tables(&config.application)?;

    let mut tables = resolve_tables(observed, &rules);
    let field = match sort_by {
        TableSortArg::QueryTime => TableSortField::QueryTime,
        TableSortArg::AccessFrequency => TableSortField::AccessFrequency,
        TableSortArg::Name => TableSortField::Name,
    };
    sort_tables(&mut tables, field, direction(sort_direction));

    println!("{}", output::format_tables(&tables, format)?);
    Ok(())
}

pub fn list_rules(config: &StoreConfig, format: OutputFormat) -> Result<()> {
    let mut store = connect(config)?;
    let rules = store.read_latest_rules(&config.application)?;
    println!("{}", output::format_rules(&rules, format)?);
    Ok(())
}

// ================================================================================================
// RULE CHANGES
// ================================================================================================

fn append_rule(config: &StoreConfig, rule: Rule, yes: bool) -> Result<()> {
    let prompt = format!(
        "Add rule [{}] with TTL {} to {}?",
        rule.describe_match(),
        rule.ttl,
        config.application
    );
    if !confirm(&prompt, yes)? {
        return Ok(());
    }
    let mut store = connect(config)?;
    let version = store.commit_append(&[rule], &config.application)?;
    println!("Rule added (version {}).", version);
    Ok(())
}

pub fn make_rule(config: &StoreConfig, args: &RuleArgs, yes: bool) -> Result<()> {
    append_rule(config, args.to_rule()?, yes)
}

pub fn set_query_ttl(config: &StoreConfig, id: &str, ttl: &str, yes: bool) -> Result<()> {
    let rule = Rule::for_query(id, ttl);
    rule.validate()?;
    append_rule(config, rule, yes)
}

pub fn set_table_ttl(config: &StoreConfig, name: &str, ttl: &str, yes: bool) -> Result<()> {
    let rule = Rule::for_table(name, ttl);
    rule.validate()?;
    append_rule(config, rule, yes)
}

pub fn update_rule(config: &StoreConfig, index: usize, args: &RuleArgs, yes: bool) -> Result<()> {
    let rule = args.to_rule()?;
    let mut editor = RuleSetEditor::open(connect(config)?, config.application.as_str())?;
    let current = editor
        .rows()
        .get(index)
        .map(Rule::describe_match)
        .unwrap_or_default();
    editor.propose_update(index, rule.clone())?;

    let prompt = format!(
        "Replace rule {} [{}] with [{}] TTL {}?",
        index,
        current,
        rule.describe_match(),
        rule.ttl
    );
    if !confirm(&prompt, yes)? {
        return Ok(());
    }
    if let Some(version) = editor.commit()? {
        println!("Rule {} updated (version {}).", index, version);
    }
    Ok(())
}

pub fn delete_rules(config: &StoreConfig, indices: &[usize], yes: bool) -> Result<()> {
    let unique: BTreeSet<usize> = indices.iter().copied().collect();
    if unique.len() != indices.len() {
        return Err(CliError::InvalidInput("rule positions must be distinct".to_string()));
    }

    let mut editor = RuleSetEditor::open(connect(config)?, config.application.as_str())?;
    for &index in &unique {
        editor.propose_delete(index)?;
    }

    let prompt = format!("Delete {} rule(s) from {}?", unique.len(), config.application);
    if !confirm(&prompt, yes)? {
        return Ok(());
    }
    if let Some(version) = editor.commit()? {
        println!("Deleted {} rule(s) (version {}).", unique.len(), version);
    }
    Ok(())
}

pub fn reset_config(config: &StoreConfig, yes: bool) -> Result<()> {
    let prompt = format!("Delete every rule of {}?", config.application);
    if !confirm(&prompt, yes)? {
        return Ok(());
    }
    let mut store = connect(config)?;
    let version = store.commit_all(&[], &config.application)?;
    println!("All rules deleted (version {}).", version);
    Ok(())
}

pub fn clear_metrics(config: &StoreConfig, yes: bool) -> Result<()> {
    let prompt = format!("Delete the query statistics of {}?", config.application);
    if !confirm(&prompt, yes)? {
        return Ok(());
    }
    let mut store = connect(config)?;
    let removed = store.backend_mut().clear_metrics(&config.application)?;
    println!("Removed {} sample(s).", removed);
    Ok(())
}

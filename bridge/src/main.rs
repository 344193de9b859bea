//! Smart Cache Command Line Interface
//!
//! Inspects observed queries and tables and manages the caching rules of an
//! application namespace.

mod cli;

use std::time::Duration;

use bridge::{RuleEncoding, StoreConfig};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cli::commands::{self, RuleArgs};
use crate::cli::error::Result;

/// Smart Cache Command Line Interface
///
/// Lists cached queries and tables and creates, updates and deletes the
/// rules that decide how long query results are cached.
#[derive(Parser, Debug)]
#[command(name = "smartcache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Redis host
    #[arg(short = 'n', long, env = "SMARTCACHE_HOST", default_value = "localhost", global = true)]
    pub host: String,

    /// Redis port
    #[arg(short, long, env = "SMARTCACHE_PORT", default_value_t = 6379, global = true)]
    pub port: u16,

    /// Redis user
    #[arg(short, long, env = "SMARTCACHE_USER", default_value = "default", global = true)]
    pub user: String,

    /// Redis password
    #[arg(short = 'a', long, env = "SMARTCACHE_PASSWORD", hide_env_values = true, global = true)]
    pub password: Option<String>,

    /// Application namespace
    #[arg(short = 's', long, env = "SMARTCACHE_APPLICATION", default_value = "smartcache", global = true)]
    pub application: String,

    /// Layout of the rule list in the store
    #[arg(long, value_enum, default_value = "stream", global = true)]
    pub encoding: EncodingArg,

    /// Timeout for connecting and for each store call
    #[arg(long, default_value_t = 5, global = true)]
    pub timeout_secs: u64,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    pub format: OutputFormat,

    /// Log store traffic and decisions to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            application: self.application.clone(),
            encoding: self.encoding.into(),
            timeout: Duration::from_secs(self.timeout_secs),
            ..StoreConfig::default()
        }
    }
}

/// Output format for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed table format
    Table,
    /// JSON format
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EncodingArg {
    /// Append-only stream of flattened versions
    Stream,
    /// Single JSON document
    Document,
}

impl From<EncodingArg> for RuleEncoding {
    fn from(arg: EncodingArg) -> Self {
        match arg {
            EncodingArg::Stream => RuleEncoding::Stream,
            EncodingArg::Document => RuleEncoding::Document,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum QuerySortArg {
    QueryTime,
    AccessFrequency,
    Tables,
    Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TableSortArg {
    QueryTime,
    AccessFrequency,
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DirectionArg {
    Asc,
    Desc,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List observed queries with the rule in force for each
    ListQueries {
        #[arg(long = "sort-by", alias = "sortby", value_enum, default_value = "query-time")]
        sort_by: QuerySortArg,

        #[arg(long = "sort-direction", alias = "sortDirection", value_enum, default_value = "desc")]
        sort_direction: DirectionArg,
    },

    /// List observed tables with the rule in force for each
    ListTables {
        #[arg(long = "sort-by", alias = "sortby", value_enum, default_value = "query-time")]
        sort_by: TableSortArg,

        #[arg(long = "sort-direction", alias = "sortDirection", value_enum, default_value = "desc")]
        sort_direction: DirectionArg,
    },

    /// List the committed rules in precedence order
    ListRules,

    /// Create a rule and put it in front of the existing ones
    MakeRule {
        #[command(flatten)]
        rule: RuleArgs,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Cache one query for the given TTL
    SetQueryTtl {
        /// Query id
        id: String,

        #[arg(long)]
        ttl: String,

        #[arg(short, long)]
        yes: bool,
    },

    /// Cache every query touching a table for the given TTL
    SetTableTtl {
        /// Table name
        name: String,

        #[arg(long)]
        ttl: String,

        #[arg(short, long)]
        yes: bool,
    },

    /// Replace the rule at a position shown by list-rules
    UpdateRule {
        index: usize,

        #[command(flatten)]
        rule: RuleArgs,

        #[arg(short, long)]
        yes: bool,
    },

    /// Delete the rules at positions shown by list-rules
    DeleteRule {
        #[arg(required = true)]
        indices: Vec<usize>,

        #[arg(short, long)]
        yes: bool,
    },

    /// Delete every rule
    ResetConfig {
        #[arg(short, long)]
        yes: bool,
    },

    /// Delete the recorded query statistics
    ClearMetrics {
        #[arg(short, long)]
        yes: bool,
    },
}

/// Installs the global subscriber. Fails if one is already installed.
fn init_logging(verbose: bool) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("Warning: logging disabled: {e}");
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.store_config();
    let format = cli.format;

    match cli.command {
        Commands::ListQueries { sort_by, sort_direction } => {
            commands::list_queries(&config, sort_by, sort_direction, format)
        }
        Commands::ListTables { sort_by, sort_direction } => {
            commands::list_tables(&config, sort_by, sort_direction, format)
        }
        Commands::ListRules => commands::list_rules(&config, format),
        Commands::MakeRule { rule, yes } => commands::make_rule(&config, &rule, yes),
        Commands::SetQueryTtl { id, ttl, yes } => commands::set_query_ttl(&config, &id, &ttl, yes),
        Commands::SetTableTtl { name, ttl, yes } => {
            commands::set_table_ttl(&config, &name, &ttl, yes)
        }
        Commands::UpdateRule { index, rule, yes } => {
            commands::update_rule(&config, index, &rule, yes)
        }
        Commands::DeleteRule { indices, yes } => commands::delete_rules(&config, &indices, yes),
        Commands::ResetConfig { yes } => commands::reset_config(&config, yes),
        Commands::ClearMetrics { yes } => commands::clear_metrics(&config, yes),
    }
}

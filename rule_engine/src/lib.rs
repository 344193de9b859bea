//! # Rule Engine
//!
//! Caching-rule model, precedence matching and the wire encodings used to
//! persist ordered rule lists. Pure library: no store access.

pub mod codec;
pub mod matcher;
pub mod rule;
pub mod view;

pub use rule::{
    parse_ttl,              // TTL duration parsing
    split_list,             // Operator list input
    validate_regex,         // Regex check at input time
    Fnv1aHasher,            // Stable fingerprint hasher
    Rule,                   // Caching rule
    ValidationError,        // Rejected input
};

pub use matcher::{
    match_query,            // First matching rule for a query
    match_query_indexed,    // Same, with its position
    match_table,            // First matching rule for a table
    QuerySubject,           // Matcher input for a query
    RuleMatcher,            // Precompiled matcher over one snapshot
};

pub use codec::{
    decode_document, decode_fields, decode_log_entry, encode_document, encode_fields,
    encode_log_entry, CodecError, DecodeWarning, DecodedRules, LogEntry,
    CLEARED_SENTINEL_TTL,
};

pub use view::{
    aggregate_tables, resolve_queries, resolve_tables, sort_queries, sort_tables,
    ObservedQuery, ObservedTable, Query, QuerySortField, SortDirection, Table,
    TableSortField,
};

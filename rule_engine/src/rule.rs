// Caching rule model
//
// A rule pairs a time-to-live with up to five independent match criteria.
// Every criterion is optional and `None` means "not part of the rule"; an
// empty list is a set-but-empty criterion and behaves differently in the
// matcher, so the distinction is kept all the way through the codecs.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// RULE
// ============================================================================

/// A caching policy: a TTL plus the criteria deciding which queries it covers.
///
/// Field names on the wire follow the document encoding (`tablesAny`,
/// `tablesAll`, `queryIds`). Unset criteria serialize as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    /// Matches when every table the query touches is in this set.
    #[serde(default)]
    pub tables: Option<Vec<String>>,

    /// Matches when the query touches any table in this set.
    #[serde(default, rename = "tablesAny")]
    pub tables_any: Option<Vec<String>>,

    /// Matches when the query touches all tables in this (non-empty) set.
    #[serde(default, rename = "tablesAll")]
    pub tables_all: Option<Vec<String>>,

    /// Matches when the pattern matches anywhere in the query's SQL.
    #[serde(default)]
    pub regex: Option<String>,

    /// Matches when the query id is one of these.
    #[serde(default, rename = "queryIds")]
    pub query_ids: Option<Vec<String>>,

    /// Duration string such as `1h` or `300s`.
    pub ttl: String,
}

impl Rule {
    /// Creates a catch-all rule with the given TTL.
    pub fn new(ttl: impl Into<String>) -> Self {
        Rule {
            tables: None,
            tables_any: None,
            tables_all: None,
            regex: None,
            query_ids: None,
            ttl: ttl.into(),
        }
    }

    /// Rule created from the query list: applies to exactly one query id.
    pub fn for_query(query_id: impl Into<String>, ttl: impl Into<String>) -> Self {
        Rule::new(ttl).with_query_ids([query_id.into()])
    }

    /// Rule created from the table list: applies to any query touching `table`.
    pub fn for_table(table: impl Into<String>, ttl: impl Into<String>) -> Self {
        Rule::new(ttl).with_tables_any([table.into()])
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = Some(tables.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_tables_any<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables_any = Some(tables.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_tables_all<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables_all = Some(tables.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_regex(mut self, pattern: impl Into<String>) -> Self {
        self.regex = Some(pattern.into());
        self
    }

    pub fn with_query_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// True when no criterion is set; such a rule matches every input.
    pub fn is_catch_all(&self) -> bool {
        self.tables.is_none()
            && self.tables_any.is_none()
            && self.tables_all.is_none()
            && self.regex.is_none()
            && self.query_ids.is_none()
    }

    /// Checks the rule before it is handed to the codec or the store.
    pub fn validate(&self) -> Result<(), ValidationError> {
        parse_ttl(&self.ttl)?;
        if let Some(pattern) = &self.regex {
            validate_regex(pattern)?;
        }
        Ok(())
    }

    /// Stable 64-bit fingerprint of the rule's content.
    ///
    /// Structurally equal rules always produce the same value, `None` and
    /// `Some(vec![])` produce different values, and field order matters.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = Fnv1aHasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Human readable one-line description of the criteria.
    pub fn describe_match(&self) -> String {
        let mut parts = Vec::new();
        if let Some(t) = &self.tables {
            parts.push(format!("tables={}", t.join(",")));
        }
        if let Some(t) = &self.tables_any {
            parts.push(format!("tables-any={}", t.join(",")));
        }
        if let Some(t) = &self.tables_all {
            parts.push(format!("tables-all={}", t.join(",")));
        }
        if let Some(r) = &self.regex {
            parts.push(format!("regex={}", r));
        }
        if let Some(q) = &self.query_ids {
            parts.push(format!("query-ids={}", q.join(",")));
        }
        if parts.is_empty() {
            "any".to_string()
        } else {
            parts.join(" ")
        }
    }
}

// ============================================================================
// FINGERPRINT HASHER
// ============================================================================

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a. Unlike `DefaultHasher` the output does not depend on
/// process-random keys, so fingerprints are comparable across sessions.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1aHasher(u64);

impl Default for Fnv1aHasher {
    fn default() -> Self {
        Fnv1aHasher(FNV_OFFSET_BASIS)
    }
}

impl Hasher for Fnv1aHasher {
    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= u64::from(*byte);
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

// ============================================================================
// VALIDATION
// ============================================================================

/// Rejected user input. Never reaches the codec or the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("a TTL is required")]
    MissingTtl,

    #[error("invalid duration '{0}': expected a number plus a unit (e.g. 1h, 300s, 5m)")]
    InvalidDuration(String),

    #[error("invalid regex '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("no match criteria given; pass at least one criterion or request a catch-all rule")]
    NoCriteria,
}

static DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+(?:\.\d+)?)\s*([a-zA-Z]+)\s*$").expect("duration pattern is valid")
});

/// Parses a TTL such as `300s`, `5m`, `1.5h` or `2d`.
///
/// Supported units: `ns`, `us`, `ms`, `s`, `m`, `h`, `d`.
pub fn parse_ttl(ttl: &str) -> Result<Duration, ValidationError> {
    if ttl.trim().is_empty() {
        return Err(ValidationError::MissingTtl);
    }

    let invalid = || ValidationError::InvalidDuration(ttl.to_string());
    let caps = DURATION_RE.captures(ttl).ok_or_else(invalid)?;
    let value: f64 = caps[1].parse().map_err(|_| invalid())?;

    let unit_secs = match &caps[2] {
        "ns" => 1e-9,
        "us" => 1e-6,
        "ms" => 1e-3,
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3_600.0,
        "d" => 86_400.0,
        _ => return Err(invalid()),
    };

    let secs = value * unit_secs;
    if !secs.is_finite() || secs > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Compiles `pattern` once to check it.
pub fn validate_regex(pattern: &str) -> Result<(), ValidationError> {
    Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| ValidationError::InvalidRegex {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

/// Splits operator input such as `orders, customers` into trimmed,
/// non-empty names.
pub fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rule_is_catch_all() {
        let rule = Rule::new("5m");
        assert!(rule.is_catch_all());
        assert!(!rule.clone().with_tables(Vec::<String>::new()).is_catch_all());
        assert!(!rule.with_regex("select").is_catch_all());
    }

    #[test]
    fn test_parse_ttl_units() {
        assert_eq!(parse_ttl("300s").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_ttl("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_ttl("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_ttl("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_ttl("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_ttl("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_ttl("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_ttl_rejects_garbage() {
        assert_eq!(parse_ttl(""), Err(ValidationError::MissingTtl));
        assert_eq!(parse_ttl("   "), Err(ValidationError::MissingTtl));
        assert!(matches!(parse_ttl("300"), Err(ValidationError::InvalidDuration(_))));
        assert!(matches!(parse_ttl("5 weeks"), Err(ValidationError::InvalidDuration(_))));
        assert!(matches!(parse_ttl("m5"), Err(ValidationError::InvalidDuration(_))));
    }

    #[test]
    fn test_validate_rejects_bad_regex() {
        let rule = Rule::new("1h").with_regex("select (");
        assert!(matches!(
            rule.validate(),
            Err(ValidationError::InvalidRegex { .. })
        ));
        assert!(Rule::new("1h").with_regex("^select").validate().is_ok());
    }

    #[test]
    fn test_content_hash_is_structural() {
        let a = Rule::new("5m").with_tables_any(["orders"]);
        let b = Rule::new("5m").with_tables_any(["orders"]);
        assert_eq!(a, b);
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(Rule::new("1h").content_hash(), Rule::new("1h").content_hash());
    }

    #[test]
    fn test_content_hash_sees_every_field() {
        let base = Rule::new("5m").with_tables_any(["orders"]);
        let variants = [
            base.clone().with_tables(["orders"]),
            base.clone().with_tables_all(["orders"]),
            base.clone().with_regex("orders"),
            base.clone().with_query_ids(["q1"]),
            Rule::new("10m").with_tables_any(["orders"]),
            // same string, different field
            Rule::new("5m").with_tables_all(["orders"]),
            // unset versus set-but-empty
            base.clone().with_query_ids(Vec::<String>::new()),
        ];
        for variant in variants {
            assert_ne!(base.content_hash(), variant.content_hash(), "{:?}", variant);
        }
    }

    #[test]
    fn test_content_hash_is_order_sensitive() {
        let ab = Rule::new("5m").with_tables(["a", "b"]);
        let ba = Rule::new("5m").with_tables(["b", "a"]);
        assert_ne!(ab.content_hash(), ba.content_hash());
    }

    #[test]
    fn test_helpers_build_expected_criteria() {
        let q = Rule::for_query("abc", "1h");
        assert_eq!(q.query_ids, Some(vec!["abc".to_string()]));
        let t = Rule::for_table("orders", "1h");
        assert_eq!(t.tables_any, Some(vec!["orders".to_string()]));
        assert_eq!(t.describe_match(), "tables-any=orders");
        assert_eq!(Rule::new("1h").describe_match(), "any");
    }

    #[test]
    fn test_split_list_trims_and_drops_empty() {
        assert_eq!(split_list(" orders, customers ,,"), vec!["orders", "customers"]);
        assert!(split_list("").is_empty());
    }
}

// Wire encodings for rule lists
//
// Two encodings describe the same ordered rule list:
//
// - Document: `{"rules": [Rule, ...]}` stored as a JSON document. Legacy.
// - Log entry: flat field/value pairs appended to a stream, one entry per
//   committed version. Keys look like `rules.<n>.<component>[.<i>]` where
//   `n` is the 1-based rule position and `i` the 1-based list position.
//
// New writes always use the indexed form for list components. Reads also
// accept the older comma-joined form (`rules.1.tables = "a,b"`). The
// comma-joined form with an empty value is how a set-but-empty list is
// written, so `None` and `Some(vec![])` survive a round trip.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::rule::Rule;

/// TTL of the placeholder rule written when an empty list is committed.
pub const CLEARED_SENTINEL_TTL: &str = "0s";

const KEY_PREFIX: &str = "rules";

// ============================================================================
// ERRORS
// ============================================================================

/// Fatal codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Problems found while decoding a log entry. The offending field is skipped
/// and the rest of the list is still returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeWarning {
    #[error("skipping malformed rule key '{0}'")]
    MalformedKey(String),

    #[error("skipping unknown rule component in key '{0}'")]
    UnknownComponent(String),

    #[error("skipping rule {0}: no ttl")]
    MissingTtl(usize),

    #[error("rule {rule} has both joined and indexed '{component}' values; using indexed")]
    MixedListEncoding { rule: usize, component: String },
}

// ============================================================================
// DOCUMENT ENCODING
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct RulesDocument {
    #[serde(default)]
    rules: Vec<Rule>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DocumentShape {
    Wrapped(RulesDocument),
    Bare(Vec<Rule>),
    // `JSON.GET key $` wraps the root in an array
    PathResult(Vec<RulesDocument>),
}

/// Serializes the full list as `{"rules": [...]}`.
pub fn encode_document(rules: &[Rule]) -> Result<String, CodecError> {
    #[derive(Serialize)]
    struct Borrowed<'a> {
        rules: &'a [Rule],
    }
    serde_json::to_string(&Borrowed { rules })
        .map_err(|e| CodecError::SerializationError(e.to_string()))
}

/// Parses a stored document. Accepts the wrapped object, a bare rule array
/// and a JSONPath root result.
pub fn decode_document(doc: &str) -> Result<Vec<Rule>, CodecError> {
    let shape: DocumentShape =
        serde_json::from_str(doc).map_err(|e| CodecError::JsonParseError(e.to_string()))?;

    match shape {
        DocumentShape::Wrapped(d) => Ok(d.rules),
        DocumentShape::Bare(rules) => Ok(rules),
        DocumentShape::PathResult(mut docs) => match docs.len() {
            0 => Ok(Vec::new()),
            1 => Ok(docs.remove(0).rules),
            n => Err(CodecError::InvalidFormat(format!(
                "expected a single rules document, found {}",
                n
            ))),
        },
    }
}

// ============================================================================
// LOG ENTRY ENCODING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Component {
    Ttl,
    Regex,
    Tables,
    TablesAny,
    TablesAll,
    QueryIds,
}

impl Component {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "ttl" => Some(Component::Ttl),
            "regex" => Some(Component::Regex),
            "tables" => Some(Component::Tables),
            "tablesAny" | "tables-any" => Some(Component::TablesAny),
            "tablesAll" | "tables-all" => Some(Component::TablesAll),
            "queryIds" | "query-ids" => Some(Component::QueryIds),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Component::Ttl => "ttl",
            Component::Regex => "regex",
            Component::Tables => "tables",
            Component::TablesAny => "tables-any",
            Component::TablesAll => "tables-all",
            Component::QueryIds => "query-ids",
        }
    }

    fn is_list(self) -> bool {
        !matches!(self, Component::Ttl | Component::Regex)
    }
}

struct FieldKey {
    rule: usize,
    component: Component,
    index: Option<usize>,
}

fn parse_key(key: &str) -> Result<FieldKey, DecodeWarning> {
    let malformed = || DecodeWarning::MalformedKey(key.to_string());
    let parts: Vec<&str> = key.split('.').collect();
    if parts.len() < 3 || parts.len() > 4 || parts[0] != KEY_PREFIX {
        return Err(malformed());
    }

    let rule: usize = parts[1].parse().map_err(|_| malformed())?;
    let component =
        Component::parse(parts[2]).ok_or_else(|| DecodeWarning::UnknownComponent(key.to_string()))?;
    let index = match parts.get(3) {
        Some(raw) => Some(raw.parse::<usize>().map_err(|_| malformed())?),
        None => None,
    };

    if index.is_some() && !component.is_list() {
        return Err(malformed());
    }
    Ok(FieldKey { rule, component, index })
}

fn push_list(out: &mut Vec<(String, String)>, n: usize, component: Component, list: &Option<Vec<String>>) {
    let Some(items) = list else { return };
    if items.is_empty() {
        out.push((format!("{}.{}.{}", KEY_PREFIX, n, component.key()), String::new()));
        return;
    }
    for (i, item) in items.iter().enumerate() {
        out.push((
            format!("{}.{}.{}.{}", KEY_PREFIX, n, component.key(), i + 1),
            item.clone(),
        ));
    }
}

/// Flattens the list into field/value pairs in rule order.
pub fn encode_fields(rules: &[Rule]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (i, rule) in rules.iter().enumerate() {
        let n = i + 1;
        out.push((format!("{}.{}.{}", KEY_PREFIX, n, Component::Ttl.key()), rule.ttl.clone()));
        if let Some(regex) = &rule.regex {
            out.push((format!("{}.{}.{}", KEY_PREFIX, n, Component::Regex.key()), regex.clone()));
        }
        push_list(&mut out, n, Component::Tables, &rule.tables);
        push_list(&mut out, n, Component::TablesAny, &rule.tables_any);
        push_list(&mut out, n, Component::TablesAll, &rule.tables_all);
        push_list(&mut out, n, Component::QueryIds, &rule.query_ids);
    }
    out
}

#[derive(Default)]
struct ListParts {
    joined: Option<String>,
    indexed: BTreeMap<usize, String>,
}

impl ListParts {
    fn finish(self, rule: usize, component: Component, warnings: &mut Vec<DecodeWarning>) -> Option<Vec<String>> {
        if !self.indexed.is_empty() {
            if self.joined.is_some() {
                warnings.push(DecodeWarning::MixedListEncoding {
                    rule,
                    component: component.key().to_string(),
                });
            }
            return Some(self.indexed.into_values().collect());
        }
        self.joined.map(|joined| {
            if joined.is_empty() {
                Vec::new()
            } else {
                joined.split(',').map(|s| s.trim().to_string()).collect()
            }
        })
    }
}

#[derive(Default)]
struct PartialRule {
    ttl: Option<String>,
    regex: Option<String>,
    lists: BTreeMap<Component, ListParts>,
}

/// Result of decoding one log entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedRules {
    pub rules: Vec<Rule>,
    pub warnings: Vec<DecodeWarning>,
}

/// Rebuilds the rule list from field/value pairs.
///
/// Keys that do not parse are skipped and reported as warnings (also logged).
/// Rules are ordered by their rule number; gaps are closed.
pub fn decode_fields<I, K, V>(pairs: I) -> DecodedRules
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let mut partials: BTreeMap<usize, PartialRule> = BTreeMap::new();
    let mut warnings = Vec::new();

    for (key, value) in pairs {
        let key = key.as_ref();
        let parsed = match parse_key(key) {
            Ok(parsed) => parsed,
            Err(w) => {
                warnings.push(w);
                continue;
            }
        };

        let value = value.into();
        let partial = partials.entry(parsed.rule).or_default();
        match (parsed.component, parsed.index) {
            (Component::Ttl, _) => partial.ttl = Some(value),
            (Component::Regex, _) => partial.regex = Some(value),
            (component, None) => {
                partial.lists.entry(component).or_default().joined = Some(value);
            }
            (component, Some(i)) => {
                partial.lists.entry(component).or_default().indexed.insert(i, value);
            }
        }
    }

    let mut rules = Vec::with_capacity(partials.len());
    for (n, mut partial) in partials {
        let Some(ttl) = partial.ttl.take() else {
            warnings.push(DecodeWarning::MissingTtl(n));
            continue;
        };

        let mut take = |c: Component| {
            partial
                .lists
                .remove(&c)
                .and_then(|parts| parts.finish(n, c, &mut warnings))
        };
        let tables = take(Component::Tables);
        let tables_any = take(Component::TablesAny);
        let tables_all = take(Component::TablesAll);
        let query_ids = take(Component::QueryIds);

        rules.push(Rule {
            tables,
            tables_any,
            tables_all,
            regex: partial.regex,
            query_ids,
            ttl,
        });
    }

    for w in &warnings {
        warn!("{}", w);
    }

    DecodedRules { rules, warnings }
}

// ============================================================================
// LOG ENTRY WITH SENTINEL
// ============================================================================

/// A decoded log entry, with the cleared-list sentinel recognised.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogEntry {
    pub rules: Vec<Rule>,
    /// True when the entry is the placeholder written for an empty list.
    pub cleared: bool,
    pub warnings: Vec<DecodeWarning>,
}

fn sentinel() -> Rule {
    Rule::new(CLEARED_SENTINEL_TTL)
}

/// Encodes a version for the log. An empty list becomes a single
/// catch-all placeholder rule with a zero TTL.
pub fn encode_log_entry(rules: &[Rule]) -> Vec<(String, String)> {
    if rules.is_empty() {
        encode_fields(&[sentinel()])
    } else {
        encode_fields(rules)
    }
}

/// Decodes a version from the log. The placeholder rule decodes to an
/// empty list with `cleared` set.
pub fn decode_log_entry<I, K, V>(pairs: I) -> LogEntry
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let decoded = decode_fields(pairs);
    if decoded.rules.len() == 1 && decoded.rules[0] == sentinel() {
        return LogEntry {
            rules: Vec::new(),
            cleared: true,
            warnings: decoded.warnings,
        };
    }
    LogEntry {
        rules: decoded.rules,
        cleared: false,
        warnings: decoded.warnings,
    }
}

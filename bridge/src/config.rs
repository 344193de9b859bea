//! Store connection and encoding configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ================================================================================================
// RULE ENCODING
// ================================================================================================

/// How rule lists are laid out in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RuleEncoding {
    /// Append-only stream at `<namespace>:config`, one flattened entry per version.
    #[default]
    Stream,
    /// Legacy JSON document `{"rules": [...]}` at `<namespace>:config`.
    Document,
}

// ================================================================================================
// STORE CONFIGURATION
// ================================================================================================

/// Configuration for the backing store connection.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Namespace scoping every read and write.
    pub application: String,
    pub encoding: RuleEncoding,
    /// Upper bound for connecting and for each socket read/write.
    pub timeout: Duration,
    /// Optimistic transaction attempts before a commit gives up.
    pub max_commit_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            user: "default".to_string(),
            password: None,
            application: "smartcache".to_string(),
            encoding: RuleEncoding::Stream,
            timeout: Duration::from_secs(5),
            max_commit_attempts: 5,
        }
    }
}

impl StoreConfig {
    /// `host:port`, for messages.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Key holding the rule list of `namespace`.
pub fn config_key(namespace: &str) -> String {
    format!("{}:config", namespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.address(), "localhost:6379");
        assert_eq!(config.application, "smartcache");
        assert_eq!(config.encoding, RuleEncoding::Stream);
        assert_eq!(config.timeout.as_secs(), 5);
        assert!(config.password.is_none());
    }

    #[test]
    fn test_config_key() {
        assert_eq!(config_key("smartcache"), "smartcache:config");
    }
}

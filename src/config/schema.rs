//! Resolved configuration view and the keys the host recognises.
//!
//! Every layer is flattened into `:`-separated keys before merging, so a
//! nested JSON document, an environment variable such as
//! `Serilog__SeqServerUrl` and a secret named `Serilog--SeqServerUrl` all
//! address the same setting.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// Primary (HTTP/1.1 + HTTP/2) listener port.
pub const PORT: &str = "PORT";
/// Streaming RPC (HTTP/2 only) listener port.
pub const GRPC_PORT: &str = "GRPC_PORT";
/// Enables the remote secret store layer.
pub const USE_VAULT: &str = "UseVault";
pub const VAULT_NAME: &str = "Vault:Name";
pub const VAULT_CLIENT_ID: &str = "Vault:ClientId";
pub const VAULT_CLIENT_SECRET: &str = "Vault:ClientSecret";
pub const SEQ_SERVER_URL: &str = "Serilog:SeqServerUrl";
pub const LOGSTASH_URL: &str = "Serilog:LogstashUrl";
pub const INSTRUMENTATION_KEY: &str = "APPINSIGHTS_INSTRUMENTATIONKEY";
/// Subsection read directly by the logging initializer.
pub const SERILOG_SECTION: &str = "Serilog";
pub const CONNECTION_STRING: &str = "ConnectionString";
pub const MAX_CONCURRENT_CONNECTIONS: &str = "Kestrel:Limits:MaxConcurrentConnections";

/// Separator between key segments.
pub const KEY_DELIMITER: char = ':';

#[derive(Debug, Clone, PartialEq, Eq)]
struct Setting {
    key: String,
    value: String,
}

/// Immutable, merged key/value view over every configuration layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedConfiguration {
    // Keyed by the lowercased key; the original spelling is kept for listing.
    settings: BTreeMap<String, Setting>,
}

impl ResolvedConfiguration {
    /// Merge `layers` in order; later layers override earlier ones.
    pub fn from_layers<'a, I>(layers: I) -> Self
    where
        I: IntoIterator<Item = &'a [(String, String)]>,
    {
        let mut settings = BTreeMap::new();
        for layer in layers {
            for (key, value) in layer {
                settings.insert(
                    normalize_key(key),
                    Setting {
                        key: key.clone(),
                        value: value.clone(),
                    },
                );
            }
        }
        Self { settings }
    }

    /// Build a single-layer configuration, mostly useful in tests.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let layer: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_layers([layer.as_slice()])
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings
            .get(&normalize_key(key))
            .map(|setting| setting.value.as_str())
    }

    /// Value of `key` unless it is absent, empty or whitespace.
    pub fn get_non_blank(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|value| !value.trim().is_empty())
    }

    /// Lenient boolean lookup: anything other than `true`/`false` is `default`.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(parse_bool).unwrap_or(default)
    }

    /// Parsed value of `key`, or `None` when absent or unparsable.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|value| value.trim().parse().ok())
    }

    /// Every key below `name`, with the `name:` prefix removed.
    pub fn section(&self, name: &str) -> ResolvedConfiguration {
        let prefix = format!("{}{}", normalize_key(name), KEY_DELIMITER);
        let settings = self
            .settings
            .iter()
            .filter(|(normalized, _)| normalized.starts_with(&prefix))
            .map(|(normalized, setting)| {
                let key = setting.key[prefix.len()..].to_string();
                (
                    normalized[prefix.len()..].to_string(),
                    Setting {
                        key,
                        value: setting.value.clone(),
                    },
                )
            })
            .collect();
        Self { settings }
    }

    /// Distinct first segments of every key, in their original spelling.
    pub fn child_names(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut names = Vec::new();
        for (normalized, setting) in &self.settings {
            let head = normalized.split(KEY_DELIMITER).next().unwrap_or_default();
            if seen.insert(head.to_string()) {
                let original = setting.key.split(KEY_DELIMITER).next().unwrap_or_default();
                names.push(original.to_string());
            }
        }
        names
    }

    /// Iterate over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.settings
            .values()
            .map(|setting| (setting.key.as_str(), setting.value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }
}

fn normalize_key(key: &str) -> String {
    key.to_ascii_lowercase()
}

/// Case-insensitive `true`/`false`, ignoring surrounding whitespace.
pub fn parse_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

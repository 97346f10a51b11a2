//! Layered configuration loading.
//!
//! Resolution is two-pass: the file, environment and override layers are
//! merged into a provisional view that is only consulted to decide whether
//! the secret store layer is needed; the second merge is authoritative.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::config::schema::{ResolvedConfiguration, KEY_DELIMITER, USE_VAULT};
use crate::config::secrets::{KeyVaultFactory, SecretStoreError, SecretStoreFactory, VaultSettings};

/// Name of the mandatory base file.
pub const DEFAULT_CONFIG_FILE: &str = "appsettings.json";
/// Environment variable naming the optional per-environment overlay file.
pub const ENVIRONMENT_VARIABLE: &str = "APP_ENVIRONMENT";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file {} not found", .path.display())]
    Missing { path: PathBuf },

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("unsupported configuration format: {}", .path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error(transparent)]
    SecretStore(#[from] SecretStoreError),
}

/// Where and what to load.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Directory holding the configuration files.
    pub content_root: PathBuf,
    /// Base file name, relative to `content_root`.
    pub file_name: String,
    /// Overlay `appsettings.{name}.json` when set; falls back to
    /// `APP_ENVIRONMENT` from the environment layer.
    pub environment_name: Option<String>,
}

impl ResolverOptions {
    pub fn new(content_root: impl Into<PathBuf>) -> Self {
        Self {
            content_root: content_root.into(),
            file_name: DEFAULT_CONFIG_FILE.to_string(),
            environment_name: None,
        }
    }

    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn environment_name(mut self, name: impl Into<String>) -> Self {
        self.environment_name = Some(name.into());
        self
    }

    pub fn base_file(&self) -> PathBuf {
        self.content_root.join(&self.file_name)
    }

    /// `appsettings.json` + `Production` → `appsettings.Production.json`.
    fn environment_file(&self, environment: &str) -> PathBuf {
        let base = Path::new(&self.file_name);
        let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("appsettings");
        let name = match base.extension().and_then(|e| e.to_str()) {
            Some(extension) => format!("{stem}.{environment}.{extension}"),
            None => format!("{stem}.{environment}"),
        };
        self.content_root.join(name)
    }
}

/// Source of environment variables.
#[derive(Debug, Clone, Default)]
pub enum EnvironmentSource {
    /// The process environment, read at resolve time.
    #[default]
    Process,
    /// A fixed set of variables.
    Fixed(Vec<(String, String)>),
}

impl EnvironmentSource {
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Fixed(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Variables as configuration pairs, with `__` mapped to `:`.
    fn layer(&self) -> Vec<(String, String)> {
        let vars: Vec<(String, String)> = match self {
            // Non UTF-8 variables cannot be configuration keys.
            Self::Process => std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
            Self::Fixed(vars) => vars.clone(),
        };
        vars.into_iter()
            .map(|(key, value)| (key.replace("__", &KEY_DELIMITER.to_string()), value))
            .collect()
    }
}

/// Merges configuration layers into a [`ResolvedConfiguration`].
pub struct ConfigurationResolver {
    options: ResolverOptions,
    environment: EnvironmentSource,
    overrides: Vec<(String, String)>,
    secrets: Arc<dyn SecretStoreFactory>,
}

impl ConfigurationResolver {
    /// Resolver over the process environment with the key vault secret store.
    pub fn new(options: ResolverOptions) -> Self {
        Self {
            options,
            environment: EnvironmentSource::Process,
            overrides: Vec::new(),
            secrets: Arc::new(KeyVaultFactory),
        }
    }

    pub fn with_environment(mut self, environment: EnvironmentSource) -> Self {
        self.environment = environment;
        self
    }

    /// Command-line style overrides, above environment variables.
    pub fn with_overrides(mut self, overrides: Vec<(String, String)>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_secret_store(mut self, factory: Arc<dyn SecretStoreFactory>) -> Self {
        self.secrets = factory;
        self
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// Resolve every layer.
    ///
    /// Fails if the base file is missing or malformed, or if the secret
    /// store is enabled and cannot be read.
    pub async fn resolve(&self) -> Result<ResolvedConfiguration, ConfigError> {
        let mut layers = vec![read_layer(&self.options.base_file(), true)?.unwrap_or_default()];

        let environment = self.environment.layer();
        let environment_name = self.options.environment_name.clone().or_else(|| {
            environment
                .iter()
                .rev()
                .find(|(key, _)| key.eq_ignore_ascii_case(ENVIRONMENT_VARIABLE))
                .map(|(_, value)| value.trim().to_string())
                .filter(|value| !value.is_empty())
        });
        if let Some(name) = environment_name {
            if let Some(layer) = read_layer(&self.options.environment_file(&name), false)? {
                layers.push(layer);
            }
        }
        layers.push(environment);
        layers.push(self.overrides.clone());

        let provisional = merge(&layers);
        if !provisional.get_bool(USE_VAULT, false) {
            return Ok(provisional);
        }

        let settings = VaultSettings::from_config(&provisional);
        let store = self.secrets.create(&settings)?;
        layers.push(store.load().await?);
        Ok(merge(&layers))
    }
}

fn merge(layers: &[Vec<(String, String)>]) -> ResolvedConfiguration {
    ResolvedConfiguration::from_layers(layers.iter().map(Vec::as_slice))
}

/// Read and flatten one file. `Ok(None)` only for a missing optional file.
fn read_layer(path: &Path, required: bool) -> Result<Option<Vec<(String, String)>>, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound && !required => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ConfigError::Missing {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let parse_error = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };
    let mut pairs = Vec::new();
    match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("json") => {
            let value: serde_json::Value =
                serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()))?;
            if !value.is_object() {
                return Err(parse_error("top-level value must be an object".to_string()));
            }
            flatten_json("", &value, &mut pairs);
        }
        Some("toml") => {
            let table: toml::Table = toml::from_str(&content).map_err(|e| parse_error(e.to_string()))?;
            for (key, value) in &table {
                flatten_toml(key, value, &mut pairs);
            }
        }
        _ => {
            return Err(ConfigError::UnsupportedFormat {
                path: path.to_path_buf(),
            })
        }
    }
    Ok(Some(pairs))
}

fn join_key(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}{KEY_DELIMITER}{segment}")
    }
}

fn flatten_json(prefix: &str, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_json(&join_key(prefix, key), child, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_json(&join_key(prefix, &index.to_string()), child, out);
            }
        }
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
        Value::Null => out.push((prefix.to_string(), String::new())),
        Value::Bool(_) | Value::Number(_) => out.push((prefix.to_string(), value.to_string())),
    }
}

fn flatten_toml(prefix: &str, value: &toml::Value, out: &mut Vec<(String, String)>) {
    use toml::Value;
    match value {
        Value::Table(table) => {
            for (key, child) in table {
                flatten_toml(&join_key(prefix, key), child, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_toml(&join_key(prefix, &index.to_string()), child, out);
            }
        }
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
        Value::Integer(i) => out.push((prefix.to_string(), i.to_string())),
        Value::Float(f) => out.push((prefix.to_string(), f.to_string())),
        Value::Boolean(b) => out.push((prefix.to_string(), b.to_string())),
        Value::Datetime(dt) => out.push((prefix.to_string(), dt.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_flattens_to_colon_keys() {
        let value = serde_json::json!({
            "PORT": 5101,
            "UseVault": false,
            "Serilog": {
                "SeqServerUrl": null,
                "WriteTo": [{ "Name": "Console" }]
            }
        });
        let mut pairs = Vec::new();
        flatten_json("", &value, &mut pairs);
        let config = ResolvedConfiguration::from_pairs(pairs);

        assert_eq!(config.get("PORT"), Some("5101"));
        assert_eq!(config.get("UseVault"), Some("false"));
        assert_eq!(config.get("Serilog:SeqServerUrl"), Some(""));
        assert_eq!(config.get("Serilog:WriteTo:0:Name"), Some("Console"));
    }

    #[test]
    fn environment_file_keeps_extension() {
        let options = ResolverOptions::new("/srv/catalog");
        assert_eq!(
            options.environment_file("Production"),
            PathBuf::from("/srv/catalog/appsettings.Production.json")
        );
    }

    #[test]
    fn double_underscore_maps_to_delimiter() {
        let env = EnvironmentSource::from_vars([("Serilog__SeqServerUrl", "http://seq:5341")]);
        assert_eq!(
            env.layer(),
            vec![("Serilog:SeqServerUrl".to_string(), "http://seq:5341".to_string())]
        );
    }
}

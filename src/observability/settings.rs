//! Logging settings read from the resolved configuration.
//!
//! The fixed keys (`Serilog:SeqServerUrl`, `Serilog:LogstashUrl`,
//! `APPINSIGHTS_INSTRUMENTATIONKEY`) configure the built-in sinks. The rest
//! of the `Serilog` subsection lets operators change levels and add sinks
//! without a rebuild:
//!
//! ```json
//! "Serilog": {
//!   "MinimumLevel": { "Default": "Information", "Override": { "hyper": "Warning" } },
//!   "WriteTo": [ { "Name": "Seq", "Args": { "serverUrl": "http://seq-archive" } } ]
//! }
//! ```

use crate::config::schema::{
    ResolvedConfiguration, INSTRUMENTATION_KEY, LOGSTASH_URL, SEQ_SERVER_URL, SERILOG_SECTION,
};
use crate::observability::logging::LoggerInitError;
use crate::observability::sink::LogLevel;

pub const DEFAULT_SEQ_URL: &str = "http://seq";
pub const DEFAULT_LOGSTASH_URL: &str = "http://logstash:8080";

/// A sink declared under `Serilog:WriteTo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkSpec {
    Console,
    Seq { server_url: String },
    Http { request_uri: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub seq_server_url: String,
    pub logstash_url: String,
    /// Telemetry sink is only registered when this is set.
    pub instrumentation_key: Option<String>,
    pub minimum_level: LogLevel,
    pub overrides: Vec<(String, LogLevel)>,
    pub write_to: Vec<SinkSpec>,
}

impl LoggingSettings {
    pub fn from_config(config: &ResolvedConfiguration) -> Result<Self, LoggerInitError> {
        let serilog = config.section(SERILOG_SECTION);
        let minimum = serilog.section("MinimumLevel");

        let minimum_level = match serilog.get_non_blank("MinimumLevel") {
            Some(value) => parse_level("Serilog:MinimumLevel", value)?,
            None => match minimum.get_non_blank("Default") {
                Some(value) => parse_level("Serilog:MinimumLevel:Default", value)?,
                None => LogLevel::Verbose,
            },
        };

        let override_section = minimum.section("Override");
        let mut overrides = Vec::new();
        for target in override_section.child_names() {
            if let Some(value) = override_section.get(&target) {
                let key = format!("Serilog:MinimumLevel:Override:{target}");
                overrides.push((target.clone(), parse_level(&key, value)?));
            }
        }

        Ok(Self {
            seq_server_url: config
                .get_non_blank(SEQ_SERVER_URL)
                .unwrap_or(DEFAULT_SEQ_URL)
                .to_string(),
            logstash_url: config
                .get_non_blank(LOGSTASH_URL)
                .unwrap_or(DEFAULT_LOGSTASH_URL)
                .to_string(),
            instrumentation_key: config
                .get_non_blank(INSTRUMENTATION_KEY)
                .map(|key| key.trim().to_string()),
            minimum_level,
            overrides,
            write_to: parse_write_to(&serilog.section("WriteTo"))?,
        })
    }
}

fn parse_level(key: &str, value: &str) -> Result<LogLevel, LoggerInitError> {
    LogLevel::parse(value).ok_or_else(|| LoggerInitError::UnknownLevel {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_write_to(section: &ResolvedConfiguration) -> Result<Vec<SinkSpec>, LoggerInitError> {
    let mut indices = section.child_names();
    indices.sort_by_key(|index| index.parse::<usize>().unwrap_or(usize::MAX));

    let mut specs = Vec::with_capacity(indices.len());
    for index in indices {
        let entry = section.section(&index);
        let key = format!("Serilog:WriteTo:{index}");
        let name = entry.get("Name").unwrap_or_default().trim();
        let argument = |argument: &'static str| {
            entry
                .get_non_blank(&format!("Args:{argument}"))
                .map(|value| value.trim().to_string())
                .ok_or_else(|| LoggerInitError::MissingArgument {
                    key: key.clone(),
                    argument,
                })
        };
        let spec = match name.to_ascii_lowercase().as_str() {
            "console" => SinkSpec::Console,
            "seq" => SinkSpec::Seq {
                server_url: argument("serverUrl")?,
            },
            "http" => SinkSpec::Http {
                request_uri: argument("requestUri")?,
            },
            _ => {
                return Err(LoggerInitError::UnknownSink {
                    key,
                    name: name.to_string(),
                })
            }
        };
        specs.push(spec);
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset_or_blank() {
        let config = ResolvedConfiguration::from_pairs([("Serilog:SeqServerUrl", " ")]);
        let settings = LoggingSettings::from_config(&config).unwrap();

        assert_eq!(settings.seq_server_url, DEFAULT_SEQ_URL);
        assert_eq!(settings.logstash_url, DEFAULT_LOGSTASH_URL);
        assert_eq!(settings.instrumentation_key, None);
        assert_eq!(settings.minimum_level, LogLevel::Verbose);
        assert!(settings.write_to.is_empty());
    }

    #[test]
    fn reads_levels_overrides_and_sinks() {
        let config = ResolvedConfiguration::from_pairs([
            ("Serilog:MinimumLevel:Default", "Information"),
            ("Serilog:MinimumLevel:Override:hyper", "Warning"),
            ("Serilog:WriteTo:1:Name", "Http"),
            ("Serilog:WriteTo:1:Args:requestUri", "http://collector:9000"),
            ("Serilog:WriteTo:0:Name", "Console"),
            ("Serilog:WriteTo:10:Name", "Seq"),
            ("Serilog:WriteTo:10:Args:serverUrl", "http://seq-archive"),
        ]);
        let settings = LoggingSettings::from_config(&config).unwrap();

        assert_eq!(settings.minimum_level, LogLevel::Information);
        assert_eq!(settings.overrides, vec![("hyper".to_string(), LogLevel::Warning)]);
        assert_eq!(
            settings.write_to,
            vec![
                SinkSpec::Console,
                SinkSpec::Http {
                    request_uri: "http://collector:9000".into()
                },
                SinkSpec::Seq {
                    server_url: "http://seq-archive".into()
                },
            ]
        );
    }

    #[test]
    fn rejects_unknown_sinks_and_levels() {
        let config = ResolvedConfiguration::from_pairs([("Serilog:WriteTo:0:Name", "Carrier-Pigeon")]);
        assert!(matches!(
            LoggingSettings::from_config(&config),
            Err(LoggerInitError::UnknownSink { .. })
        ));

        let config = ResolvedConfiguration::from_pairs([("Serilog:MinimumLevel", "Chatty")]);
        assert!(matches!(
            LoggingSettings::from_config(&config),
            Err(LoggerInitError::UnknownLevel { .. })
        ));

        let config = ResolvedConfiguration::from_pairs([("Serilog:WriteTo:0:Name", "Seq")]);
        assert!(matches!(
            LoggingSettings::from_config(&config),
            Err(LoggerInitError::MissingArgument { argument: "serverUrl", .. })
        ));
    }
}

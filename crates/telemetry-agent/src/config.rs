// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent wide configuration.
//!
//! Loaded from an optional YAML file and then from `TELEMETRY_AGENT_*` environment variables,
//! which take priority. Durations accept a number of seconds or a string such as `"1m30s"`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use tracing::error;

use crate::constants::{
    CHANNEL_CAPACITY, CONNECT_RETRY_DELAY, DEFAULT_FLUSH_INTERVAL, DEFAULT_INTERVAL,
    DEFAULT_METRIC_BATCH_SIZE, DEFAULT_METRIC_BUFFER_LIMIT, ENV_PREFIX,
};
use crate::errors::AgentError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    pub round_interval: bool,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub precision: Option<Duration>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub collection_jitter: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub collection_offset: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub flush_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub flush_jitter: Duration,
    pub metric_batch_size: usize,
    pub metric_buffer_limit: usize,
    pub channel_capacity: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub connect_retry_delay: Duration,
    #[serde(deserialize_with = "deserialize_tags")]
    pub global_tags: Vec<(String, String)>,
    pub log_level: LogLevel,
    pub state_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            round_interval: true,
            precision: None,
            collection_jitter: Duration::ZERO,
            collection_offset: Duration::ZERO,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_jitter: Duration::ZERO,
            metric_batch_size: DEFAULT_METRIC_BATCH_SIZE,
            metric_buffer_limit: DEFAULT_METRIC_BUFFER_LIMIT,
            channel_capacity: CHANNEL_CAPACITY,
            connect_retry_delay: CONNECT_RETRY_DELAY,
            global_tags: Vec::new(),
            log_level: LogLevel::default(),
            state_file: None,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.interval.is_zero() {
            return Err(AgentError::Config("interval must be positive".to_string()));
        }
        if self.flush_interval.is_zero() {
            return Err(AgentError::Config(
                "flush_interval must be positive".to_string(),
            ));
        }
        if self.metric_batch_size == 0 {
            return Err(AgentError::Config(
                "metric_batch_size must be positive".to_string(),
            ));
        }
        if self.metric_buffer_limit < self.metric_batch_size {
            return Err(AgentError::Config(format!(
                "metric_buffer_limit ({}) must be at least metric_batch_size ({})",
                self.metric_buffer_limit, self.metric_batch_size
            )));
        }
        if self.channel_capacity == 0 {
            return Err(AgentError::Config(
                "channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads the configuration from `path` (ignored when missing) and the environment.
pub fn load_config(path: &Path) -> Result<AgentConfig, AgentError> {
    let config: AgentConfig = Figment::new()
        .merge(Yaml::file(path))
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .map_err(|e| AgentError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl AsRef<str> for LogLevel {
    fn as_ref(&self) -> &str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!(
                "Invalid log level: '{s}'. Valid levels are: error, warn, info, debug, trace",
            )),
        }
    }
}

/// Unknown levels fall back to the default with an error log instead of failing the load.
impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(LogLevel::from_str(&value).unwrap_or_else(|e| {
            error!("{e}, using default");
            LogLevel::default()
        }))
    }
}

/// Parses bare seconds such as `"10"` or `"0.5"`, and unit strings such as `"250ms"` or
/// `"1m30s"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<f64>() {
        return from_nanos_f64(secs * 1e9).ok_or_else(|| format!("invalid duration {s:?}"));
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid duration {s:?}: {e}"))
}

fn from_nanos_f64(nanos: f64) -> Option<Duration> {
    if !nanos.is_finite() || nanos < 0.0 || nanos >= u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos.round() as u64))
}

struct DurationVisitor;

impl<'de> Visitor<'de> for DurationVisitor {
    type Value = Option<Duration>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a duration in seconds (integer or float) or a string like \"10s\"")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Some(Duration::from_secs(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        match u64::try_from(v) {
            Ok(v) => self.visit_u64(v),
            Err(_) => {
                error!("Failed to parse duration: negative durations are not allowed, ignoring");
                Ok(None)
            }
        }
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        if v < 0f64 {
            error!("Failed to parse duration: negative durations are not allowed, ignoring");
            return Ok(None);
        }
        from_nanos_f64(v * 1e9)
            .map(Some)
            .ok_or_else(|| E::custom(format!("invalid duration {v}")))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        parse_duration(v).map(Some).map_err(E::custom)
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
        d.deserialize_any(DurationVisitor)
    }
}

pub fn deserialize_optional_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    deserializer.deserialize_any(DurationVisitor)
}

pub fn deserialize_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Duration, D::Error> {
    deserialize_optional_duration(deserializer)?
        .ok_or_else(|| de::Error::custom("expected a non-negative duration"))
}

/// Tags as a map or as a `"key:value,key2:value2"` string, in declaration order.
pub fn deserialize_tags<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<(String, String)>, D::Error> {
    struct TagsVisitor;

    impl<'de> Visitor<'de> for TagsVisitor {
        type Value = Vec<(String, String)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a map of tags or a \"key:value,...\" string")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            v.split(',')
                .map(str::trim)
                .filter(|pair| !pair.is_empty())
                .map(|pair| {
                    pair.split_once(':')
                        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                        .ok_or_else(|| E::custom(format!("tag {pair:?} is not key:value")))
                })
                .collect()
        }

        fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> Result<Self::Value, M::Error> {
            let mut tags = Vec::new();
            while let Some((k, v)) = map.next_entry::<String, String>()? {
                tags.push((k, v));
            }
            Ok(tags)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }
    }

    deserializer.deserialize_any(TagsVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("0.5"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("1m30s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("2h 5m"), Ok(Duration::from_secs(7500)));
        assert_eq!(parse_duration("20us"), Ok(Duration::from_micros(20)));
        assert!(parse_duration("10 parsecs").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            let config = load_config(Path::new("missing.yaml")).unwrap();
            assert_eq!(config, AgentConfig::default());
            assert_eq!(config.interval, Duration::from_secs(10));
            assert_eq!(config.connect_retry_delay, Duration::from_secs(15));
            assert_eq!(config.log_level, LogLevel::Info);
            Ok(())
        });
    }

    #[test]
    fn test_yaml_with_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "agent.yaml",
                r#"
interval: 5s
round_interval: false
precision: 1
flush_interval: 30
metric_batch_size: 50
metric_buffer_limit: 500
global_tags:
  env: prod
  team: metrics
log_level: debug
"#,
            )?;
            jail.set_env("TELEMETRY_AGENT_FLUSH_INTERVAL", "2m");
            jail.set_env("TELEMETRY_AGENT_COLLECTION_JITTER", "0.25");

            let config = load_config(Path::new("agent.yaml")).unwrap();
            assert_eq!(config.interval, Duration::from_secs(5));
            assert!(!config.round_interval);
            assert_eq!(config.precision, Some(Duration::from_secs(1)));
            assert_eq!(config.flush_interval, Duration::from_secs(120));
            assert_eq!(config.collection_jitter, Duration::from_millis(250));
            assert_eq!(config.metric_batch_size, 50);
            assert_eq!(
                config.global_tags,
                vec![
                    ("env".to_string(), "prod".to_string()),
                    ("team".to_string(), "metrics".to_string())
                ]
            );
            assert_eq!(config.log_level, LogLevel::Debug);
            Ok(())
        });
    }

    #[test]
    fn test_tags_from_env_string() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("TELEMETRY_AGENT_GLOBAL_TAGS", "env:staging, region:eu");
            let config = load_config(Path::new("missing.yaml")).unwrap();
            assert_eq!(
                config.global_tags,
                vec![
                    ("env".to_string(), "staging".to_string()),
                    ("region".to_string(), "eu".to_string())
                ]
            );
            Ok(())
        });
    }

    #[test]
    fn test_invalid_log_level_falls_back() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("TELEMETRY_AGENT_LOG_LEVEL", "loud");
            let config = load_config(Path::new("missing.yaml")).unwrap();
            assert_eq!(config.log_level, LogLevel::Info);
            Ok(())
        });
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        let config = AgentConfig {
            metric_batch_size: 100,
            metric_buffer_limit: 10,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));

        let config = AgentConfig {
            interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AgentConfig {
            channel_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_interval_rejected_on_load() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("TELEMETRY_AGENT_INTERVAL", "0");
            assert!(load_config(Path::new("missing.yaml")).is_err());
            Ok(())
        });
    }
}

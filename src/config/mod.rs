use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

pub const DEFAULT_CONFIG_TOML: &str = include_str!("../../config.toml");
pub const DISCOVERED_CONFIG_FILE: &str = "gearhop.toml";
const CONFIG_PATH_ARG: &str = "--config";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub wire: WireConfig,
    pub broker: BrokerConfig,
    pub housekeeping: HousekeepingConfig,
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct WireConfig {
    pub max_packet_size_bytes: usize,
    pub max_pending_write_bytes: usize,
    pub poll_interval_ms: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Node segment of job handles; empty means a random id per process.
    pub handle_prefix: String,
    /// Sleeping workers woken per job arrival; 0 wakes all of them.
    pub worker_wakeup: u32,
    /// How long finished jobs stay queryable before eviction.
    pub retention_ms: u64,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct HousekeepingConfig {
    pub interval_ms: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub engine: String,
    pub path: String,
    #[serde(default)]
    pub sled: SledConfig,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct SledConfig {
    pub cache_capacity: Option<u64>,
    pub mode: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_toml_str(DEFAULT_CONFIG_TOML, Vec::<String>::new())
            .expect("embedded default config must be valid")
    }
}

impl AppConfig {
    /// Resolves the config source (`--config <path>`, `./gearhop.toml`, embedded defaults)
    /// and applies every remaining `--section.key value` pair as an override.
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let (explicit_path, overrides) = split_config_path_arg(args)?;

        if let Some(path) = explicit_path {
            return Self::load_from_toml_with_args(path, overrides);
        }

        let discovered = PathBuf::from(DISCOVERED_CONFIG_FILE);
        if discovered.is_file() {
            return Self::load_from_toml_with_args(discovered, overrides);
        }

        Self::from_toml_str(DEFAULT_CONFIG_TOML, overrides)
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let display_path = path.as_ref().to_string_lossy().to_string();
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: display_path.clone(),
            source,
        })?;

        Self::parse_with_overrides(&toml_content, &display_path, args)
    }

    pub fn from_toml_str(
        toml_content: &str,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        Self::parse_with_overrides(toml_content, "<embedded>", args)
    }

    fn parse_with_overrides(
        toml_content: &str,
        origin: &str,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut root_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: origin.to_owned(),
                    source,
                })?;

        for (key_path, raw_value) in parse_cli_overrides(args)? {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        root_value.try_into().map_err(ConfigError::Deserialize)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI argument '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument '{arg}', expected '--config <path>' or '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

fn split_config_path_arg(
    args: impl IntoIterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<String>), ConfigError> {
    let mut explicit_path = None;
    let mut remaining = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == CONFIG_PATH_ARG {
            let path = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: "config".to_owned(),
            })?;
            explicit_path = Some(PathBuf::from(path));
            continue;
        }
        remaining.push(arg);
    }

    Ok((explicit_path, remaining))
}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };
        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;
        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }
    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let (final_key, sections) = parts.split_last().ok_or_else(|| ConfigError::InvalidPath {
        key: key_path.to_owned(),
    })?;

    let mut current = root;
    for section in sections {
        current = current
            .as_table_mut()
            .and_then(|table| table.get_mut(*section))
            .ok_or_else(unknown)?;
    }

    let current_value = current
        .as_table_mut()
        .and_then(|table| table.get_mut(*final_key))
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::{AppConfig, ConfigError};

    fn write_temp_config(content: &str, suffix: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "gearhop-config-test-{suffix}-{}.toml",
            std::process::id()
        ));
        fs::write(&path, content).expect("failed to write temp config");
        path
    }

    fn args(pairs: &[&str]) -> Vec<String> {
        pairs.iter().map(|value| (*value).to_owned()).collect()
    }

    #[test]
    fn embedded_defaults_parse() {
        let config = AppConfig::default();

        assert_eq!(config.server.port, 4730);
        assert_eq!(config.storage.engine, "sled");
        assert_eq!(config.broker.worker_wakeup, 0);
        assert_eq!(config.wire.max_packet_size_bytes, 8_388_608);
        assert_eq!(config.storage.sled.mode.as_deref(), Some("low_space"));
        assert_eq!(config.storage.sled.cache_capacity, None);
    }

    #[test]
    fn argv_overrides_matching_toml_paths() {
        let config = AppConfig::load_with_discovery(args(&[
            "--server.port",
            "7003",
            "--logging.human_friendly",
            "true",
            "--broker.handle_prefix",
            "node-a",
            "--storage.engine",
            "memory",
        ]))
        .expect("overrides should apply to embedded defaults");

        assert_eq!(config.server.port, 7003);
        assert!(config.logging.human_friendly);
        assert_eq!(config.broker.handle_prefix, "node-a");
        assert_eq!(config.storage.engine, "memory");
    }

    #[test]
    fn explicit_config_path_is_loaded() {
        let path = write_temp_config(
            &super::DEFAULT_CONFIG_TOML.replace("retention_ms = 0", "retention_ms = 2500"),
            "explicit",
        );

        let config = AppConfig::load_with_discovery(vec![
            "--config".to_owned(),
            path.to_string_lossy().to_string(),
            "--housekeeping.interval_ms".to_owned(),
            "250".to_owned(),
        ])
        .expect("explicit config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.broker.retention_ms, 2500);
        assert_eq!(config.housekeeping.interval_ms, 250);
    }

    #[test]
    fn rejects_unknown_override_path() {
        let err = AppConfig::load_with_discovery(args(&["--broker.nonexistent", "x"]))
            .expect_err("unknown override key should fail");
        assert!(matches!(err, ConfigError::UnknownPath { .. }));
    }

    #[test]
    fn rejects_value_of_wrong_type() {
        let err = AppConfig::load_with_discovery(args(&["--server.port", "many"]))
            .expect_err("non-numeric port should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValueForType {
                expected: "integer",
                ..
            }
        ));
    }

    #[test]
    fn rejects_table_override_and_dangling_flag() {
        let err = AppConfig::load_with_discovery(args(&["--storage.sled", "x"]))
            .expect_err("tables cannot be overridden");
        assert!(matches!(err, ConfigError::UnsupportedOverrideType { .. }));

        let err = AppConfig::load_with_discovery(args(&["--config"]))
            .expect_err("config flag needs a value");
        assert!(matches!(err, ConfigError::MissingValueForArg { .. }));
    }
}

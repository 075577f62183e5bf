use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_CONFIG_FILE: &str = "vizdebug.toml";
const CONFIG_PATH_ARG: &str = "--config";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub receiver: ReceiverConfig,
    pub reaper: ReaperConfig,
    pub store: StoreConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 4444,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub timeout_ms: u64,
    pub read_chunk_bytes: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            read_chunk_bytes: 8 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReaperConfig {
    pub interval_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self { interval_ms: 1_000 }
    }
}

/// `evict_after_seconds = 0` keeps every identity's last snapshot until
/// shutdown.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub evict_after_seconds: u64,
}

impl AppConfig {
    /// Resolves the config file from `--config <path>`, then
    /// `vizdebug.toml` in the working directory, then built-in defaults.
    /// Every other argument must be a `--section.key value` override.
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let (explicit_path, overrides) = split_config_path_arg(args)?;

        match explicit_path {
            Some(path) => Self::load_from_toml_with_args(path, overrides),
            None => {
                let discovered = PathBuf::from(DEFAULT_CONFIG_FILE);
                if discovered.is_file() {
                    Self::load_from_toml_with_args(discovered, overrides)
                } else {
                    Self::load_defaults_with_args(overrides)
                }
            }
        }
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        let file_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: path.as_ref().to_string_lossy().to_string(),
                    source,
                })?;

        let mut root_value = default_value()?;
        merge_values(&mut root_value, file_value);
        Self::finish(root_value, args)
    }

    pub fn load_defaults_with_args(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        Self::finish(default_value()?, args)
    }

    fn finish(mut root_value: Value, args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: Self = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.receiver.timeout_ms == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "receiver.timeout_ms",
                reason: "must be greater than zero",
            });
        }
        if self.receiver.read_chunk_bytes == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "receiver.read_chunk_bytes",
                reason: "must be greater than zero",
            });
        }
        Ok(())
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
    Defaults(toml::ser::Error),
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
    InvalidSetting {
        key: &'static str,
        reason: &'static str,
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
            Self::Defaults(source) => write!(f, "failed to render default config: {source}"),
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
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
            Self::InvalidSetting { key, reason } => write!(f, "invalid '{key}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_value() -> Result<Value, ConfigError> {
    Value::try_from(AppConfig::default()).map_err(ConfigError::Defaults)
}

// Tables merge key by key; any other value in `overlay` replaces the base.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => {
                        base_table.insert(key, overlay_value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn split_config_path_arg(
    args: impl IntoIterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<String>), ConfigError> {
    let mut path = None;
    let mut remaining = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == CONFIG_PATH_ARG {
            let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: "config".to_owned(),
            })?;
            path = Some(PathBuf::from(value));
        } else {
            remaining.push(arg);
        }
    }

    Ok((path, remaining))
}

fn parse_cli_overrides(args: impl IntoIterator<Item = String>) -> Result<Vec<(String, String)>, ConfigError> {
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

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        let table = current
            .as_table_mut()
            .ok_or_else(|| ConfigError::UnknownPath {
                key: key_path.to_owned(),
            })?;
        current = table.get_mut(*section).ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;
    }

    let final_key = parts[parts.len() - 1];
    let table = current
        .as_table_mut()
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;
    let current_value = table
        .get_mut(final_key)
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => {
            let parsed = raw_value
                .parse::<i64>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "integer",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Integer(parsed))
        }
        Value::Float(_) => {
            let parsed = raw_value
                .parse::<f64>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "float",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Float(parsed))
        }
        Value::Boolean(_) => {
            let parsed = raw_value
                .parse::<bool>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "boolean",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Boolean(parsed))
        }
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
            "vizdebug-config-test-{suffix}-{}.toml",
            std::process::id()
        ));
        fs::write(&path, content).expect("failed to write temp config");
        path
    }

    #[test]
    fn defaults_listen_on_all_interfaces_port_4444() {
        let config = AppConfig::load_defaults_with_args(Vec::<String>::new())
            .expect("defaults should load");

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 4444);
        assert_eq!(config.receiver.timeout_ms, 500);
        assert_eq!(config.reaper.interval_ms, 1_000);
        assert_eq!(config.store.evict_after_seconds, 0);
    }

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let path = write_temp_config(
            r#"
[server]
port = 5555

[logging]
level = "debug"
"#,
            "partial",
        );

        let config = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect("config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.server.port, 5555);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.human_friendly);
        assert_eq!(config.receiver.timeout_ms, 500);
    }

    #[test]
    fn argv_overrides_matching_toml_paths() {
        let path = write_temp_config(
            r#"
[logging]
level = "debug"
human_friendly = false

[receiver]
timeout_ms = 500
"#,
            "override",
        );

        let config = AppConfig::load_with_discovery(vec![
            "--config".to_owned(),
            path.to_string_lossy().to_string(),
            "--logging.human_friendly".to_owned(),
            "true".to_owned(),
            "--receiver.timeout_ms".to_owned(),
            "250".to_owned(),
            "--store.evict_after_seconds".to_owned(),
            "600".to_owned(),
        ])
        .expect("config with overrides should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert!(config.logging.human_friendly);
        assert_eq!(config.receiver.timeout_ms, 250);
        assert_eq!(config.store.evict_after_seconds, 600);
    }

    #[test]
    fn rejects_unknown_override_path() {
        let err = AppConfig::load_defaults_with_args(vec![
            "--server.nonexistent".to_owned(),
            "x".to_owned(),
        ])
        .expect_err("unknown override key should fail");

        assert!(matches!(err, ConfigError::UnknownPath { .. }));
    }

    #[test]
    fn rejects_override_with_wrong_type() {
        let err = AppConfig::load_defaults_with_args(vec![
            "--server.port".to_owned(),
            "many".to_owned(),
        ])
        .expect_err("non-integer port should fail");

        assert!(matches!(
            err,
            ConfigError::InvalidValueForType {
                expected: "integer",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_receiver_timeout() {
        let err = AppConfig::load_defaults_with_args(vec![
            "--receiver.timeout_ms".to_owned(),
            "0".to_owned(),
        ])
        .expect_err("zero timeout should fail");

        assert!(matches!(
            err,
            ConfigError::InvalidSetting {
                key: "receiver.timeout_ms",
                ..
            }
        ));
    }

    #[test]
    fn config_flag_without_path_is_rejected() {
        let err = AppConfig::load_with_discovery(vec!["--config".to_owned()])
            .expect_err("missing path should fail");

        assert!(matches!(err, ConfigError::MissingValueForArg { .. }));
    }
}

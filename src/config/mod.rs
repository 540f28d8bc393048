mod datasource;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

pub use datasource::{resolve_data_sources, DataSourceConfig, DataSourceRole};

pub const CONFIG_FILE_NAME: &str = "reportd.toml";
const CONFIG_PATH_ARG: &str = "--config";

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub wire: WireConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub datasources: Vec<DataSourceConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
    #[serde(default = "default_log_stream")]
    pub stream: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 4710,
            tls_enabled: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WireConfig {
    pub max_message_size_bytes: usize,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_message_size_bytes: 8 * 1024 * 1024,
            read_timeout_ms: 100,
            write_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub engine: String,
    pub path: String,
    #[serde(default)]
    pub self_debug_path: Option<String>,
    #[serde(default)]
    pub sled: SledConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: "sled".to_owned(),
            path: "~/.reportd/data".to_owned(),
            self_debug_path: None,
            sled: SledConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct SledConfig {
    #[serde(default)]
    pub cache_capacity: Option<u64>,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub execution_threads: usize,
    pub queue_capacity: usize,
    pub max_idle_wait_ms: u64,
    pub utc_offset_minutes: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            execution_threads: 4,
            queue_capacity: 64,
            max_idle_wait_ms: 60_000,
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportsConfig {
    pub definitions_path: String,
    pub default_locale: String,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            definitions_path: "~/.reportd/definitions".to_owned(),
            default_locale: "en".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotificationsConfig {
    pub spool_path: String,
    pub sender_address: String,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            spool_path: "~/.reportd/outbox".to_owned(),
            sender_address: "reportd@localhost".to_owned(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub interval_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: 300_000,
        }
    }
}

fn default_log_stream() -> String {
    "stdout".to_owned()
}

impl AppConfig {
    // Finds the config file (`--config`, cwd, $HOME/.reportd, /etc/reportd) and applies remaining args as overrides.
    pub fn load_with_discovery(
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let (explicit_path, override_args) = split_config_path_arg(args)?;
        let path = match explicit_path {
            Some(path) => path,
            None => discover_config_path().ok_or(ConfigError::NotFound {
                searched: candidate_paths()
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect(),
            })?,
        };

        Self::load_from_toml_with_args(path, override_args)
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        let mut root_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: path.as_ref().to_string_lossy().to_string(),
                    source,
                })?;

        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        root_value.try_into().map_err(ConfigError::Deserialize)
    }
}

fn split_config_path_arg(
    args: impl IntoIterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<String>), ConfigError> {
    let mut path = None;
    let mut rest = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == CONFIG_PATH_ARG {
            let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: "config".to_owned(),
            })?;
            path = Some(PathBuf::from(value));
        } else {
            rest.push(arg);
        }
    }

    Ok((path, rest))
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join(".reportd").join(CONFIG_FILE_NAME));
    }
    candidates.push(PathBuf::from("/etc/reportd").join(CONFIG_FILE_NAME));
    candidates
}

fn discover_config_path() -> Option<PathBuf> {
    candidate_paths().into_iter().find(|path| path.is_file())
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
    NotFound {
        searched: Vec<String>,
    },
    DataSource(String),
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
            Self::NotFound { searched } => write!(
                f,
                "no config file found; searched: {}",
                searched.join(", ")
            ),
            Self::DataSource(message) => write!(f, "invalid datasources section: {message}"),
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
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ValueKind {
    Text,
    Integer,
    Float,
    Boolean,
}

impl ValueKind {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::String(_) => Some(Self::Text),
            Value::Integer(_) => Some(Self::Integer),
            Value::Float(_) => Some(Self::Float),
            Value::Boolean(_) => Some(Self::Boolean),
            Value::Datetime(_) | Value::Array(_) | Value::Table(_) => None,
        }
    }
}

// Keys that may be overridden even when the file leaves them to defaults.
const DEFAULTED_KEYS: &[(&str, ValueKind)] = &[
    ("logging.stream", ValueKind::Text),
    ("server.host", ValueKind::Text),
    ("server.port", ValueKind::Integer),
    ("server.tls_enabled", ValueKind::Boolean),
    ("wire.max_message_size_bytes", ValueKind::Integer),
    ("wire.read_timeout_ms", ValueKind::Integer),
    ("wire.write_timeout_ms", ValueKind::Integer),
    ("storage.engine", ValueKind::Text),
    ("storage.path", ValueKind::Text),
    ("storage.self_debug_path", ValueKind::Text),
    ("storage.sled.cache_capacity", ValueKind::Integer),
    ("storage.sled.mode", ValueKind::Text),
    ("scheduler.execution_threads", ValueKind::Integer),
    ("scheduler.queue_capacity", ValueKind::Integer),
    ("scheduler.max_idle_wait_ms", ValueKind::Integer),
    ("scheduler.utc_offset_minutes", ValueKind::Integer),
    ("reports.definitions_path", ValueKind::Text),
    ("reports.default_locale", ValueKind::Text),
    ("notifications.spool_path", ValueKind::Text),
    ("notifications.sender_address", ValueKind::Text),
    ("maintenance.interval_ms", ValueKind::Integer),
];

// Accepts `--section.key value` and `--section.key=value`.
fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut overrides = Vec::new();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let Some(key) = arg.strip_prefix("--").filter(|key| !key.is_empty()) else {
            return Err(ConfigError::InvalidArgFormat { arg: arg.clone() });
        };

        let entry = match key.split_once('=') {
            Some((key, value)) => (key.to_owned(), value.to_owned()),
            None => {
                let value = args.next().ok_or_else(|| ConfigError::MissingValueForArg {
                    key: key.to_owned(),
                })?;
                (key.to_owned(), value)
            }
        };
        overrides.push(entry);
    }

    Ok(overrides)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let segments: Vec<&str> = key_path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }
    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };
    let defaulted_kind = DEFAULTED_KEYS
        .iter()
        .find(|(key, _)| *key == key_path)
        .map(|(_, kind)| *kind);

    let Some((leaf, sections)) = segments.split_last() else {
        return Err(unknown());
    };
    let mut table = root.as_table_mut().ok_or_else(unknown)?;
    for section in sections {
        if !table.contains_key(*section) {
            if defaulted_kind.is_none() {
                return Err(unknown());
            }
            table.insert((*section).to_owned(), Value::Table(toml::Table::new()));
        }
        table = table
            .get_mut(*section)
            .and_then(Value::as_table_mut)
            .ok_or_else(unknown)?;
    }

    let kind = match table.get(*leaf) {
        Some(current) => ValueKind::of(current).ok_or_else(|| {
            ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            }
        })?,
        None => defaulted_kind.ok_or_else(unknown)?,
    };
    table.insert((*leaf).to_owned(), parse_typed(key_path, raw_value, kind)?);
    Ok(())
}

fn parse_typed(key_path: &str, raw_value: &str, kind: ValueKind) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match kind {
        ValueKind::Text => Ok(Value::String(raw_value.to_owned())),
        ValueKind::Integer => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        ValueKind::Float => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        ValueKind::Boolean => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
    }
}

use serde_json::{json, Value};

use crate::config::StorageConfig;

use super::StorageError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageEngine {
    Sled,
}

impl StorageEngine {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sled => "sled",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SledMode {
    LowSpace,
    HighThroughput,
}

impl SledMode {
    pub fn as_sled(self) -> sled::Mode {
        match self {
            Self::LowSpace => sled::Mode::LowSpace,
            Self::HighThroughput => sled::Mode::HighThroughput,
        }
    }
}

/// Validated `[storage]` engine options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    pub engine: StorageEngine,
    pub cache_capacity: Option<u64>,
    pub mode: Option<SledMode>,
}

impl EngineSettings {
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let engine = match config.engine.trim() {
            "sled" => StorageEngine::Sled,
            other => {
                return Err(StorageError::UnsupportedEngine {
                    engine: other.to_owned(),
                })
            }
        };
        let mode = config
            .sled
            .mode
            .as_deref()
            .map(|raw| match raw {
                "low_space" => Ok(SledMode::LowSpace),
                "high_throughput" => Ok(SledMode::HighThroughput),
                other => Err(StorageError::InvalidSledMode {
                    mode: other.to_owned(),
                }),
            })
            .transpose()?;

        Ok(Self {
            engine,
            cache_capacity: config.sled.cache_capacity,
            mode,
        })
    }

    pub fn log_payload(&self) -> Value {
        json!({
            "engine": self.engine.as_str(),
            "cache_capacity": self.cache_capacity,
            "mode": self.mode.map(|mode| match mode {
                SledMode::LowSpace => "low_space",
                SledMode::HighThroughput => "high_throughput",
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{SledConfig, StorageConfig};
    use crate::storage::StorageError;

    use super::{EngineSettings, SledMode, StorageEngine};

    fn storage_config(engine: &str, mode: Option<&str>) -> StorageConfig {
        StorageConfig {
            engine: engine.to_owned(),
            sled: SledConfig {
                cache_capacity: Some(1 << 20),
                mode: mode.map(str::to_owned),
            },
            ..StorageConfig::default()
        }
    }

    #[test]
    fn resolves_sled_options() {
        let settings = EngineSettings::from_config(&storage_config("sled", Some("low_space")))
            .expect("settings should resolve");
        assert_eq!(settings.engine, StorageEngine::Sled);
        assert_eq!(settings.mode, Some(SledMode::LowSpace));
        assert_eq!(settings.cache_capacity, Some(1 << 20));
        assert_eq!(settings.log_payload()["mode"], "low_space");
    }

    #[test]
    fn unset_mode_leaves_sled_default() {
        let settings = EngineSettings::from_config(&storage_config("sled", None))
            .expect("settings should resolve");
        assert_eq!(settings.mode, None);
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!(matches!(
            EngineSettings::from_config(&storage_config("sled", Some("fast"))),
            Err(StorageError::InvalidSledMode { mode }) if mode == "fast"
        ));
    }
}

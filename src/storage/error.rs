use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum StorageError {
    UnsupportedEngine {
        engine: String,
    },
    InvalidSledMode {
        mode: String,
    },
    HomeDirectoryUnavailable,
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        record: &'static str,
        source: serde_json::Error,
    },
    Deserialize {
        record: &'static str,
        source: serde_json::Error,
    },
    CorruptKey {
        key: String,
    },
    Sled(sled::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedEngine { engine } => {
                write!(f, "unsupported storage.engine '{engine}'; only 'sled' is available")
            }
            Self::InvalidSledMode { mode } => write!(
                f,
                "invalid storage.sled.mode '{mode}'; allowed values: low_space, high_throughput"
            ),
            Self::HomeDirectoryUnavailable => {
                write!(f, "cannot expand '~' in a configured path: HOME is not set")
            }
            Self::CreateDataDir { path, source } => write!(
                f,
                "failed to create storage data directory '{}': {source}",
                path.display()
            ),
            Self::Serialize { record, source } => {
                write!(f, "failed to serialize {record} for storage: {source}")
            }
            Self::Deserialize { record, source } => {
                write!(f, "failed to deserialize {record} from storage: {source}")
            }
            Self::CorruptKey { key } => write!(f, "unparseable storage key '{key}'"),
            Self::Sled(source) => write!(f, "sled storage error: {source}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CreateDataDir { source, .. } => Some(source),
            Self::Serialize { source, .. } | Self::Deserialize { source, .. } => Some(source),
            Self::Sled(source) => Some(source),
            _ => None,
        }
    }
}

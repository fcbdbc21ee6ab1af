use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Problems with the collector's configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("malformed TOML in {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
    #[error("account {platform}/{id} is declared more than once in {path}")]
    DuplicateAccount {
        platform: String,
        id: String,
        path: PathBuf,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

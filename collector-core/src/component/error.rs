use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("component {platform}/{name} not found")]
    NotFound { platform: String, name: String },
    #[error("component {component} is invalid: {reason}")]
    Validation { component: String, reason: String },
    #[error("failed to read component {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse component {path}: {source}")]
    Parse {
        source: serde_yaml::Error,
        path: PathBuf,
    },
}

impl ComponentError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ComponentError::NotFound { .. })
    }
}

pub type ComponentResult<T> = Result<T, ComponentError>;

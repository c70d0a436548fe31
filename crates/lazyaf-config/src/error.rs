//! Configuration errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("missing setting: {0}")]
    MissingSetting(String),

    #[error("invalid setting {name}: {value}")]
    InvalidSetting { name: String, value: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("credentials error: {0}")]
    Credentials(String),

    #[error("api error: {0}")]
    Api(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Keyring(#[from] keyring::Error),

    #[error(transparent)]
    Settings(#[from] config::ConfigError),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    /// Only raised where a caller cannot continue without the store, such as
    /// a one-shot export.
    #[error(transparent)]
    Storage(#[from] StorageWarning),
}

/// A storage fault that was absorbed instead of propagated.
///
/// The store hands these back so the poll loop can surface them, but a
/// warning never stops monitoring: the live observation is still shown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("storage unavailable during {operation}: {detail}")]
pub struct StorageWarning {
    pub operation: &'static str,
    pub detail: String,
}

impl StorageWarning {
    pub fn new(operation: &'static str, err: impl fmt::Display) -> Self {
        Self {
            operation,
            detail: err.to_string(),
        }
    }
}

use std::io;

use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, AshletError>;

/// Internal failure modes. These never cross the IPC boundary directly —
/// call sites log them and degrade gracefully per the wire-level
/// [`ClientErrorCode`] instead.
#[derive(Error, Debug)]
pub enum AshletError {
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(reqwest::StatusCode, String),

    #[error("no text content in response")]
    EmptyGeneration,

    #[error("embedding request returned no data")]
    EmptyEmbedding,

    #[error("template render failed: {0}")]
    Template(String),

    #[error("config parse failed: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

/// Error codes surfaced on the wire, per the external interface's error
/// taxonomy. Constructed explicitly at the handful of call sites that raise
/// them — never derived automatically from [`AshletError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorCode {
    NotConfigured,
    ApiError,
    InvalidRequest,
    ConfigError,
    UnknownAction,
}

impl ClientErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientErrorCode::NotConfigured => "not_configured",
            ClientErrorCode::ApiError => "api_error",
            ClientErrorCode::InvalidRequest => "invalid_request",
            ClientErrorCode::ConfigError => "config_error",
            ClientErrorCode::UnknownAction => "unknown_action",
        }
    }
}

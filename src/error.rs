use std::time::Duration;
use thiserror::Error;
use url::ParseError;

pub type Result<T, E = RealtimeError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("WebSocket Error: {0}")]
    WebsocketError(String),

    #[error("Authentication Error: {0}")]
    AuthenticationError(String),

    #[error("Authentication Timeout: no auth response within {0:?}")]
    AuthTimeout(Duration),

    #[error("Reconnect Exhausted: {connection_id} gave up after {attempts} attempts")]
    ReconnectExhausted {
        connection_id: String,
        attempts: u32,
    },

    #[error("Unknown Connection: no live connection for '{0}'")]
    UnknownConnection(String),

    #[error("Invalid Connection Id: '{0}'")]
    InvalidConnectionId(String),

    #[error("Unknown Channel Kind: '{0}'")]
    UnknownChannel(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Realtime manager is not running")]
    ManagerStopped,

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("JSON Serialization/Deserialization Error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("URL Parsing Error: {0}")]
    UrlParseError(#[from] ParseError),

    #[error("Query String Error: {0}")]
    QueryStringError(#[from] serde_qs::Error),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
}

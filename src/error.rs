use std::time::Duration;

use thiserror::Error;

use crate::core::domain::ConnectionState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed ({status}): {body}")]
    Auth { status: u16, body: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("No ready signal within {0:?}")]
    ReadySignalTimeout(Duration),

    #[error("Connection closed during handshake: {0}")]
    HandshakeClosed(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session destroyed")]
    Destroyed,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection state {0} forbids connecting")]
    StateForbidsConnect(ConnectionState),

    #[error("Server error: {0}")]
    Server(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

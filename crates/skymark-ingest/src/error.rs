//! Error types for the listener pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the listener.
#[derive(Error, Debug)]
pub enum Error {
    /// Frame, CAR or record decoding error.
    #[error(transparent)]
    Core(#[from] skymark_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket error from the firehose connection.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),

    /// HTTP error talking to the AppView.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Publishing a descriptor to a downstream queue failed.
    #[error("Publish error: {0}")]
    Publish(String),

    /// Membership listing failed or returned unusable data.
    #[error("Membership error: {0}")]
    Membership(String),

    /// The work queue has no remaining consumers.
    #[error("Work queue closed")]
    QueueClosed,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Installing the process signal handler failed.
    #[error("Signal handler error: {0}")]
    Signal(#[from] ctrlc::Error),
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

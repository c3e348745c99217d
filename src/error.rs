use std::time::Duration;

/// Errors surfaced by the alert pipeline and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing credentials or an invalid tunable. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to load configuration: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// Not enough bars to satisfy a lookback or warm-up request
    #[error("insufficient data for {context}: need {needed}, have {available}")]
    InsufficientData {
        context: String,
        needed: usize,
        available: usize,
    },

    /// Collaborator call or subscription failure
    #[error("transport error: {0}")]
    Transport(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Exchange answered but rejected the request
    #[error("exchange error ({status}): {message}")]
    Exchange { status: u16, message: String },

    #[error("rate limit exceeded after waiting {0:?}")]
    RateLimitExceeded(Duration),

    #[error("notification error: {0}")]
    Notification(String),

    #[error("invalid candle data: {0}")]
    InvalidData(String),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn insufficient(context: impl Into<String>, needed: usize, available: usize) -> Self {
        Self::InsufficientData {
            context: context.into(),
            needed,
            available,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

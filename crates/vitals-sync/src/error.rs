use thiserror::Error;

/// Main error type for vitals-sync
#[derive(Error, Debug)]
pub enum VitalsError {
    #[error("Network unavailable: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Aggregation error: {0}")]
    Aggregation(String),

    #[error("Sync failed after {attempts} attempts: {message}")]
    PermanentFailure { attempts: u32, message: String },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, VitalsError>;

impl VitalsError {
    /// Create a configuration error from a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid sample error from a message
    pub fn invalid_sample(msg: impl Into<String>) -> Self {
        Self::InvalidSample(msg.into())
    }

    /// Create an invalid response error from a message
    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Create a database error with context
    pub fn database(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Database(format!("{}: {}", context, err))
    }

    /// Whether this error is a connectivity problem that may clear up on its own.
    ///
    /// Connection failures, timeouts, DNS and unreachable hosts count, as do
    /// gateway responses (502/503/504) from a proxy in front of the backend.
    /// Everything else is an application error and is never auto-retried.
    pub fn is_network(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Self::Api { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for VitalsError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<sqlx::Error> for VitalsError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => {
                Self::Database("Timed out waiting for a pooled connection".to_string())
            }
            other => Self::Database(other.to_string()),
        }
    }
}

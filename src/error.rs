// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

/// Satu tipe error untuk seluruh pipeline (intake, reconcile, stream).
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// Non-zero `retCode` from Bybit.
    #[error("Bybit API Error ({code}): {message}")]
    Exchange { code: i64, message: String },

    /// Request never produced a usable HTTP response.
    #[error("Network error: {0}")]
    Transport(String),

    /// Exchange payload is missing a field or carries a malformed one.
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Lock store error: {0}")]
    LockStore(String),

    #[error("Order store error: {0}")]
    Store(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("Order stream error: {0}")]
    Stream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Condition not met after {attempts} attempts")]
    Timeout { attempts: u32 },
}

impl ExecError {
    /// Label pendek untuk metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::Exchange { .. } => "exchange",
            ExecError::Transport(_) => "transport",
            ExecError::DataIntegrity(_) => "data_integrity",
            ExecError::InvalidSignal(_) => "invalid_signal",
            ExecError::LockStore(_) => "lock_store",
            ExecError::Store(_) => "store",
            ExecError::Notify(_) => "notify",
            ExecError::Stream(_) => "stream",
            ExecError::Config(_) => "config",
            ExecError::Timeout { .. } => "timeout",
        }
    }
}

impl From<redis::RedisError> for ExecError {
    fn from(e: redis::RedisError) -> Self {
        ExecError::LockStore(e.to_string())
    }
}

impl From<sqlx::Error> for ExecError {
    fn from(e: sqlx::Error) -> Self {
        ExecError::Store(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExecError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ExecError::Stream(e.to_string())
    }
}

//! Error types for the alert pipeline

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the alert pipeline
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    // RPC errors
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC timeout after {0}ms")]
    RpcTimeout(u64),

    #[error("All balance providers failed: {0}")]
    ProvidersExhausted(String),

    // Parser errors
    #[error("Transaction parse failed for {signature}: {reason}")]
    Parse { signature: String, reason: String },

    // Shared store errors
    #[error("Store unavailable: {0}")]
    Store(String),

    // Subscription errors
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    // Lifecycle errors
    #[error("Process {0} is not registered")]
    ProcessNotFound(String),

    #[error("Pipeline is shutting down")]
    ShuttingDown,

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_) | Error::RpcTimeout(_) | Error::Store(_) | Error::ProvidersExhausted(_)
        )
    }

    /// Check if this error came from the shared cache store
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::Store(_))
    }
}

// Conversion from solana_client errors
impl From<solana_client::client_error::ClientError> for Error {
    fn from(e: solana_client::client_error::ClientError) -> Self {
        Error::Rpc(e.to_string())
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Rpc(e.to_string())
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

//! Error Module
//!
//! Defines error types and result types used throughout the storage gateway.

use thiserror::Error;

/// Main error type for the storage gateway
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage RPC timeout: {0}")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Upload rolled back: {0}")]
    RolledBack(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl GatewayError {
    /// True when the error means the object does not exist on the cluster.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for GatewayError {
    fn from(err: hyper::Error) -> Self {
        GatewayError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::SerializationError(err.to_string())
    }
}

/// Result type alias for the storage gateway
pub type Result<T> = std::result::Result<T, GatewayError>;

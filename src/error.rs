//! Error types for the Drowse operator

use thiserror::Error;

/// Main error type for Drowse operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Startup configuration error (missing env var, invalid port, ...)
    #[error("configuration error: {0}")]
    Config(String),

    /// A GovernedService spec that cannot be acted on
    #[error("invalid resource: {0}")]
    InvalidResource(String),

    /// Discovery could not map a scale target's kind to an API resource
    #[error("discovery error: no resource mapping for {0}")]
    Discovery(String),

    /// Trigger scaler error (metric backend, metadata parsing)
    #[error("scaler error: {0}")]
    Scaler(#[from] crate::scaling::scalers::ScalerError),

    /// Invalid cron schedule or duration in an enabled period
    #[error("schedule error: {0}")]
    Schedule(String),

    /// No resolver pod is available to receive proxied traffic
    #[error("no resolver pod found")]
    NoResolverPodFound,

    /// A service the resolver asked about is not in the directory
    #[error("service not found in directory: {0}")]
    ServiceNotFound(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The surrounding operation was cancelled
    #[error("context done")]
    ContextDone,

    /// Request rejected because the breaker queue is full
    #[error("breaker full")]
    BreakerFull,
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-resource error with the given message
    pub fn invalid_resource(msg: impl Into<String>) -> Self {
        Self::InvalidResource(msg.into())
    }

    /// Create a schedule error with the given message
    pub fn schedule(msg: impl Into<String>) -> Self {
        Self::Schedule(msg.into())
    }
}

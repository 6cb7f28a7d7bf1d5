//! Trigger scalers
//!
//! A scaler evaluates a single declarative trigger and answers whether the
//! governed workload is idle enough to scale to zero. Triggers are openly
//! typed (`{type, metadata}`); each type maps to one scaler implementation
//! through [`create_scaler`]. Unknown types are rejected at reconcile time.

mod prometheus;

pub use prometheus::PrometheusScaler;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::crd::ScaleTrigger;

/// Errors produced while creating or evaluating a trigger scaler
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScalerError {
    /// Trigger metadata did not parse into the scaler's expected shape
    #[error("failed to parse trigger metadata: {0}")]
    ParseMetadata(String),

    /// The trigger type has no registered scaler
    #[error("unsupported trigger type: {0}")]
    UnsupportedTrigger(String),

    /// The HTTP request could not be constructed
    #[error("failed to build metric query request: {0}")]
    BuildRequest(String),

    /// The HTTP request could not be executed (transport failure)
    #[error("failed to execute metric query request: {0}")]
    ExecuteRequest(String),

    /// The metric backend answered with a non-200 status
    #[error("unexpected metric backend status: {0}")]
    UnexpectedStatus(u16),

    /// The response body was not valid JSON of the expected shape
    #[error("failed to decode metric backend response: {0}")]
    Decode(String),

    /// The query matched more than one series
    #[error("metric query returned multiple results: {0}")]
    MultipleResults(String),

    /// A result was present but carried no value list
    #[error("metric query value list is empty: {0}")]
    EmptyValue(String),

    /// The value list was shorter than `[timestamp, value]`
    #[error("metric query did not return enough values: {0}")]
    ShortValue(String),

    /// The sample value did not parse as a finite float
    #[error("failed to parse metric value: {0}")]
    ParseValue(String),

    /// The sample value was infinite
    #[error("metric query returned an infinite value")]
    InfiniteValue,
}

impl ScalerError {
    /// Whether this error happened at the HTTP layer (request construction,
    /// transport, or status) rather than in the shape of the result. Health
    /// checks report only HTTP-layer failures; result-shape glitches must not
    /// block operation.
    pub fn is_http(&self) -> bool {
        matches!(
            self,
            Self::BuildRequest(_) | Self::ExecuteRequest(_) | Self::UnexpectedStatus(_)
        )
    }
}

/// Capability set every trigger scaler implements.
///
/// A scaler instance is ephemeral: it is created per evaluation cycle with
/// the trigger's metadata and the resolved cooldown period, queried, and
/// closed at the end of the cycle.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Scaler: Send + Sync + std::fmt::Debug {
    /// Whether the workload is idle and may be scaled to zero.
    ///
    /// Returns `false` when the trigger cannot conclude idleness (no data).
    async fn should_scale_to_zero(&self) -> Result<bool, ScalerError>;

    /// Whether a zero-replica workload should be brought back up.
    ///
    /// Fail-open: returns `true` on "no data" so traffic is never stranded.
    async fn should_scale_from_zero(&self) -> Result<bool, ScalerError>;

    /// Whether the trigger's metric source has been continuously up for the
    /// cooldown period. Only HTTP-layer failures are reported as errors.
    async fn is_healthy(&self) -> Result<bool, ScalerError>;

    /// Release pooled connections
    async fn close(&self);
}

/// Build the scaler for a trigger. `prometheus` is the only supported type.
pub fn create_scaler(
    trigger: &ScaleTrigger,
    cooldown_period: Duration,
) -> Result<Box<dyn Scaler>, ScalerError> {
    match trigger.type_.as_str() {
        "prometheus" => Ok(Box::new(PrometheusScaler::new(
            &trigger.metadata,
            cooldown_period,
        )?)),
        other => Err(ScalerError::UnsupportedTrigger(other.to_string())),
    }
}

/// Factory seam for the scale-decision loop, so trigger evaluation can be
/// driven by fakes in tests
#[cfg_attr(test, automock)]
pub trait ScalerFactory: Send + Sync {
    /// Build the scaler for a trigger
    fn create(
        &self,
        trigger: &ScaleTrigger,
        cooldown_period: Duration,
    ) -> Result<Box<dyn Scaler>, ScalerError>;
}

/// Factory that dispatches on the trigger type tag
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultScalerFactory;

impl ScalerFactory for DefaultScalerFactory {
    fn create(
        &self,
        trigger: &ScaleTrigger,
        cooldown_period: Duration,
    ) -> Result<Box<dyn Scaler>, ScalerError> {
        create_scaler(trigger, cooldown_period)
    }
}

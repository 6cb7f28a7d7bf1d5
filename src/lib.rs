//! Drowse - Kubernetes operator for scale-to-zero of idle HTTP services
//!
//! Drowse governs long-running HTTP services and moves each of them between
//! two modes:
//!
//! - **serve**: the target workload has at least one ready replica and the
//!   cluster routes traffic to it normally.
//! - **proxy**: the target is at zero replicas; a shadow endpoint list points
//!   the service's virtual address at the resolver data plane, which buffers
//!   requests and asks the operator to scale the target back up.
//!
//! Transitions are driven by declarative triggers (metric queries evaluated on
//! a timer) and by live request arrivals reported by the resolver.
//!
//! # Modules
//!
//! - [`crd`] - GovernedService custom resource definition
//! - [`controller`] - reconciliation, mode switching, shadow endpoint rewrite
//! - [`informer`] - registry of per-resource watches with start-once guards
//! - [`directory`] - process-wide map of governed services and their modes
//! - [`scaling`] - scale executor, trigger scalers, and the decision loop
//! - [`server`] - control RPC endpoint used by the resolver
//! - [`resolver`] - resolver-side request throttler and breaker
//! - [`schedule`] - cron-window evaluation for enabled periods
//! - [`config`] - environment configuration
//! - [`metrics`] - process-wide prometheus counters
//! - [`error`] - error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod directory;
pub mod error;
pub mod informer;
pub mod metrics;
pub mod resolver;
pub mod scaling;
pub mod schedule;
pub mod server;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

use std::time::Duration;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralizing these here keeps CRD defaults, runtime config, and test
// fixtures consistent.

/// Minimum time between a scale-up and a subsequent scale-down when the
/// GovernedService does not set its own cooldown
pub const DEFAULT_COOLDOWN_PERIOD: Duration = Duration::from_secs(900);

/// Interval of the scale-decision sweep over all governed services
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(30);

/// Hold-off after a request-driven scale-up during which further resolver
/// notifications for the same service are coalesced
pub const DEFAULT_RESCALE_HOLDOFF: Duration = Duration::from_secs(600);

/// Delay between resolver retries while waiting for the target to come up
pub const DEFAULT_RETRY_DURATION: Duration = Duration::from_secs(1);

/// How long a positive endpoint-readiness probe is memoized by the resolver
pub const DEFAULT_TRAFFIC_REENABLE_DURATION: Duration = Duration::from_secs(5);

/// Upper bound on `cooldownPeriod` in seconds (one week)
pub const MAX_COOLDOWN_SECONDS: i32 = 604_800;

/// Label a shadow endpoint list carries to bind it to its governed service
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

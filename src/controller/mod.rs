//! Kubernetes controller for GovernedService resources
//!
//! This module contains the reconciliation logic and the shadow endpoint
//! rewriter it drives.

mod endpoints;
mod reconcile;

pub use endpoints::{
    endpoint_is_active, shadow_slice_name, EndpointRewriter, EndpointSliceClient,
    KubeEndpointSliceClient, KubeServiceClient, ServiceClient,
};
pub use reconcile::{
    any_pod_ready, dynamic_api_for, error_policy, extract_target_info, reconcile, Context,
    GovernedServiceClient, KubeGovernedServiceClient, ModeController, TargetInfo,
};

//! Resolver-side coordination
//!
//! The resolver is the data plane that receives traffic for proxied services.
//! This module holds its coordination pieces: the breaker bounding buffered
//! work and the throttler that parks requests until the operator has brought
//! the target back up.
//!
//! The reverse-proxy framing itself lives outside this crate; only the
//! coordination contract with the operator is implemented here.

mod breaker;
mod throttler;

pub use breaker::Breaker;
pub use throttler::{
    EndpointProbe, KubeEndpointProbe, Throttler, ThrottlerParams,
};

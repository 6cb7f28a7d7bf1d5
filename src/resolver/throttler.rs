//! Request throttler
//!
//! Holds a buffered request for a proxied service until the service has an
//! active endpoint again, then hands it to the caller-supplied resolve
//! function. Readiness probes are memoized for a short window so a burst of
//! held requests does not hammer the API server once the target is back.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Api, ListParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use super::breaker::Breaker;
use crate::controller::endpoint_is_active;
use crate::{Error, Result, SERVICE_NAME_LABEL};

/// Readiness probe for a service's endpoints
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    /// Whether the service has at least one active endpoint
    async fn is_service_ready(&self, namespace: &str, service: &str) -> Result<bool>;
}

/// [`EndpointProbe`] backed by the cluster's EndpointSlice API
pub struct KubeEndpointProbe {
    client: Client,
}

impl KubeEndpointProbe {
    /// Create a new probe
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EndpointProbe for KubeEndpointProbe {
    async fn is_service_ready(&self, namespace: &str, service: &str) -> Result<bool> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("{SERVICE_NAME_LABEL}={service}"));
        let slices = api.list(&lp).await?;

        let active = slices
            .items
            .iter()
            .flat_map(|slice| slice.endpoints.iter())
            .any(endpoint_is_active);
        Ok(active)
    }
}

/// Throttler configuration
#[derive(Clone, Debug)]
pub struct ThrottlerParams {
    /// Delay between readiness retries for one held request
    pub retry_duration: Duration,
    /// How long a positive readiness answer is memoized
    pub traffic_reenable_duration: Duration,
    /// Bound on requests waiting for a forward slot
    pub queue_depth: usize,
    /// Bound on simultaneous forward attempts
    pub max_concurrency: usize,
}

impl Default for ThrottlerParams {
    fn default() -> Self {
        Self {
            retry_duration: crate::DEFAULT_RETRY_DURATION,
            traffic_reenable_duration: crate::DEFAULT_TRAFFIC_REENABLE_DURATION,
            queue_depth: 128,
            max_concurrency: 64,
        }
    }
}

/// Per-request throttling with breaker-bounded concurrency
pub struct Throttler {
    breaker: Breaker,
    probe: Arc<dyn EndpointProbe>,
    retry_duration: Duration,
    traffic_reenable_duration: Duration,
    ready_until: DashMap<String, Instant>,
    queue_sizes: DashMap<String, i64>,
}

impl Throttler {
    /// Create a throttler with the given probe and parameters
    pub fn new(probe: Arc<dyn EndpointProbe>, params: ThrottlerParams) -> Self {
        Self {
            breaker: Breaker::new(params.queue_depth, params.max_concurrency),
            probe,
            retry_duration: params.retry_duration,
            traffic_reenable_duration: params.traffic_reenable_duration,
            ready_until: DashMap::new(),
            queue_sizes: DashMap::new(),
        }
    }

    /// Requests currently held for `(namespace, service)`
    pub fn queue_size(&self, namespace: &str, service: &str) -> i64 {
        self.queue_sizes
            .get(&format!("{namespace}/{service}"))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Hold one request until `target_service` is ready, then resolve it.
    ///
    /// `resolve` receives the attempt number, starting at 1. `on_error` fires
    /// whenever a readiness check fails or comes back negative, so the caller
    /// can (re-)notify the operator that traffic is waiting. The call returns
    /// when the request is resolved, the breaker rejects it, resolution
    /// itself fails, or `cancel` fires.
    pub async fn hold_and_resolve<F, Fut>(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        target_service: &str,
        mut resolve: F,
        on_error: impl Fn(),
    ) -> Result<()>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let key = format!("{namespace}/{target_service}");
        *self.queue_sizes.entry(key.clone()).or_insert(0) += 1;
        let _queue_guard = QueueGuard {
            sizes: &self.queue_sizes,
            key: key.clone(),
        };

        let mut try_count: usize = 1;
        loop {
            let attempt = self
                .breaker
                .run(cancel, async {
                    match self.check_service_ready(namespace, target_service).await {
                        Ok(true) => match resolve(try_count).await {
                            Ok(()) => Attempt::Resolved,
                            Err(e) => Attempt::ResolveFailed(e),
                        },
                        Ok(false) => Attempt::NotReady,
                        Err(e) => Attempt::ProbeFailed(e),
                    }
                })
                .await?;

            match attempt {
                Attempt::Resolved => return Ok(()),
                // The target is up but the forward failed: the request is not
                // re-enqueued, the caller decides what to do with it.
                Attempt::ResolveFailed(e) => return Err(e),
                Attempt::NotReady => {
                    debug!(namespace, service = target_service, "target not ready yet");
                    on_error();
                }
                Attempt::ProbeFailed(e) => {
                    warn!(namespace, service = target_service, error = %e, "readiness probe failed");
                    on_error();
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::ContextDone),
                _ = tokio::time::sleep(self.retry_duration) => {}
            }
            try_count += 1;
        }
    }

    /// Readiness probe memoizing positive answers for
    /// `traffic_reenable_duration`
    async fn check_service_ready(&self, namespace: &str, service: &str) -> Result<bool> {
        let key = format!("{namespace}/{service}");
        let now = Instant::now();

        if let Some(until) = self.ready_until.get(&key) {
            if now < *until {
                return Ok(true);
            }
        }
        // Expired or absent: drop before probing so the map stays bounded.
        self.ready_until.remove(&key);

        if self.probe.is_service_ready(namespace, service).await? {
            self.ready_until
                .insert(key, now + self.traffic_reenable_duration);
            return Ok(true);
        }
        Ok(false)
    }

    /// Snapshot of held-request counts per `(namespace, service)`
    pub fn queue_snapshot(&self) -> BTreeMap<String, i64> {
        self.queue_sizes
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

enum Attempt {
    Resolved,
    ResolveFailed(Error),
    NotReady,
    ProbeFailed(Error),
}

struct QueueGuard<'a> {
    sizes: &'a DashMap<String, i64>,
    key: String,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut size) = self.sizes.get_mut(&self.key) {
            *size -= 1;
        }
    }
}

//! Control RPC server
//!
//! The resolver tells the operator "a request arrived for service X" through
//! `POST /informer/incoming-request`. The handler scales the service's target
//! from zero at most once per hold-off window, coalescing notification bursts
//! so a stampede of queued requests cannot trigger repeated scale writes.
//!
//! Responses are always `200 OK`: the resolver retries through its readiness
//! probe, so internal failures are logged and counted rather than propagated.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::ScaleTargetRef;
use crate::directory::ServiceDirectory;
use crate::metrics::{encode_metrics, TARGET_SCALE_COUNTER, OUTCOME_SUCCESS};
use crate::scaling::ScaleHandler;
use crate::Result;

/// Notification body sent by the resolver
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IncomingRequest {
    /// Namespace of the governed service
    pub namespace: String,
    /// Virtual service name the request arrived for
    pub service: String,
    /// Number of buffered requests represented by this notification
    #[serde(default)]
    pub request_count: i64,
}

/// Response body of the control endpoint
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ControlResponse {
    /// Human-readable acknowledgement
    pub message: String,
}

/// Scale entry point the control endpoint drives
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestScaler: Send + Sync {
    /// Scale the target to `replicas` only if it currently sits at zero
    async fn scale_when_at_zero(
        &self,
        namespace: &str,
        governed_name: &str,
        target: &ScaleTargetRef,
        replicas: i32,
    ) -> Result<bool>;
}

#[async_trait]
impl RequestScaler for ScaleHandler {
    async fn scale_when_at_zero(
        &self,
        namespace: &str,
        governed_name: &str,
        target: &ScaleTargetRef,
        replicas: i32,
    ) -> Result<bool> {
        ScaleHandler::scale_when_at_zero(self, namespace, governed_name, target, replicas).await
    }
}

#[derive(Clone, Copy, Debug)]
struct Hold {
    until: Instant,
}

/// Per-service hold-off gate.
///
/// An acquired entry stays held until its expiry instant; expired entries are
/// reused in place rather than deleted on a timer, so nothing leaks when
/// releases race with new requests and the map never outgrows one entry per
/// service.
#[derive(Debug, Default)]
pub struct ScaleGate {
    holds: DashMap<String, Hold>,
}

impl ScaleGate {
    /// Create an empty gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the gate for `key` for the given hold duration. Returns
    /// `false` while a previous acquisition is still holding.
    pub fn try_acquire(&self, key: &str, hold: Duration) -> bool {
        let now = Instant::now();
        match self.holds.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().until > now {
                    return false;
                }
                occupied.insert(Hold { until: now + hold });
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Hold { until: now + hold });
                true
            }
        }
    }

    /// Release the gate for `key` early, so the next notification may retry
    pub fn release(&self, key: &str) {
        self.holds.remove(key);
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.holds.len()
    }

    /// Whether no keys are tracked
    pub fn is_empty(&self) -> bool {
        self.holds.is_empty()
    }
}

/// Shared state of the control server
pub struct ControlState {
    /// Directory resolving services to their governing resources
    pub directory: Arc<ServiceDirectory>,
    /// Scale entry point
    pub scaler: Arc<dyn RequestScaler>,
    /// Per-service hold-off gate
    pub gate: ScaleGate,
    /// How long a successful request-driven scale holds the gate
    pub rescale_holdoff: Duration,
}

/// Build the control router with the RPC and metrics endpoints
pub fn control_router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/informer/incoming-request", post(incoming_request_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn metrics_handler() -> impl IntoResponse {
    encode_metrics()
}

async fn incoming_request_handler(
    State(state): State<Arc<ControlState>>,
    body: Bytes,
) -> axum::response::Response {
    let request: IncomingRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed resolver notification");
            return (StatusCode::BAD_REQUEST, "Invalid request body").into_response();
        }
    };

    info!(
        namespace = %request.namespace,
        service = %request.service,
        count = request.request_count,
        "received request notification from resolver"
    );

    if let Err(e) = scale_for_notification(&state, &request).await {
        // The resolver keeps retrying through its readiness probe, so this
        // failure is not its problem.
        error!(
            namespace = %request.namespace,
            service = %request.service,
            error = %e,
            "failed to scale target for notification"
        );
    }

    (
        StatusCode::OK,
        Json(ControlResponse {
            message: "Request received successfully!".to_string(),
        }),
    )
        .into_response()
}

async fn scale_for_notification(
    state: &ControlState,
    request: &IncomingRequest,
) -> Result<()> {
    let gate_key = format!("{}/{}", request.namespace, request.service);
    if !state.gate.try_acquire(&gate_key, state.rescale_holdoff) {
        info!(service = %request.service, "scale already in progress, coalescing");
        return Ok(());
    }

    let Some(entry) = state.directory.get(&request.namespace, &request.service) else {
        state.gate.release(&gate_key);
        let err = crate::Error::ServiceNotFound(gate_key.clone());
        TARGET_SCALE_COUNTER
            .with_label_values(&[
                &request.service,
                "unknown",
                &err.to_string(),
            ])
            .inc();
        return Err(err);
    };

    let target = &entry.spec.scale_target_ref;
    let target_label = format!("{}-{}", target.canonical_kind(), target.name);

    match state
        .scaler
        .scale_when_at_zero(
            &request.namespace,
            &entry.name,
            target,
            entry.spec.min_target_replicas,
        )
        .await
    {
        Ok(_scaled) => {
            TARGET_SCALE_COUNTER
                .with_label_values(&[&request.service, &target_label, OUTCOME_SUCCESS])
                .inc();
            Ok(())
        }
        Err(e) => {
            // Give the next notification a chance instead of waiting out the
            // full hold-off.
            state.gate.release(&gate_key);
            TARGET_SCALE_COUNTER
                .with_label_values(&[&request.service, &target_label, &e.to_string()])
                .inc();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GovernedServiceSpec, ScaleTrigger};
    use crate::directory::DirectoryEntry;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn directory_with_service() -> Arc<ServiceDirectory> {
        let directory = Arc::new(ServiceDirectory::new());
        directory.upsert(DirectoryEntry {
            name: "s1-gs".to_string(),
            namespace: "n1".to_string(),
            spec: GovernedServiceSpec {
                scale_target_ref: ScaleTargetRef {
                    api_version: "apps/v1".to_string(),
                    kind: "Deployment".to_string(),
                    name: "s1-deploy".to_string(),
                },
                service: "s1".to_string(),
                min_target_replicas: 3,
                cooldown_period: 0,
                triggers: vec![ScaleTrigger {
                    type_: "prometheus".to_string(),
                    metadata: serde_json::Value::Null,
                }],
                autoscaler: None,
                enabled_period: None,
            },
            mode: crate::crd::Mode::Proxy,
        });
        directory
    }

    fn state_with(scaler: MockRequestScaler) -> Arc<ControlState> {
        Arc::new(ControlState {
            directory: directory_with_service(),
            scaler: Arc::new(scaler),
            gate: ScaleGate::new(),
            rescale_holdoff: Duration::from_secs(600),
        })
    }

    fn notification(namespace: &str, service: &str) -> Request<Body> {
        let body = serde_json::json!({
            "namespace": namespace,
            "service": service,
            "requestCount": 1,
        });
        Request::builder()
            .method("POST")
            .uri("/informer/incoming-request")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    mod gate {
        use super::*;

        #[test]
        fn second_acquire_within_hold_is_refused() {
            let gate = ScaleGate::new();
            assert!(gate.try_acquire("n1/s1", Duration::from_secs(600)));
            assert!(!gate.try_acquire("n1/s1", Duration::from_secs(600)));
        }

        #[test]
        fn expired_hold_is_reacquired_in_place() {
            let gate = ScaleGate::new();
            assert!(gate.try_acquire("n1/s1", Duration::ZERO));
            assert!(gate.try_acquire("n1/s1", Duration::ZERO));
            assert_eq!(gate.len(), 1);
        }

        #[test]
        fn repeated_acquisitions_do_not_grow_the_map() {
            let gate = ScaleGate::new();
            for _ in 0..1_000 {
                gate.try_acquire("n1/s1", Duration::from_secs(600));
            }
            assert_eq!(gate.len(), 1);
        }

        #[test]
        fn release_reopens_the_gate() {
            let gate = ScaleGate::new();
            assert!(gate.try_acquire("n1/s1", Duration::from_secs(600)));
            gate.release("n1/s1");
            assert!(gate.try_acquire("n1/s1", Duration::from_secs(600)));
        }

        #[test]
        fn keys_are_independent() {
            let gate = ScaleGate::new();
            assert!(gate.try_acquire("n1/s1", Duration::from_secs(600)));
            assert!(gate.try_acquire("n1/s2", Duration::from_secs(600)));
        }
    }

    mod endpoint {
        use super::*;

        #[tokio::test]
        async fn cold_scale_up_issues_exactly_one_scale_per_holdoff() {
            let mut scaler = MockRequestScaler::new();
            scaler
                .expect_scale_when_at_zero()
                .withf(|ns, name, target, replicas| {
                    ns == "n1" && name == "s1-gs" && target.name == "s1-deploy" && *replicas == 3
                })
                .times(1)
                .returning(|_, _, _, _| Ok(true));
            let state = state_with(scaler);

            // First notification scales; the second coalesces.
            for _ in 0..2 {
                let response = control_router(state.clone())
                    .oneshot(notification("n1", "s1"))
                    .await
                    .unwrap();
                assert_eq!(response.status(), StatusCode::OK);
            }
        }

        #[tokio::test]
        async fn response_carries_an_acknowledgement_message() {
            let mut scaler = MockRequestScaler::new();
            scaler
                .expect_scale_when_at_zero()
                .returning(|_, _, _, _| Ok(true));
            let state = state_with(scaler);

            let response = control_router(state)
                .oneshot(notification("n1", "s1"))
                .await
                .unwrap();
            let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
            let parsed: ControlResponse = serde_json::from_slice(&body).unwrap();
            assert_eq!(parsed.message, "Request received successfully!");
        }

        #[tokio::test]
        async fn malformed_json_is_a_bad_request() {
            let state = state_with(MockRequestScaler::new());
            let request = Request::builder()
                .method("POST")
                .uri("/informer/incoming-request")
                .body(Body::from("{not json"))
                .unwrap();

            let response = control_router(state).oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn wrong_method_is_rejected() {
            let state = state_with(MockRequestScaler::new());
            let request = Request::builder()
                .method("GET")
                .uri("/informer/incoming-request")
                .body(Body::empty())
                .unwrap();

            let response = control_router(state).oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        }

        #[tokio::test]
        async fn unknown_service_still_returns_ok_and_skips_scaling() {
            let mut scaler = MockRequestScaler::new();
            scaler.expect_scale_when_at_zero().never();
            let state = state_with(scaler);

            let response = control_router(state.clone())
                .oneshot(notification("n1", "missing"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            // The failed lookup must not burn the hold-off for the service.
            assert!(state.gate.try_acquire("n1/missing", Duration::from_secs(1)));
        }

        #[tokio::test]
        async fn scale_failure_reopens_the_gate() {
            let mut scaler = MockRequestScaler::new();
            let mut first = true;
            scaler
                .expect_scale_when_at_zero()
                .times(2)
                .returning(move |_, _, _, _| {
                    if first {
                        first = false;
                        Err(crate::Error::Discovery("apps/v1/Deployment".to_string()))
                    } else {
                        Ok(true)
                    }
                });
            let state = state_with(scaler);

            for _ in 0..2 {
                let response = control_router(state.clone())
                    .oneshot(notification("n1", "s1"))
                    .await
                    .unwrap();
                assert_eq!(response.status(), StatusCode::OK);
            }
        }

        #[tokio::test]
        async fn metrics_endpoint_serves_the_registry() {
            let state = state_with(MockRequestScaler::new());
            let request = Request::builder()
                .method("GET")
                .uri("/metrics")
                .body(Body::empty())
                .unwrap();

            let response = control_router(state).oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }
}

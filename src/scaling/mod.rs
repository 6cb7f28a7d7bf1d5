//! Scale executor and scale-decision loop
//!
//! The [`ScaleHandler`] owns every replica-count mutation in the process. All
//! writes go through the target's `/scale` subresource so any scalable kind
//! is supported uniformly, and every read-modify-write runs under a
//! per-target mutex so concurrent decision paths (ticker, control RPC,
//! reconciler) cannot race each other.

pub mod scalers;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use k8s_openapi::api::autoscaling::v1::Scale;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{AutoscalerType, GovernedService, ScaleTargetRef};
use crate::scaling::scalers::ScalerFactory;
use crate::{Error, Result};

const KEDA_PAUSED_ANNOTATION: &str = "autoscaling.keda.sh/paused";
const KEDA_PAUSED_REPLICAS_ANNOTATION: &str = "autoscaling.keda.sh/paused-replicas";

/// Verdict of one trigger evaluation cycle for one governed service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleDirection {
    /// Bring the target up to `minTargetReplicas`
    ScaleUp,
    /// Take the target down to zero
    ScaleDown,
    /// Leave the target alone this cycle
    NoScale,
}

/// Severity of a published scale event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Routine, successful operation
    Normal,
    /// Something failed and needs operator attention
    Warning,
}

/// Read/write access to a target's `/scale` subresource.
///
/// Abstracted so the executor's no-op and serialization rules can be tested
/// without an API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScaleClient: Send + Sync {
    /// Current `spec.replicas` of the target's scale subresource, or `None`
    /// when the subresource carries no replica count
    async fn current_replicas(
        &self,
        namespace: &str,
        target: &ScaleTargetRef,
    ) -> Result<Option<i32>>;

    /// Set `spec.replicas` on the target's scale subresource
    async fn set_replicas(
        &self,
        namespace: &str,
        target: &ScaleTargetRef,
        replicas: i32,
    ) -> Result<()>;
}

/// Pause/unpause coordination with an attached KEDA ScaledObject
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AutoscalerClient: Send + Sync {
    /// Set or clear the KEDA paused annotations on a ScaledObject
    async fn set_keda_paused(
        &self,
        namespace: &str,
        scaled_object: &str,
        paused: bool,
    ) -> Result<()>;
}

/// Writes to the GovernedService status subresource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusClient: Send + Sync {
    /// Merge-patch `status.lastScaledUpTime` to the given instant
    async fn patch_last_scaled_up_time(
        &self,
        namespace: &str,
        name: &str,
        when: DateTime<Utc>,
    ) -> Result<()>;
}

/// Publishes Kubernetes events on GovernedService objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish one event; failures are logged by the implementation
    async fn publish(
        &self,
        namespace: &str,
        name: &str,
        kind: EventKind,
        reason: &str,
        message: &str,
    );
}

// =============================================================================
// Real client implementations
// =============================================================================

/// Discovery-backed mapping from a scale target's GVK to an [`ApiResource`].
///
/// Mappings are cached; a lookup miss invalidates the cached entry and
/// retries discovery once before giving up.
pub struct RestMapper {
    client: Client,
    cache: DashMap<String, ApiResource>,
}

impl RestMapper {
    /// Create a mapper backed by the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: DashMap::new(),
        }
    }

    /// Resolve the API resource for a scale target, normalizing legacy kinds
    pub async fn resolve(&self, target: &ScaleTargetRef) -> Result<ApiResource> {
        let (group, version) = target.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &target.canonical_kind());
        let key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);

        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        match kube::discovery::oneshot::pinned_kind(&self.client, &gvk).await {
            Ok((ar, _caps)) => {
                self.cache.insert(key, ar.clone());
                Ok(ar)
            }
            Err(first_err) => {
                // The discovery answer may be stale; drop it and ask again.
                debug!(error = %first_err, gvk = %key, "discovery miss, retrying once");
                self.cache.remove(&key);
                match kube::discovery::oneshot::pinned_kind(&self.client, &gvk).await {
                    Ok((ar, _caps)) => {
                        self.cache.insert(key, ar.clone());
                        Ok(ar)
                    }
                    Err(_) => Err(Error::Discovery(key)),
                }
            }
        }
    }
}

/// [`ScaleClient`] speaking to the cluster through the dynamic API
pub struct DynamicScaleClient {
    client: Client,
    mapper: RestMapper,
}

impl DynamicScaleClient {
    /// Create a new dynamic scale client
    pub fn new(client: Client) -> Self {
        Self {
            mapper: RestMapper::new(client.clone()),
            client,
        }
    }

    fn api(&self, namespace: &str, ar: &ApiResource) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, ar)
    }
}

#[async_trait]
impl ScaleClient for DynamicScaleClient {
    async fn current_replicas(
        &self,
        namespace: &str,
        target: &ScaleTargetRef,
    ) -> Result<Option<i32>> {
        let ar = self.mapper.resolve(target).await?;
        let scale: Scale = self.api(namespace, &ar).get_scale(&target.name).await?;
        Ok(scale.spec.and_then(|s| s.replicas))
    }

    async fn set_replicas(
        &self,
        namespace: &str,
        target: &ScaleTargetRef,
        replicas: i32,
    ) -> Result<()> {
        let ar = self.mapper.resolve(target).await?;
        let patch = serde_json::json!({"spec": {"replicas": replicas}});
        self.api(namespace, &ar)
            .patch_scale(&target.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// [`AutoscalerClient`] that patches KEDA ScaledObject annotations
pub struct KedaClient {
    client: Client,
}

impl KedaClient {
    /// Create a new KEDA coordination client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn scaled_object_resource() -> ApiResource {
        ApiResource {
            group: "keda.sh".to_string(),
            version: "v1alpha1".to_string(),
            api_version: "keda.sh/v1alpha1".to_string(),
            kind: "ScaledObject".to_string(),
            plural: "scaledobjects".to_string(),
        }
    }
}

#[async_trait]
impl AutoscalerClient for KedaClient {
    async fn set_keda_paused(
        &self,
        namespace: &str,
        scaled_object: &str,
        paused: bool,
    ) -> Result<()> {
        // Pausing pins the ScaledObject at zero replicas; unpausing clears
        // the pinned count so KEDA resumes control.
        let patch = if paused {
            serde_json::json!({"metadata": {"annotations": {
                KEDA_PAUSED_ANNOTATION: "true",
                KEDA_PAUSED_REPLICAS_ANNOTATION: "0",
            }}})
        } else {
            serde_json::json!({"metadata": {"annotations": {
                KEDA_PAUSED_ANNOTATION: "false",
                KEDA_PAUSED_REPLICAS_ANNOTATION: null,
            }}})
        };

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &Self::scaled_object_resource());
        api.patch(scaled_object, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// [`StatusClient`] writing through the GovernedService status subresource
pub struct GovernedServiceStatusClient {
    client: Client,
}

impl GovernedServiceStatusClient {
    /// Create a new status client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusClient for GovernedServiceStatusClient {
    async fn patch_last_scaled_up_time(
        &self,
        namespace: &str,
        name: &str,
        when: DateTime<Utc>,
    ) -> Result<()> {
        let api: Api<GovernedService> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({"status": {
            "lastScaledUpTime": when.to_rfc3339_opts(SecondsFormat::Nanos, true),
        }});
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// [`EventSink`] backed by the cluster event recorder
pub struct RecorderEventSink {
    client: Client,
    reporter: Reporter,
}

impl RecorderEventSink {
    /// Create an event sink publishing as the given reporter
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self { client, reporter }
    }
}

#[async_trait]
impl EventSink for RecorderEventSink {
    async fn publish(
        &self,
        namespace: &str,
        name: &str,
        kind: EventKind,
        reason: &str,
        message: &str,
    ) {
        let reference = k8s_openapi::api::core::v1::ObjectReference {
            api_version: Some("drowse.dev/v1alpha1".to_string()),
            kind: Some("GovernedService".to_string()),
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        };
        let event = Event {
            type_: match kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Scale".to_string(),
            secondary: None,
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        if let Err(e) = recorder.publish(event).await {
            warn!(error = %e, reason, "failed to publish event");
        }
    }
}

// =============================================================================
// Scale handler
// =============================================================================

/// Owns all replica mutations and the periodic scale-decision sweep
pub struct ScaleHandler {
    scale_client: Arc<dyn ScaleClient>,
    autoscaler: Arc<dyn AutoscalerClient>,
    status: Arc<dyn StatusClient>,
    events: Arc<dyn EventSink>,
    factory: Arc<dyn ScalerFactory>,
    scale_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ScaleHandler {
    /// Create a handler with explicit client implementations.
    ///
    /// Production wiring uses [`ScaleHandler::with_client`]; this constructor
    /// exists so every seam can be replaced in tests.
    pub fn new(
        scale_client: Arc<dyn ScaleClient>,
        autoscaler: Arc<dyn AutoscalerClient>,
        status: Arc<dyn StatusClient>,
        events: Arc<dyn EventSink>,
        factory: Arc<dyn ScalerFactory>,
    ) -> Self {
        Self {
            scale_client,
            autoscaler,
            status,
            events,
            factory,
            scale_locks: DashMap::new(),
        }
    }

    /// Create a handler wired to the cluster
    pub fn with_client(client: Client, reporter: Reporter) -> Self {
        Self::new(
            Arc::new(DynamicScaleClient::new(client.clone())),
            Arc::new(KedaClient::new(client.clone())),
            Arc::new(GovernedServiceStatusClient::new(client.clone())),
            Arc::new(RecorderEventSink::new(client, reporter)),
            Arc::new(scalers::DefaultScalerFactory),
        )
    }

    fn lock_for(&self, namespace: &str, target: &ScaleTargetRef) -> Arc<tokio::sync::Mutex<()>> {
        let key = format!("{namespace}/{}/{}", target.canonical_kind(), target.name);
        self.scale_locks
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Apply a desired replica count to a target.
    ///
    /// Holds the per-target mutex across the whole get-compare-set sequence.
    /// Returns `false` without writing when the target is already at the
    /// desired count, or already above it on a scale-up path.
    pub async fn scale_target(
        &self,
        namespace: &str,
        target: &ScaleTargetRef,
        desired: i32,
    ) -> Result<bool> {
        let lock = self.lock_for(namespace, target);
        let _guard = lock.lock().await;
        self.scale_locked(namespace, target, desired).await
    }

    async fn scale_locked(
        &self,
        namespace: &str,
        target: &ScaleTargetRef,
        desired: i32,
    ) -> Result<bool> {
        let Some(current) = self.scale_client.current_replicas(namespace, target).await? else {
            warn!(
                target = %target.name,
                "scale subresource has no replica count, leaving target alone"
            );
            return Ok(false);
        };

        if current == desired {
            debug!(target = %target.name, replicas = desired, "target already scaled");
            return Ok(false);
        }
        // Never scale a target *down* on a scale-up path.
        if desired > 0 && current > desired {
            debug!(
                target = %target.name,
                current, desired, "target already beyond desired replicas"
            );
            return Ok(false);
        }

        self.scale_client
            .set_replicas(namespace, target, desired)
            .await?;
        info!(target = %target.name, replicas = desired, "target scaled");
        Ok(true)
    }

    /// Scale a target up from zero to the given replica count, publishing
    /// scale events on the owning GovernedService
    pub async fn scale_target_from_zero(
        &self,
        namespace: &str,
        governed_name: &str,
        target: &ScaleTargetRef,
        replicas: i32,
    ) -> Result<()> {
        info!(kind = %target.canonical_kind(), target = %target.name, replicas, "scaling up from zero");

        match self.scale_target(namespace, target, replicas).await {
            Err(e) => {
                self.events
                    .publish(
                        namespace,
                        governed_name,
                        EventKind::Warning,
                        "ScaleFromZeroFailed",
                        &format!(
                            "Failed to scale {} from zero to {replicas} replicas: {e}",
                            target.canonical_kind()
                        ),
                    )
                    .await;
                Err(e)
            }
            Ok(false) => Ok(()),
            Ok(true) => {
                self.events
                    .publish(
                        namespace,
                        governed_name,
                        EventKind::Normal,
                        "ScaledUpFromZero",
                        &format!(
                            "Successfully scaled {} from zero to {replicas} replicas",
                            target.canonical_kind()
                        ),
                    )
                    .await;
                Ok(())
            }
        }
    }

    /// Scale a target down to zero, publishing scale events on the owning
    /// GovernedService
    pub async fn scale_target_to_zero(
        &self,
        namespace: &str,
        governed_name: &str,
        target: &ScaleTargetRef,
    ) -> Result<()> {
        info!(kind = %target.canonical_kind(), target = %target.name, "scaling down to zero");

        match self.scale_target(namespace, target, 0).await {
            Err(e) => {
                self.events
                    .publish(
                        namespace,
                        governed_name,
                        EventKind::Warning,
                        "ScaleToZeroFailed",
                        &format!("Failed to scale {} to zero: {e}", target.canonical_kind()),
                    )
                    .await;
                Err(e)
            }
            Ok(false) => Ok(()),
            Ok(true) => {
                self.events
                    .publish(
                        namespace,
                        governed_name,
                        EventKind::Normal,
                        "ScaledDownToZero",
                        &format!("Successfully scaled {} to zero", target.canonical_kind()),
                    )
                    .await;
                Ok(())
            }
        }
    }

    /// Scale a target up only if it currently sits at zero replicas.
    ///
    /// This is the request-driven path: the resolver saw traffic for a
    /// proxied service. Returns `true` when a scale write was issued.
    pub async fn scale_when_at_zero(
        &self,
        namespace: &str,
        governed_name: &str,
        target: &ScaleTargetRef,
        replicas: i32,
    ) -> Result<bool> {
        let lock = self.lock_for(namespace, target);
        let _guard = lock.lock().await;

        let current = self.scale_client.current_replicas(namespace, target).await?;
        if current != Some(0) {
            debug!(
                target = %target.name,
                ?current,
                "target not at zero, skipping request-driven scale"
            );
            return Ok(false);
        }

        self.scale_client
            .set_replicas(namespace, target, replicas)
            .await?;
        self.events
            .publish(
                namespace,
                governed_name,
                EventKind::Normal,
                "ScaledUpFromZero",
                &format!(
                    "Successfully scaled {} from zero to {replicas} replicas",
                    target.canonical_kind()
                ),
            )
            .await;
        Ok(true)
    }

    /// Evaluate all triggers of a governed service and produce a verdict
    pub async fn calculate_scale_direction(
        &self,
        es: &GovernedService,
        now: DateTime<Utc>,
    ) -> Result<ScaleDirection> {
        let spec = &es.spec;
        let namespace = es.metadata.namespace.as_deref().unwrap_or_default();

        if spec.triggers.is_empty() {
            return Err(Error::invalid_resource(format!(
                "no triggers found for service {}",
                spec.service
            )));
        }

        // Grace window: a freshly created resource is never scaled until a
        // full cooldown has passed, so operators can observe it first.
        let cooldown = spec.cooldown();
        if let Some(created) = es.metadata.creation_timestamp.as_ref() {
            let cooldown_chrono = chrono::Duration::from_std(cooldown)
                .map_err(|e| Error::invalid_resource(e.to_string()))?;
            if created.0 + cooldown_chrono > now {
                debug!(service = %spec.service, "inside creation grace window");
                return Ok(ScaleDirection::NoScale);
            }
        }

        if let Some(period) = &spec.enabled_period {
            let duration = crate::schedule::validate_duration(&period.duration)?;
            if !crate::schedule::is_in_enabled_period_at(&period.schedule, duration, now)? {
                debug!(service = %spec.service, "outside enabled period");
                return Ok(ScaleDirection::NoScale);
            }
        }

        for trigger in &spec.triggers {
            let scaler = self.factory.create(trigger, cooldown)?;

            let healthy = match scaler.is_healthy().await {
                Ok(h) => h,
                Err(e) => {
                    warn!(
                        namespace,
                        service = %spec.service,
                        scaler = %trigger.type_,
                        error = %e,
                        "failed to check scaler health"
                    );
                    scaler.close().await;
                    return Ok(ScaleDirection::NoScale);
                }
            };
            if !healthy {
                warn!(
                    namespace,
                    service = %spec.service,
                    scaler = %trigger.type_,
                    "scaler is not healthy, skipping scaling decision this cycle"
                );
                scaler.close().await;
                return Ok(ScaleDirection::NoScale);
            }

            let idle = scaler.should_scale_to_zero().await;
            scaler.close().await;

            if !idle? {
                return Ok(ScaleDirection::ScaleUp);
            }
        }

        Ok(ScaleDirection::ScaleDown)
    }

    /// Enact a scale-down verdict, honoring the cooldown gate
    pub async fn handle_scale_to_zero(
        &self,
        es: &GovernedService,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let spec = &es.spec;
        let namespace = es.metadata.namespace.as_deref().unwrap_or_default();
        let name = es.metadata.name.as_deref().unwrap_or_default();

        if let Some(last_up) = es.status.as_ref().and_then(|s| s.last_scaled_up_time) {
            let since = now - last_up;
            let cooldown = chrono::Duration::from_std(spec.cooldown())
                .map_err(|e| Error::invalid_resource(e.to_string()))?;
            if since < cooldown {
                debug!(
                    service = %spec.service,
                    ?since,
                    "skipping scale down, cooldown not met"
                );
                return Ok(());
            }
        }

        if let Some(autoscaler) = &spec.autoscaler {
            if autoscaler.type_ == AutoscalerType::Keda {
                self.autoscaler
                    .set_keda_paused(namespace, &autoscaler.name, true)
                    .await?;
            }
        }

        self.scale_target_to_zero(namespace, name, &spec.scale_target_ref)
            .await
    }

    /// Enact a scale-up verdict.
    ///
    /// The cooldown anchor is advanced *before* the scale call, and even if
    /// the scale ultimately fails, so successive ticks do not hammer the
    /// target. Status must therefore not be read as proof of a replica
    /// change.
    pub async fn handle_scale_from_zero(
        &self,
        es: &GovernedService,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let spec = &es.spec;
        let namespace = es.metadata.namespace.as_deref().unwrap_or_default();
        let name = es.metadata.name.as_deref().unwrap_or_default();

        if let Err(e) = self
            .status
            .patch_last_scaled_up_time(namespace, name, now)
            .await
        {
            error!(service = %spec.service, error = %e, "failed to update lastScaledUpTime");
        }

        if let Some(autoscaler) = &spec.autoscaler {
            if autoscaler.type_ == AutoscalerType::Keda {
                self.autoscaler
                    .set_keda_paused(namespace, &autoscaler.name, false)
                    .await?;
            }
        }

        self.scale_target_from_zero(
            namespace,
            name,
            &spec.scale_target_ref,
            spec.min_target_replicas,
        )
        .await
    }

    /// One sweep over all governed services: evaluate and enact
    pub async fn check_and_scale(&self, services: &[GovernedService], now: DateTime<Utc>) {
        for es in services {
            let namespace = es.metadata.namespace.as_deref().unwrap_or_default();
            let direction = match self.calculate_scale_direction(es, now).await {
                Ok(d) => d,
                Err(e) => {
                    error!(
                        namespace,
                        service = %es.spec.service,
                        error = %e,
                        "failed to calculate scale direction"
                    );
                    continue;
                }
            };

            let outcome = match direction {
                ScaleDirection::NoScale => continue,
                ScaleDirection::ScaleDown => self.handle_scale_to_zero(es, now).await,
                ScaleDirection::ScaleUp => self.handle_scale_from_zero(es, now).await,
            };

            if let Err(e) = outcome {
                error!(
                    namespace,
                    service = %es.spec.service,
                    ?direction,
                    error = %e,
                    "failed to enact scale decision"
                );
            }
        }
    }
}

/// Run the scale-decision ticker until cancelled.
///
/// Each tick lists the governed services in the watched namespace and hands
/// the batch to [`ScaleHandler::check_and_scale`].
pub async fn run_scale_loop(
    handler: Arc<ScaleHandler>,
    api: Api<GovernedService>,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it so a fresh operator does not
    // act before its informers have warmed up.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("scale-decision loop stopping");
                return;
            }
            _ = ticker.tick() => {
                match api.list(&Default::default()).await {
                    Ok(list) => handler.check_and_scale(&list.items, Utc::now()).await,
                    Err(e) => error!(error = %e, "failed to list governed services"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        AutoscalerSpec, EnabledPeriod, GovernedServiceSpec, GovernedServiceStatus, ScaleTrigger,
    };
    use crate::scaling::scalers::{MockScaler, MockScalerFactory, ScalerError};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn target() -> ScaleTargetRef {
        ScaleTargetRef {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: "checkout".to_string(),
        }
    }

    fn sample_service(name: &str) -> GovernedService {
        let spec = GovernedServiceSpec {
            scale_target_ref: target(),
            service: format!("{name}-svc"),
            min_target_replicas: 3,
            cooldown_period: 60,
            triggers: vec![ScaleTrigger {
                type_: "prometheus".to_string(),
                metadata: serde_json::Value::Null,
            }],
            autoscaler: None,
            enabled_period: None,
        };
        let mut es = GovernedService::new(name, spec);
        es.metadata.namespace = Some("n1".to_string());
        // Created long ago so the grace window does not interfere.
        es.metadata.creation_timestamp =
            Some(Time(Utc::now() - chrono::Duration::try_hours(2).unwrap()));
        es
    }

    /// A scaler whose three answers are fixed up front
    fn scripted_scaler(
        healthy: std::result::Result<bool, ScalerError>,
        idle: std::result::Result<bool, ScalerError>,
    ) -> MockScaler {
        let mut scaler = MockScaler::new();
        let mut healthy = Some(healthy);
        scaler
            .expect_is_healthy()
            .returning(move || healthy.take().expect("is_healthy called once"));
        let mut idle = Some(idle);
        scaler
            .expect_should_scale_to_zero()
            .returning(move || idle.take().expect("should_scale_to_zero called once"));
        scaler.expect_close().returning(|| ());
        scaler
    }

    struct HandlerParts {
        scale: MockScaleClient,
        autoscaler: MockAutoscalerClient,
        status: MockStatusClient,
        events: MockEventSink,
        factory: MockScalerFactory,
    }

    impl HandlerParts {
        fn new() -> Self {
            Self {
                scale: MockScaleClient::new(),
                autoscaler: MockAutoscalerClient::new(),
                status: MockStatusClient::new(),
                events: MockEventSink::new(),
                factory: MockScalerFactory::new(),
            }
        }

        fn build(self) -> ScaleHandler {
            ScaleHandler::new(
                Arc::new(self.scale),
                Arc::new(self.autoscaler),
                Arc::new(self.status),
                Arc::new(self.events),
                Arc::new(self.factory),
            )
        }
    }

    mod executor {
        use super::*;

        #[tokio::test]
        async fn already_at_desired_replicas_is_a_no_op() {
            let mut parts = HandlerParts::new();
            parts
                .scale
                .expect_current_replicas()
                .returning(|_, _| Ok(Some(3)));
            parts.scale.expect_set_replicas().never();

            let handler = parts.build();
            let scaled = handler.scale_target("n1", &target(), 3).await.unwrap();
            assert!(!scaled);
        }

        #[tokio::test]
        async fn scale_up_never_reduces_replicas() {
            let mut parts = HandlerParts::new();
            parts
                .scale
                .expect_current_replicas()
                .returning(|_, _| Ok(Some(5)));
            parts.scale.expect_set_replicas().never();

            let handler = parts.build();
            let scaled = handler.scale_target("n1", &target(), 3).await.unwrap();
            assert!(!scaled);
        }

        #[tokio::test]
        async fn missing_replica_count_is_a_no_op() {
            let mut parts = HandlerParts::new();
            parts
                .scale
                .expect_current_replicas()
                .returning(|_, _| Ok(None));
            parts.scale.expect_set_replicas().never();

            let handler = parts.build();
            let scaled = handler.scale_target("n1", &target(), 3).await.unwrap();
            assert!(!scaled);
        }

        #[tokio::test]
        async fn divergent_replicas_are_written_once() {
            let mut parts = HandlerParts::new();
            parts
                .scale
                .expect_current_replicas()
                .returning(|_, _| Ok(Some(0)));
            parts
                .scale
                .expect_set_replicas()
                .withf(|_, _, replicas| *replicas == 3)
                .times(1)
                .returning(|_, _, _| Ok(()));

            let handler = parts.build();
            let scaled = handler.scale_target("n1", &target(), 3).await.unwrap();
            assert!(scaled);
        }

        #[tokio::test]
        async fn concurrent_requests_for_one_target_issue_one_update() {
            // Shared fake replica count: the first caller observes 0 and
            // writes 3; the second observes 3 and does nothing.
            let replicas = Arc::new(AtomicI32::new(0));
            let writes = Arc::new(AtomicUsize::new(0));

            let mut parts = HandlerParts::new();
            let read_state = replicas.clone();
            parts
                .scale
                .expect_current_replicas()
                .returning(move |_, _| Ok(Some(read_state.load(Ordering::SeqCst))));
            let write_state = replicas.clone();
            let write_count = writes.clone();
            parts.scale.expect_set_replicas().returning(move |_, _, r| {
                write_state.store(r, Ordering::SeqCst);
                write_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

            let handler = Arc::new(parts.build());
            let a = tokio::spawn({
                let handler = handler.clone();
                async move { handler.scale_target("n1", &target(), 3).await }
            });
            let b = tokio::spawn({
                let handler = handler.clone();
                async move { handler.scale_target("n1", &target(), 3).await }
            });

            let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
            assert_eq!(writes.load(Ordering::SeqCst), 1);
            assert!(a ^ b, "exactly one caller should report having scaled");
        }
    }

    mod verdicts {
        use super::*;

        fn factory_yielding(
            healthy: std::result::Result<bool, ScalerError>,
            idle: std::result::Result<bool, ScalerError>,
        ) -> MockScalerFactory {
            let mut factory = MockScalerFactory::new();
            let mut slot = Some((healthy, idle));
            factory.expect_create().returning(move |_, _| {
                let (healthy, idle) = slot.take().expect("factory called once");
                Ok(Box::new(scripted_scaler(healthy, idle)))
            });
            factory
        }

        #[tokio::test]
        async fn all_triggers_idle_means_scale_down() {
            let mut parts = HandlerParts::new();
            parts.factory = factory_yielding(Ok(true), Ok(true));
            let handler = parts.build();

            let verdict = handler
                .calculate_scale_direction(&sample_service("gs"), Utc::now())
                .await
                .unwrap();
            assert_eq!(verdict, ScaleDirection::ScaleDown);
        }

        #[tokio::test]
        async fn any_busy_trigger_means_scale_up() {
            let mut parts = HandlerParts::new();
            parts.factory = factory_yielding(Ok(true), Ok(false));
            let handler = parts.build();

            let verdict = handler
                .calculate_scale_direction(&sample_service("gs"), Utc::now())
                .await
                .unwrap();
            assert_eq!(verdict, ScaleDirection::ScaleUp);
        }

        #[tokio::test]
        async fn unhealthy_scaler_means_no_scale() {
            let mut parts = HandlerParts::new();
            parts.factory = factory_yielding(Ok(false), Ok(true));
            let handler = parts.build();

            let verdict = handler
                .calculate_scale_direction(&sample_service("gs"), Utc::now())
                .await
                .unwrap();
            assert_eq!(verdict, ScaleDirection::NoScale);
        }

        #[tokio::test]
        async fn metric_backend_5xx_means_no_scale() {
            let mut parts = HandlerParts::new();
            parts.factory =
                factory_yielding(Err(ScalerError::UnexpectedStatus(503)), Ok(true));
            let handler = parts.build();

            let verdict = handler
                .calculate_scale_direction(&sample_service("gs"), Utc::now())
                .await
                .unwrap();
            assert_eq!(verdict, ScaleDirection::NoScale);
        }

        #[tokio::test]
        async fn creation_grace_window_means_no_scale() {
            let mut parts = HandlerParts::new();
            // Factory must not even be consulted inside the grace window.
            parts.factory.expect_create().never();
            let handler = parts.build();

            let mut es = sample_service("gs");
            es.metadata.creation_timestamp = Some(Time(Utc::now()));
            let verdict = handler
                .calculate_scale_direction(&es, Utc::now())
                .await
                .unwrap();
            assert_eq!(verdict, ScaleDirection::NoScale);
        }

        #[tokio::test]
        async fn outside_enabled_period_means_no_scale() {
            let mut parts = HandlerParts::new();
            parts.factory.expect_create().never();
            let handler = parts.build();

            let mut es = sample_service("gs");
            es.spec.enabled_period = Some(EnabledPeriod {
                schedule: "0 9 * * 1-5".to_string(),
                duration: "8h".to_string(),
            });
            // 2024-06-08 is a Saturday: the weekday window never opened.
            let saturday = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 6, 8, 14, 0, 0).unwrap();
            es.metadata.creation_timestamp =
                Some(Time(saturday - chrono::Duration::try_hours(24).unwrap()));

            let verdict = handler
                .calculate_scale_direction(&es, saturday)
                .await
                .unwrap();
            assert_eq!(verdict, ScaleDirection::NoScale);
        }

        #[tokio::test]
        async fn missing_triggers_are_an_error() {
            let parts = HandlerParts::new();
            let handler = parts.build();

            let mut es = sample_service("gs");
            es.spec.triggers.clear();
            assert!(handler
                .calculate_scale_direction(&es, Utc::now())
                .await
                .is_err());
        }
    }

    mod enactment {
        use super::*;

        #[tokio::test]
        async fn scale_down_within_cooldown_is_skipped() {
            let mut parts = HandlerParts::new();
            parts.scale.expect_current_replicas().never();
            parts.scale.expect_set_replicas().never();
            parts.autoscaler.expect_set_keda_paused().never();
            let handler = parts.build();

            let mut es = sample_service("gs");
            let now = Utc::now();
            es.status = Some(GovernedServiceStatus {
                last_scaled_up_time: Some(now - chrono::Duration::try_seconds(30).unwrap()),
                ..Default::default()
            });

            // cooldown_period is 60s and only 30s have passed.
            handler.handle_scale_to_zero(&es, now).await.unwrap();
        }

        #[tokio::test]
        async fn scale_down_pauses_keda_then_writes_zero() {
            let mut parts = HandlerParts::new();
            parts
                .autoscaler
                .expect_set_keda_paused()
                .withf(|ns, name, paused| ns == "n1" && name == "gs-keda" && *paused)
                .times(1)
                .returning(|_, _, _| Ok(()));
            parts
                .scale
                .expect_current_replicas()
                .returning(|_, _| Ok(Some(3)));
            parts
                .scale
                .expect_set_replicas()
                .withf(|_, _, replicas| *replicas == 0)
                .times(1)
                .returning(|_, _, _| Ok(()));
            parts
                .events
                .expect_publish()
                .withf(|_, _, kind, reason, _| {
                    *kind == EventKind::Normal && reason == "ScaledDownToZero"
                })
                .times(1)
                .returning(|_, _, _, _, _| ());
            let handler = parts.build();

            let mut es = sample_service("gs");
            es.spec.autoscaler = Some(AutoscalerSpec {
                type_: AutoscalerType::Keda,
                name: "gs-keda".to_string(),
            });
            let now = Utc::now();
            es.status = Some(GovernedServiceStatus {
                last_scaled_up_time: Some(now - chrono::Duration::try_seconds(120).unwrap()),
                ..Default::default()
            });

            handler.handle_scale_to_zero(&es, now).await.unwrap();
        }

        #[tokio::test]
        async fn scale_up_advances_cooldown_anchor_even_when_scale_fails() {
            let mut parts = HandlerParts::new();
            parts
                .status
                .expect_patch_last_scaled_up_time()
                .times(1)
                .returning(|_, _, _| Ok(()));
            parts
                .scale
                .expect_current_replicas()
                .returning(|_, _| Err(Error::Discovery("apps/v1/Deployment".to_string())));
            parts
                .events
                .expect_publish()
                .withf(|_, _, kind, reason, _| {
                    *kind == EventKind::Warning && reason == "ScaleFromZeroFailed"
                })
                .times(1)
                .returning(|_, _, _, _, _| ());
            let handler = parts.build();

            let es = sample_service("gs");
            assert!(handler.handle_scale_from_zero(&es, Utc::now()).await.is_err());
        }

        #[tokio::test]
        async fn scale_up_unpauses_keda_and_restores_min_replicas() {
            let mut parts = HandlerParts::new();
            parts
                .status
                .expect_patch_last_scaled_up_time()
                .times(1)
                .returning(|_, _, _| Ok(()));
            parts
                .autoscaler
                .expect_set_keda_paused()
                .withf(|_, _, paused| !*paused)
                .times(1)
                .returning(|_, _, _| Ok(()));
            parts
                .scale
                .expect_current_replicas()
                .returning(|_, _| Ok(Some(0)));
            parts
                .scale
                .expect_set_replicas()
                .withf(|_, _, replicas| *replicas == 3)
                .times(1)
                .returning(|_, _, _| Ok(()));
            parts
                .events
                .expect_publish()
                .withf(|_, _, _, reason, _| reason == "ScaledUpFromZero")
                .times(1)
                .returning(|_, _, _, _, _| ());
            let handler = parts.build();

            let mut es = sample_service("gs");
            es.spec.autoscaler = Some(AutoscalerSpec {
                type_: AutoscalerType::Keda,
                name: "gs-keda".to_string(),
            });
            handler.handle_scale_from_zero(&es, Utc::now()).await.unwrap();
        }
    }

    mod request_driven {
        use super::*;

        #[tokio::test]
        async fn target_at_zero_is_scaled_to_requested_replicas() {
            let mut parts = HandlerParts::new();
            parts
                .scale
                .expect_current_replicas()
                .returning(|_, _| Ok(Some(0)));
            parts
                .scale
                .expect_set_replicas()
                .withf(|_, _, replicas| *replicas == 3)
                .times(1)
                .returning(|_, _, _| Ok(()));
            parts
                .events
                .expect_publish()
                .withf(|_, _, _, reason, _| reason == "ScaledUpFromZero")
                .times(1)
                .returning(|_, _, _, _, _| ());
            let handler = parts.build();

            let scaled = handler
                .scale_when_at_zero("n1", "gs", &target(), 3)
                .await
                .unwrap();
            assert!(scaled);
        }

        #[tokio::test]
        async fn running_target_is_left_alone() {
            let mut parts = HandlerParts::new();
            parts
                .scale
                .expect_current_replicas()
                .returning(|_, _| Ok(Some(2)));
            parts.scale.expect_set_replicas().never();
            parts.events.expect_publish().never();
            let handler = parts.build();

            let scaled = handler
                .scale_when_at_zero("n1", "gs", &target(), 3)
                .await
                .unwrap();
            assert!(!scaled);
        }
    }
}

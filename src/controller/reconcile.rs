//! GovernedService reconciliation
//!
//! The reconciler keeps three things in line with the declarative resource:
//! the in-process service directory, the watch registry, and the traffic mode
//! (shadow endpoints plus status). Mode changes triggered by watch events go
//! through the same [`ModeController`] methods as reconcile-driven ones, so
//! every path observes the same idempotence rules.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::runtime::controller::Action;
use kube::runtime::watcher;
use futures::FutureExt;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::endpoints::EndpointRewriter;
use crate::config::ResolverConfig;
use crate::crd::{
    GovernedService, Mode, ScaleTargetRef, GOVERNED_SERVICE_FINALIZER,
};
use crate::directory::{DirectoryEntry, ServiceDirectory};
use crate::informer::{InformerKey, InformerManager, WatchCallback};
use crate::metrics::{INFORMER_HANDLER_COUNTER, OUTCOME_SUCCESS};
use crate::scaling::AutoscalerClient;
use crate::{Error, Result};

/// GovernedService and target-workload operations used by the reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GovernedServiceClient: Send + Sync {
    /// Replace the finalizer list of a GovernedService
    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()>;

    /// Merge-patch `status.mode` and `status.lastReconciledTime`
    async fn patch_status_mode(
        &self,
        namespace: &str,
        name: &str,
        mode: Mode,
        reconciled_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Fetch the scale target as a dynamic object, `None` when absent
    async fn get_target(
        &self,
        namespace: &str,
        target: &ScaleTargetRef,
    ) -> Result<Option<DynamicObject>>;

    /// List pods matching the given labels in a namespace
    async fn list_pods_matching(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>>;
}

/// [`GovernedServiceClient`] backed by the cluster
pub struct KubeGovernedServiceClient {
    client: Client,
}

impl KubeGovernedServiceClient {
    /// Create a new client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GovernedServiceClient for KubeGovernedServiceClient {
    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let api: Api<GovernedService> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_status_mode(
        &self,
        namespace: &str,
        name: &str,
        mode: Mode,
        reconciled_at: DateTime<Utc>,
    ) -> Result<()> {
        let api: Api<GovernedService> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({"status": {
            "mode": mode.to_string(),
            "lastReconciledTime": reconciled_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        }});
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_target(
        &self,
        namespace: &str,
        target: &ScaleTargetRef,
    ) -> Result<Option<DynamicObject>> {
        let api = dynamic_api_for(&self.client, namespace, target);
        match api.get(&target.name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods_matching(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let lp = ListParams::default().labels(&selector);
        Ok(api.list(&lp).await?.items)
    }
}

/// Dynamic API for a scale target, mapping its kind to the plural resource
/// the same way legacy declarations did (lowercase plus `s`)
pub fn dynamic_api_for(
    client: &Client,
    namespace: &str,
    target: &ScaleTargetRef,
) -> Api<DynamicObject> {
    let (group, version) = target.group_version();
    let gvk = GroupVersionKind::gvk(group, version, &target.canonical_kind());
    let ar = ApiResource::from_gvk(&gvk);
    Api::namespaced_with(client.clone(), namespace, &ar)
}

// =============================================================================
// Target readiness
// =============================================================================

/// Replica counts and pod selector extracted from a scale target
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetInfo {
    /// `spec.replicas`, zero when missing
    pub spec_replicas: i64,
    /// `status.replicas`, zero when missing
    pub status_replicas: i64,
    /// `spec.selector.matchLabels`, `None` when missing
    pub match_labels: Option<BTreeMap<String, String>>,
}

/// Pull replica counts and the pod selector out of an arbitrary scalable
/// resource. Missing fields are treated as "not ready" rather than errors.
pub fn extract_target_info(obj: &DynamicObject) -> TargetInfo {
    let spec_replicas = obj
        .data
        .pointer("/spec/replicas")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let status_replicas = obj
        .data
        .pointer("/status/replicas")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let match_labels = obj
        .data
        .pointer("/spec/selector/matchLabels")
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        });

    TargetInfo {
        spec_replicas,
        status_replicas,
        match_labels,
    }
}

/// Whether at least one pod is ready and not terminating
pub fn any_pod_ready(pods: &[Pod]) -> bool {
    pods.iter().any(|pod| {
        if pod.metadata.deletion_timestamp.is_some() {
            return false;
        }
        pod.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false)
    })
}

// =============================================================================
// Mode controller
// =============================================================================

/// Enacts mode decisions and the finalizer lifecycle.
///
/// Holds only mockable seams so the mode rules can be tested without a
/// cluster; [`Context`] adds the live client pieces on top.
pub struct ModeController {
    gs: Arc<dyn GovernedServiceClient>,
    rewriter: Arc<EndpointRewriter>,
    autoscaler: Arc<dyn AutoscalerClient>,
    /// Directory of governed services, shared with the RPC server
    pub directory: Arc<ServiceDirectory>,
    /// Watch registry, shared with reconcile
    pub informers: Arc<InformerManager>,
}

impl ModeController {
    /// Create a mode controller from its parts
    pub fn new(
        gs: Arc<dyn GovernedServiceClient>,
        rewriter: Arc<EndpointRewriter>,
        autoscaler: Arc<dyn AutoscalerClient>,
        directory: Arc<ServiceDirectory>,
        informers: Arc<InformerManager>,
    ) -> Self {
        Self {
            gs,
            rewriter,
            autoscaler,
            directory,
            informers,
        }
    }

    /// Switch a governed service to the given mode.
    ///
    /// Enacting the mode the service is already in is a no-op: shadow
    /// endpoints and autoscaler annotations are only touched on actual
    /// transitions, so repeated reconciles cannot churn orchestrator state.
    pub async fn switch_mode(&self, namespace: &str, name: &str, mode: Mode) -> Result<()> {
        let Some(entry) = self.directory_entry_by_name(namespace, name) else {
            return Err(Error::ServiceNotFound(format!("{namespace}/{name}")));
        };

        if entry.mode == mode {
            debug!(namespace, name, %mode, "already in requested mode");
            return Ok(());
        }

        match mode {
            Mode::Proxy => {
                let service = self
                    .rewriter
                    .get_service(namespace, &entry.spec.service)
                    .await?
                    .ok_or_else(|| {
                        Error::invalid_resource(format!(
                            "service {} not found for {namespace}/{name}",
                            entry.spec.service
                        ))
                    })?;
                self.rewriter.install_proxy_endpoints(&service).await?;
                self.set_autoscaler_paused(&entry, true).await?;
            }
            Mode::Serve => {
                self.rewriter
                    .remove_proxy_endpoints(namespace, &entry.spec.service)
                    .await?;
                self.set_autoscaler_paused(&entry, false).await?;
            }
            Mode::Unknown => {
                return Err(Error::invalid_resource(
                    "cannot switch to the unknown mode",
                ))
            }
        }

        self.gs
            .patch_status_mode(namespace, name, mode, Utc::now())
            .await?;
        self.directory.set_mode(namespace, &entry.spec.service, mode);
        info!(namespace, name, %mode, "mode switched");
        Ok(())
    }

    async fn set_autoscaler_paused(&self, entry: &DirectoryEntry, paused: bool) -> Result<()> {
        use crate::crd::AutoscalerType;
        if let Some(autoscaler) = &entry.spec.autoscaler {
            if autoscaler.type_ == AutoscalerType::Keda {
                self.autoscaler
                    .set_keda_paused(&entry.namespace, &autoscaler.name, paused)
                    .await?;
            }
        }
        Ok(())
    }

    /// Evaluate target readiness and enforce the corresponding mode
    pub async fn reconcile_target_state(
        &self,
        namespace: &str,
        name: &str,
        target: &ScaleTargetRef,
    ) -> Result<()> {
        let ready = match self.gs.get_target(namespace, target).await? {
            None => false,
            Some(obj) => self.target_ready(namespace, &obj).await?,
        };

        if ready {
            self.switch_mode(namespace, name, Mode::Serve).await
        } else {
            self.switch_mode(namespace, name, Mode::Proxy).await
        }
    }

    /// Whether the target has desired and observed replicas plus at least one
    /// ready pod under its selector
    pub async fn target_ready(&self, namespace: &str, obj: &DynamicObject) -> Result<bool> {
        let info = extract_target_info(obj);
        if info.spec_replicas <= 0 || info.status_replicas <= 0 {
            return Ok(false);
        }
        let Some(labels) = info.match_labels else {
            warn!(namespace, "target has no pod selector, treating as not ready");
            return Ok(false);
        };

        let pods = self.gs.list_pods_matching(namespace, &labels).await?;
        Ok(any_pod_ready(&pods))
    }

    /// Make sure our finalizer is on the resource
    pub async fn ensure_finalizer(&self, es: &GovernedService) -> Result<()> {
        let namespace = es.metadata.namespace.as_deref().unwrap_or_default();
        let name = es.name_any();
        let mut finalizers = es.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == GOVERNED_SERVICE_FINALIZER) {
            return Ok(());
        }
        finalizers.push(GOVERNED_SERVICE_FINALIZER.to_string());
        self.gs.set_finalizers(namespace, &name, finalizers).await
    }

    /// Drain a deleted GovernedService: stop its watches, drop the directory
    /// entry, remove the shadow endpoints, then release the finalizer.
    ///
    /// Any failure leaves the finalizer in place so the reconciler retries.
    pub async fn finalize(&self, es: &GovernedService) -> Result<()> {
        let namespace = es.metadata.namespace.as_deref().unwrap_or_default();
        let name = es.name_any();
        let service = &es.spec.service;

        for key in watch_keys(namespace, &name, es, namespace) {
            self.informers.stop(&key);
        }

        self.rewriter
            .remove_proxy_endpoints(namespace, service)
            .await?;
        self.directory.remove(namespace, service);

        let finalizers: Vec<String> = es
            .metadata
            .finalizers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != GOVERNED_SERVICE_FINALIZER)
            .collect();
        self.gs.set_finalizers(namespace, &name, finalizers).await?;

        info!(namespace, name = %name, "governed service finalized");
        Ok(())
    }

    fn directory_entry_by_name(&self, namespace: &str, name: &str) -> Option<DirectoryEntry> {
        // Directory keys are (namespace, service); scan for the owning
        // resource name. The directory is small (one entry per governed
        // service in the watched namespace).
        self.directory
            .all_entries()
            .into_iter()
            .find(|e| e.namespace == namespace && e.name == name)
    }
}

/// The three watch keys registered for one governed service
fn watch_keys(
    namespace: &str,
    name: &str,
    es: &GovernedService,
    resolver_namespace: &str,
) -> Vec<InformerKey> {
    vec![
        InformerKey {
            namespace: resolver_namespace.to_string(),
            governed_name: name.to_string(),
            resource_name: "resolver".to_string(),
            resource_type: "deployments".to_string(),
        },
        InformerKey {
            namespace: namespace.to_string(),
            governed_name: name.to_string(),
            resource_name: es.spec.service.clone(),
            resource_type: "services".to_string(),
        },
        InformerKey {
            namespace: namespace.to_string(),
            governed_name: name.to_string(),
            resource_name: es.spec.scale_target_ref.name.clone(),
            resource_type: plural_of(&es.spec.scale_target_ref.canonical_kind()),
        },
    ]
}

/// Lowercase-plus-`s` pluralisation used for watch keys and the dynamic API
fn plural_of(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        lower
    } else {
        format!("{lower}s")
    }
}

// =============================================================================
// Reconcile entry points
// =============================================================================

/// Controller context containing shared state and clients
pub struct Context {
    /// Mode controller with all mockable seams
    pub modes: Arc<ModeController>,
    /// Kubernetes client for building watch APIs
    pub client: Client,
    /// Resolver identity used for the resolver watch and endpoint rewrite
    pub resolver: ResolverConfig,
}

/// Reconcile a GovernedService resource
#[instrument(skip(es, ctx), fields(resource = %es.name_any()))]
pub async fn reconcile(es: Arc<GovernedService>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = es
        .metadata
        .namespace
        .clone()
        .ok_or_else(|| Error::invalid_resource("resource has no namespace"))?;
    let name = es.name_any();

    if es.metadata.deletion_timestamp.is_some() {
        ctx.modes.finalize(&es).await?;
        return Ok(Action::await_change());
    }

    if let Err(e) = es.spec.validate() {
        // A broken spec cannot be acted on; wait for the user to fix it.
        warn!(error = %e, "governed service validation failed");
        return Ok(Action::await_change());
    }

    ctx.modes.ensure_finalizer(&es).await?;

    ctx.modes.directory.upsert(DirectoryEntry {
        name: name.clone(),
        namespace: namespace.clone(),
        spec: es.spec.clone(),
        mode: es
            .status
            .as_ref()
            .map(|s| s.mode)
            .unwrap_or(Mode::Unknown),
    });

    start_watches(&es, &ctx, &namespace, &name);

    ctx.modes
        .reconcile_target_state(&namespace, &name, &es.spec.scale_target_ref)
        .await?;

    info!("reconciled");
    Ok(Action::requeue(Duration::from_secs(300)))
}

/// Error policy: requeue with a short delay
pub fn error_policy(es: Arc<GovernedService>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, resource = %es.name_any(), "reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}

/// Register the three watch families for a governed service. Starts are
/// idempotent per key, so re-running on every reconcile is free.
fn start_watches(es: &GovernedService, ctx: &Arc<Context>, namespace: &str, name: &str) {
    let keys = watch_keys(namespace, name, es, &ctx.resolver.component.namespace);
    let service_label = format!("{namespace}/{name}");

    // Resolver deployment: rewrite this service's shadow endpoints whenever
    // the resolver's pod set moves, so proxied traffic keeps flowing.
    let resolver_api = {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("apps", "v1", "Deployment"));
        Api::namespaced_with(
            ctx.client.clone(),
            &ctx.resolver.component.namespace,
            &ar,
        )
    };
    let resolver_config = watcher::Config::default().fields(&format!(
        "metadata.name={}",
        ctx.resolver.component.deployment_name
    ));
    ctx.modes.informers.start(
        &keys[0],
        resolver_api,
        resolver_config,
        counted_callback(service_label.clone(), keys[0].to_string(), {
            let modes = ctx.modes.clone();
            let namespace = namespace.to_string();
            let name = name.to_string();
            let service = es.spec.service.clone();
            move |_obj| {
                let modes = modes.clone();
                let namespace = namespace.clone();
                let name = name.clone();
                let service = service.clone();
                async move {
                    let in_proxy = modes
                        .directory
                        .get(&namespace, &service)
                        .map(|e| e.mode == Mode::Proxy)
                        .unwrap_or(false);
                    if !in_proxy {
                        return Ok(());
                    }
                    let Some(svc) = modes.rewriter.get_service(&namespace, &service).await? else {
                        warn!(namespace, service = %service, "backing service missing");
                        return Ok(());
                    };
                    modes.rewriter.install_proxy_endpoints(&svc).await?;
                    debug!(namespace, name = %name, "shadow endpoints refreshed after resolver change");
                    Ok(())
                }
                .boxed()
            }
        }),
    );

    // Public service object: re-point its endpoints while proxied.
    let service_api = {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Service"));
        Api::namespaced_with(ctx.client.clone(), namespace, &ar)
    };
    let service_config =
        watcher::Config::default().fields(&format!("metadata.name={}", es.spec.service));
    ctx.modes.informers.start(
        &keys[1],
        service_api,
        service_config,
        counted_callback(service_label.clone(), keys[1].to_string(), {
            let modes = ctx.modes.clone();
            let namespace = namespace.to_string();
            let service = es.spec.service.clone();
            move |_obj| {
                let modes = modes.clone();
                let namespace = namespace.clone();
                let service = service.clone();
                async move {
                    let in_proxy = modes
                        .directory
                        .get(&namespace, &service)
                        .map(|e| e.mode == Mode::Proxy)
                        .unwrap_or(false);
                    if !in_proxy {
                        return Ok(());
                    }
                    let Some(svc) = modes.rewriter.get_service(&namespace, &service).await? else {
                        return Ok(());
                    };
                    modes.rewriter.install_proxy_endpoints(&svc).await
                }
                .boxed()
            }
        }),
    );

    // Scale target: replica and readiness changes flip the mode.
    let target_api = dynamic_api_for(&ctx.client, namespace, &es.spec.scale_target_ref);
    let target_config = watcher::Config::default().fields(&format!(
        "metadata.name={}",
        es.spec.scale_target_ref.name
    ));
    ctx.modes.informers.start(
        &keys[2],
        target_api,
        target_config,
        counted_callback(service_label, keys[2].to_string(), {
            let modes = ctx.modes.clone();
            let namespace = namespace.to_string();
            let name = name.to_string();
            move |obj: DynamicObject| {
                let modes = modes.clone();
                let namespace = namespace.clone();
                let name = name.clone();
                async move {
                    let ready = modes.target_ready(&namespace, &obj).await?;
                    let mode = if ready { Mode::Serve } else { Mode::Proxy };
                    modes.switch_mode(&namespace, &name, mode).await
                }
                .boxed()
            }
        }),
    );
}

/// Wrap a handler so every invocation lands in the informer counter with
/// either `success` or its error text
fn counted_callback<F>(service: String, key: String, handler: F) -> WatchCallback
where
    F: Fn(DynamicObject) -> futures::future::BoxFuture<'static, Result<()>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(move |obj| {
        let service = service.clone();
        let key = key.clone();
        let fut = handler(obj);
        async move {
            let outcome = fut.await;
            let label = match &outcome {
                Ok(()) => OUTCOME_SUCCESS.to_string(),
                Err(e) => e.to_string(),
            };
            INFORMER_HANDLER_COUNTER
                .with_label_values(&[&service, &key, &label])
                .inc();
            outcome
        }
        .boxed()
    })
}

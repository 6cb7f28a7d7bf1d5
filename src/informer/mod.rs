//! Registry of per-resource watches
//!
//! The reconciler needs three watch families per governed service (resolver
//! deployment, the public service object, and the scale target). Watches are
//! expensive and must be started at most once per key, survive reconcile
//! re-runs untouched, and be torn down when the owning GovernedService is
//! deleted so a later re-create starts fresh.
//!
//! The manager holds typed callbacks supplied at registration time rather
//! than a back-pointer to the reconciler, which keeps the two testable in
//! isolation.

use std::fmt;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::{watcher, WatchStreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Identity of one watch: which governed service it belongs to and which
/// resource it observes
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InformerKey {
    /// Namespace of the watched resource
    pub namespace: String,
    /// Name of the owning GovernedService
    pub governed_name: String,
    /// Name of the watched resource
    pub resource_name: String,
    /// Lowercased plural resource type, e.g. `services`
    pub resource_type: String,
}

impl fmt::Display for InformerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.namespace, self.governed_name, self.resource_name, self.resource_type
        )
    }
}

/// Async handler invoked for every added or updated object seen by a watch
pub type WatchCallback =
    Arc<dyn Fn(DynamicObject) -> BoxFuture<'static, crate::Result<()>> + Send + Sync>;

struct WatchHandle {
    task: JoinHandle<()>,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Keyed registry of running watches with a start-once guard per key
#[derive(Default)]
pub struct InformerManager {
    registry: DashMap<String, WatchHandle>,
}

impl InformerManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a watch for `key` unless one is already running.
    ///
    /// Returns `true` when a new watch was started; duplicate starts are
    /// silently idempotent and return `false`.
    pub fn start(
        &self,
        key: &InformerKey,
        api: Api<DynamicObject>,
        config: watcher::Config,
        callback: WatchCallback,
    ) -> bool {
        let key_string = key.to_string();
        self.start_task(key, async move {
            let mut stream = std::pin::pin!(watcher(api, config).default_backoff().applied_objects());
            while let Some(item) = stream.next().await {
                match item {
                    Ok(obj) => {
                        if let Err(e) = callback(obj).await {
                            warn!(key = %key_string, error = %e, "watch handler failed");
                        }
                    }
                    Err(e) => {
                        warn!(key = %key_string, error = %e, "watch stream error, backing off");
                    }
                }
            }
        })
    }

    /// Run an arbitrary future as the watch body for `key`, with the same
    /// start-once semantics as [`InformerManager::start`]. The seam the tests
    /// drive directly.
    pub fn start_task<F>(&self, key: &InformerKey, body: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match self.registry.entry(key.to_string()) {
            Entry::Occupied(_) => {
                debug!(key = %key, "watch already running, skipping start");
                false
            }
            Entry::Vacant(slot) => {
                info!(key = %key, "starting watch");
                slot.insert(WatchHandle {
                    task: tokio::spawn(body),
                });
                true
            }
        }
    }

    /// Tear down the watch for `key` and release its start-once guard so a
    /// future start can re-establish it. Stopping an unknown key is a no-op.
    pub fn stop(&self, key: &InformerKey) -> bool {
        match self.registry.remove(&key.to_string()) {
            Some((_, handle)) => {
                info!(key = %key, "stopping watch");
                drop(handle);
                true
            }
            None => false,
        }
    }

    /// Whether a watch is currently registered for `key`
    pub fn is_running(&self, key: &InformerKey) -> bool {
        self.registry.contains_key(&key.to_string())
    }

    /// Number of registered watches
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Whether no watches are registered
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

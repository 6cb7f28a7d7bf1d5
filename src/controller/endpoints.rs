//! Shadow endpoint list management
//!
//! While a governed service is in proxy mode its virtual address must land on
//! the resolver pods instead of the (absent) target pods. That is done with a
//! controller-managed EndpointSlice labelled onto the governed service: same
//! first port definition as the service itself, but numbered to the
//! resolver's data-plane port, with one endpoint per resolver pod IP.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointPort, EndpointSlice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result, SERVICE_NAME_LABEL};

/// EndpointSlice operations used by the rewriter
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EndpointSliceClient: Send + Sync {
    /// List all endpoint slices carrying `kubernetes.io/service-name=<service>`
    async fn list_by_service(&self, service_name: &str) -> Result<Vec<EndpointSlice>>;

    /// Fetch one endpoint slice, `None` when absent
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<EndpointSlice>>;

    /// Create an endpoint slice
    async fn create(&self, namespace: &str, slice: &EndpointSlice) -> Result<()>;

    /// Replace an existing endpoint slice
    async fn update(&self, namespace: &str, slice: &EndpointSlice) -> Result<()>;

    /// Delete an endpoint slice; absence is not an error
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Service lookups used by the rewriter
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Fetch one service, `None` when absent
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
}

/// [`EndpointSliceClient`] backed by the cluster
pub struct KubeEndpointSliceClient {
    client: Client,
}

impl KubeEndpointSliceClient {
    /// Create a new endpoint slice client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EndpointSliceClient for KubeEndpointSliceClient {
    async fn list_by_service(&self, service_name: &str) -> Result<Vec<EndpointSlice>> {
        let api: Api<EndpointSlice> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&format!("{SERVICE_NAME_LABEL}={service_name}"));
        Ok(api.list(&lp).await?.items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<EndpointSlice>> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(slice) => Ok(Some(slice)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, namespace: &str, slice: &EndpointSlice) -> Result<()> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), slice).await?;
        Ok(())
    }

    async fn update(&self, namespace: &str, slice: &EndpointSlice) -> Result<()> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        let name = slice.metadata.name.as_deref().unwrap_or_default();
        api.replace(name, &PostParams::default(), slice).await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// [`ServiceClient`] backed by the cluster
pub struct KubeServiceClient {
    client: Client,
}

impl KubeServiceClient {
    /// Create a new service client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceClient for KubeServiceClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(svc) => Ok(Some(svc)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether an endpoint may receive traffic.
///
/// Endpoint conditions are tri-state and `nil` historically meant "assume
/// ready". The strict reading adopted here: an endpoint is active iff it has
/// at least one address, `ready` is not explicitly false, `serving` is not
/// explicitly false, and `terminating` is not explicitly true.
pub fn endpoint_is_active(endpoint: &Endpoint) -> bool {
    if endpoint.addresses.is_empty() {
        return false;
    }
    let Some(conditions) = &endpoint.conditions else {
        return true;
    };
    conditions.ready != Some(false)
        && conditions.serving != Some(false)
        && conditions.terminating != Some(true)
}

/// Deterministic name of the shadow endpoint slice for a service. Stable
/// across restarts so upserts and deletes find the same object.
pub fn shadow_slice_name(service_name: &str) -> String {
    let digest = Sha256::digest(service_name.as_bytes());
    let mut suffix = String::with_capacity(10);
    for byte in &digest[..5] {
        suffix.push_str(&format!("{byte:02x}"));
    }
    format!("{service_name}-to-resolver-{suffix}")
}

/// Creates, rewrites, and removes shadow endpoint lists
pub struct EndpointRewriter {
    slices: Arc<dyn EndpointSliceClient>,
    services: Arc<dyn ServiceClient>,
    resolver_service_name: String,
    resolver_proxy_port: u16,
}

impl EndpointRewriter {
    /// Create a rewriter with explicit clients
    pub fn new(
        slices: Arc<dyn EndpointSliceClient>,
        services: Arc<dyn ServiceClient>,
        resolver_service_name: String,
        resolver_proxy_port: u16,
    ) -> Self {
        Self {
            slices,
            services,
            resolver_service_name,
            resolver_proxy_port,
        }
    }

    /// Create a rewriter wired to the cluster
    pub fn with_client(
        client: Client,
        resolver_service_name: String,
        resolver_proxy_port: u16,
    ) -> Self {
        Self::new(
            Arc::new(KubeEndpointSliceClient::new(client.clone())),
            Arc::new(KubeServiceClient::new(client)),
            resolver_service_name,
            resolver_proxy_port,
        )
    }

    /// Fetch the governed service's backing Service object
    pub async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.services.get(namespace, name).await
    }

    /// Current resolver pod IPs, via the slices of the resolver's own service
    pub async fn resolver_pod_ips(&self) -> Result<Vec<String>> {
        let slices = self
            .slices
            .list_by_service(&self.resolver_service_name)
            .await?;

        let mut ips = Vec::new();
        for slice in &slices {
            for endpoint in &slice.endpoints {
                ips.extend(endpoint.addresses.iter().cloned());
            }
        }
        if ips.is_empty() {
            return Err(Error::NoResolverPodFound);
        }
        Ok(ips)
    }

    /// Point the governed service's virtual address at the resolver pods by
    /// upserting the shadow endpoint slice
    pub async fn install_proxy_endpoints(&self, service: &Service) -> Result<()> {
        let namespace = service.metadata.namespace.as_deref().unwrap_or_default();
        let service_name = service.metadata.name.as_deref().unwrap_or_default();

        let resolver_ips = self.resolver_pod_ips().await?;
        let slice = build_shadow_slice(service, &resolver_ips, self.resolver_proxy_port);
        let name = slice.metadata.name.as_deref().unwrap_or_default();

        if self.slices.get(namespace, name).await?.is_some() {
            self.slices.update(namespace, &slice).await?;
            info!(endpointslice = name, namespace, "shadow endpoint slice updated");
        } else {
            self.slices.create(namespace, &slice).await?;
            info!(endpointslice = name, namespace, "shadow endpoint slice created");
        }
        Ok(())
    }

    /// Remove the shadow endpoint slice; a missing slice is not an error
    pub async fn remove_proxy_endpoints(&self, namespace: &str, service_name: &str) -> Result<()> {
        let name = shadow_slice_name(service_name);
        self.slices.delete(namespace, &name).await?;
        debug!(endpointslice = %name, namespace, "shadow endpoint slice removed");
        Ok(())
    }
}

/// Build the shadow endpoint slice for a service: its first port definition
/// renumbered to the resolver's data-plane port, one endpoint per resolver IP
fn build_shadow_slice(service: &Service, resolver_ips: &[String], proxy_port: u16) -> EndpointSlice {
    let service_name = service.metadata.name.as_deref().unwrap_or_default();

    let first_port_name = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.first())
        .and_then(|p| p.name.clone());

    EndpointSlice {
        metadata: ObjectMeta {
            name: Some(shadow_slice_name(service_name)),
            namespace: service.metadata.namespace.clone(),
            labels: Some(BTreeMap::from([(
                SERVICE_NAME_LABEL.to_string(),
                service_name.to_string(),
            )])),
            ..Default::default()
        },
        address_type: "IPv4".to_string(),
        ports: Some(vec![EndpointPort {
            name: first_port_name,
            protocol: Some("TCP".to_string()),
            port: Some(i32::from(proxy_port)),
            app_protocol: None,
        }]),
        endpoints: resolver_ips
            .iter()
            .map(|ip| Endpoint {
                addresses: vec![ip.clone()],
                ..Default::default()
            })
            .collect(),
    }
}

//! Environment configuration
//!
//! Both halves of the system (operator and resolver) discover each other
//! through environment variables. All of them are required at startup; a
//! missing or invalid value is a fatal configuration error, reported through
//! [`crate::Error::Config`] rather than a panic so `main` can log it once and
//! exit.

use std::time::Duration;

use crate::{Error, Result, DEFAULT_POLLING_INTERVAL};

/// Env var holding the resolver's namespace
pub const ENV_RESOLVER_NAMESPACE: &str = "ELASTI_RESOLVER_NAMESPACE";
/// Env var holding the resolver's deployment name
pub const ENV_RESOLVER_DEPLOYMENT_NAME: &str = "ELASTI_RESOLVER_DEPLOYMENT_NAME";
/// Env var holding the resolver's service name
pub const ENV_RESOLVER_SERVICE_NAME: &str = "ELASTI_RESOLVER_SERVICE_NAME";
/// Env var holding the resolver's control port
pub const ENV_RESOLVER_PORT: &str = "ELASTI_RESOLVER_PORT";
/// Env var holding the resolver's data-plane (reverse proxy) port
pub const ENV_RESOLVER_PROXY_PORT: &str = "ELASTI_RESOLVER_PROXY_PORT";
/// Env var holding the operator's namespace
pub const ENV_OPERATOR_NAMESPACE: &str = "ELASTI_OPERATOR_NAMESPACE";
/// Env var holding the operator's deployment name
pub const ENV_OPERATOR_DEPLOYMENT_NAME: &str = "ELASTI_OPERATOR_DEPLOYMENT_NAME";
/// Env var holding the operator's service name
pub const ENV_OPERATOR_SERVICE_NAME: &str = "ELASTI_OPERATOR_SERVICE_NAME";
/// Env var holding the operator's listen port
pub const ENV_OPERATOR_PORT: &str = "ELASTI_OPERATOR_PORT";
/// Env var holding the cluster DNS domain
pub const ENV_KUBERNETES_CLUSTER_DOMAIN: &str = "KUBERNETES_CLUSTER_DOMAIN";
/// Env var overriding the scale-decision sweep interval (duration string)
pub const ENV_POLLING_INTERVAL: &str = "POLLING_INTERVAL";

/// Namespace/name/service identity plus listen port of one component
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentConfig {
    /// Namespace the component runs in
    pub namespace: String,
    /// Deployment name of the component
    pub deployment_name: String,
    /// Service name of the component
    pub service_name: String,
    /// Listen port of the component
    pub port: u16,
}

/// Resolver identity plus its data-plane port
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Shared identity fields
    pub component: ComponentConfig,
    /// Port the resolver's reverse proxy listens on; shadow endpoint lists
    /// point governed traffic here
    pub reverse_proxy_port: u16,
}

/// Lookup function abstracting `std::env::var` so parsing is testable
type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn required_string(lookup: Lookup, name: &str) -> Result<String> {
    match lookup(name) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::config(format!("required env value not set: {name}"))),
    }
}

fn required_port(lookup: Lookup, name: &str) -> Result<u16> {
    let raw = required_string(lookup, name)?;
    let port: u32 = raw
        .parse()
        .map_err(|_| Error::config(format!("env value is not an integer: {name}={raw}")))?;
    if !(1..=65_535).contains(&port) {
        return Err(Error::config(format!(
            "port out of range for {name}: {port} (want 1..65535)"
        )));
    }
    Ok(port as u16)
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

impl ResolverConfig {
    /// Read the resolver configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    /// Read the resolver configuration through the given lookup
    pub fn from_lookup(lookup: Lookup) -> Result<Self> {
        Ok(Self {
            component: ComponentConfig {
                namespace: required_string(lookup, ENV_RESOLVER_NAMESPACE)?,
                deployment_name: required_string(lookup, ENV_RESOLVER_DEPLOYMENT_NAME)?,
                service_name: required_string(lookup, ENV_RESOLVER_SERVICE_NAME)?,
                port: required_port(lookup, ENV_RESOLVER_PORT)?,
            },
            reverse_proxy_port: required_port(lookup, ENV_RESOLVER_PROXY_PORT)?,
        })
    }
}

impl ComponentConfig {
    /// Read the operator configuration from the process environment
    pub fn operator_from_env() -> Result<Self> {
        Self::operator_from_lookup(&env_lookup)
    }

    /// Read the operator configuration through the given lookup
    pub fn operator_from_lookup(lookup: Lookup) -> Result<Self> {
        Ok(Self {
            namespace: required_string(lookup, ENV_OPERATOR_NAMESPACE)?,
            deployment_name: required_string(lookup, ENV_OPERATOR_DEPLOYMENT_NAME)?,
            service_name: required_string(lookup, ENV_OPERATOR_SERVICE_NAME)?,
            port: required_port(lookup, ENV_OPERATOR_PORT)?,
        })
    }
}

/// Read the cluster DNS domain, e.g. `cluster.local`
pub fn kubernetes_cluster_domain() -> Result<String> {
    required_string(&env_lookup, ENV_KUBERNETES_CLUSTER_DOMAIN)
}

/// Read the scale-decision sweep interval.
///
/// Absent means the default; present but unparsable, zero, or negative is a
/// configuration error.
pub fn polling_interval() -> Result<Duration> {
    polling_interval_from(&env_lookup)
}

fn polling_interval_from(lookup: Lookup) -> Result<Duration> {
    match lookup(ENV_POLLING_INTERVAL) {
        None => Ok(DEFAULT_POLLING_INTERVAL),
        Some(raw) => {
            let interval = humantime::parse_duration(&raw).map_err(|e| {
                Error::config(format!("invalid {ENV_POLLING_INTERVAL} value {raw:?}: {e}"))
            })?;
            if interval.is_zero() {
                return Err(Error::config(format!(
                    "{ENV_POLLING_INTERVAL} must be positive, got {raw:?}"
                )));
            }
            Ok(interval)
        }
    }
}

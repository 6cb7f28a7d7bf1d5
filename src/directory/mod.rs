//! Process-wide directory of governed services
//!
//! The directory maps `(namespace, service)` to the last-observed spec and
//! traffic mode of the owning GovernedService. The reconciler writes an entry
//! on every successful reconcile; the control RPC server and the resolver-pod
//! watch read it. Entries are removed only by the finalizer path, so an entry
//! exists iff the declarative resource exists and has not been deleted.

use dashmap::DashMap;

use crate::crd::{GovernedServiceSpec, Mode};

/// Snapshot of one governed service held in the directory
#[derive(Clone, Debug)]
pub struct DirectoryEntry {
    /// Name of the owning GovernedService resource
    pub name: String,
    /// Namespace of the owning GovernedService resource
    pub namespace: String,
    /// Spec as of the last successful reconcile
    pub spec: GovernedServiceSpec,
    /// Traffic mode as of the last successful reconcile
    pub mode: Mode,
}

/// Lock-free concurrent map of governed services, keyed by
/// `namespace/service`. Entries are replaced as a whole.
#[derive(Debug, Default)]
pub struct ServiceDirectory {
    services: DashMap<String, DirectoryEntry>,
}

fn key(namespace: &str, service: &str) -> String {
    format!("{namespace}/{service}")
}

impl ServiceDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for the entry's `(namespace, service)`
    pub fn upsert(&self, entry: DirectoryEntry) {
        self.services
            .insert(key(&entry.namespace, &entry.spec.service), entry);
    }

    /// Look up the entry for `(namespace, service)`
    pub fn get(&self, namespace: &str, service: &str) -> Option<DirectoryEntry> {
        self.services
            .get(&key(namespace, service))
            .map(|e| e.clone())
    }

    /// Remove the entry for `(namespace, service)`. Driven exclusively by the
    /// finalizer of the owning GovernedService.
    pub fn remove(&self, namespace: &str, service: &str) {
        self.services.remove(&key(namespace, service));
    }

    /// Update just the mode of an existing entry, if present
    pub fn set_mode(&self, namespace: &str, service: &str, mode: Mode) {
        if let Some(mut entry) = self.services.get_mut(&key(namespace, service)) {
            entry.mode = mode;
        }
    }

    /// Snapshot of every entry
    pub fn all_entries(&self) -> Vec<DirectoryEntry> {
        self.services.iter().map(|e| e.clone()).collect()
    }

    /// Snapshot of all entries currently in proxy mode
    pub fn proxy_mode_entries(&self) -> Vec<DirectoryEntry> {
        self.services
            .iter()
            .filter(|e| e.mode == Mode::Proxy)
            .map(|e| e.clone())
            .collect()
    }

    /// Number of governed services currently known
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the directory is empty
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ScaleTargetRef, ScaleTrigger};

    fn entry(namespace: &str, service: &str, mode: Mode) -> DirectoryEntry {
        DirectoryEntry {
            name: format!("{service}-gs"),
            namespace: namespace.to_string(),
            spec: GovernedServiceSpec {
                scale_target_ref: ScaleTargetRef {
                    api_version: "apps/v1".to_string(),
                    kind: "Deployment".to_string(),
                    name: service.to_string(),
                },
                service: service.to_string(),
                min_target_replicas: 1,
                cooldown_period: 0,
                triggers: vec![ScaleTrigger {
                    type_: "prometheus".to_string(),
                    metadata: serde_json::Value::Null,
                }],
                autoscaler: None,
                enabled_period: None,
            },
            mode,
        }
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let dir = ServiceDirectory::new();
        dir.upsert(entry("n1", "s1", Mode::Serve));

        let got = dir.get("n1", "s1").unwrap();
        assert_eq!(got.name, "s1-gs");
        assert_eq!(got.mode, Mode::Serve);
        assert!(dir.get("n2", "s1").is_none());
    }

    #[test]
    fn upsert_replaces_the_whole_entry() {
        let dir = ServiceDirectory::new();
        dir.upsert(entry("n1", "s1", Mode::Serve));
        dir.upsert(entry("n1", "s1", Mode::Proxy));

        assert_eq!(dir.len(), 1);
        assert_eq!(dir.get("n1", "s1").unwrap().mode, Mode::Proxy);
    }

    #[test]
    fn remove_drops_only_the_named_service() {
        let dir = ServiceDirectory::new();
        dir.upsert(entry("n1", "s1", Mode::Serve));
        dir.upsert(entry("n1", "s2", Mode::Serve));

        dir.remove("n1", "s1");
        assert!(dir.get("n1", "s1").is_none());
        assert!(dir.get("n1", "s2").is_some());
    }

    #[test]
    fn proxy_mode_entries_filters_by_mode() {
        let dir = ServiceDirectory::new();
        dir.upsert(entry("n1", "s1", Mode::Proxy));
        dir.upsert(entry("n1", "s2", Mode::Serve));
        dir.upsert(entry("n2", "s3", Mode::Proxy));

        let proxied = dir.proxy_mode_entries();
        let mut names: Vec<_> = proxied.iter().map(|e| e.spec.service.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["s1", "s3"]);
    }

    #[test]
    fn set_mode_updates_in_place() {
        let dir = ServiceDirectory::new();
        dir.upsert(entry("n1", "s1", Mode::Proxy));
        dir.set_mode("n1", "s1", Mode::Serve);
        assert_eq!(dir.get("n1", "s1").unwrap().mode, Mode::Serve);

        // Unknown services are ignored rather than created.
        dir.set_mode("n1", "missing", Mode::Serve);
        assert!(dir.get("n1", "missing").is_none());
    }
}

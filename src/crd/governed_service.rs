//! GovernedService Custom Resource Definition
//!
//! A GovernedService names a scalable workload and the virtual service in
//! front of it, and declares the triggers under which the workload may be
//! scaled to zero. The operator owns the `status` subresource and records the
//! current traffic mode there.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{DEFAULT_COOLDOWN_PERIOD, MAX_COOLDOWN_SECONDS};

/// Finalizer the operator attaches to every GovernedService so that watches,
/// directory entries, and shadow endpoint lists are cleaned up before the
/// resource disappears
pub const GOVERNED_SERVICE_FINALIZER: &str = "drowse.dev/finalizer";

/// Specification for a GovernedService
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "drowse.dev",
    version = "v1alpha1",
    kind = "GovernedService",
    plural = "governedservices",
    shortname = "gsvc",
    status = "GovernedServiceStatus",
    namespaced,
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".status.mode"}"#,
    printcolumn = r#"{"name":"Service","type":"string","jsonPath":".spec.service"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GovernedServiceSpec {
    /// The workload whose replica count the operator manipulates
    pub scale_target_ref: ScaleTargetRef,

    /// Name of the virtual service exposed to consumers
    pub service: String,

    /// Replica count restored on scale-up
    #[serde(default = "default_min_target_replicas")]
    pub min_target_replicas: i32,

    /// Minimum seconds between a scale-up and a later scale-down.
    /// Zero means "use the system default".
    #[serde(default)]
    pub cooldown_period: i32,

    /// Conditions under which the workload counts as idle
    #[serde(default)]
    pub triggers: Vec<ScaleTrigger>,

    /// Existing cluster-level autoscaler to pause while scaled to zero
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaler: Option<AutoscalerSpec>,

    /// Time window during which scale-to-zero is permitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_period: Option<EnabledPeriod>,
}

fn default_min_target_replicas() -> i32 {
    1
}

impl GovernedServiceSpec {
    /// Validate the spec before acting on it
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.service.is_empty() {
            return Err(crate::Error::invalid_resource("spec.service is required"));
        }
        if self.scale_target_ref.name.is_empty() || self.scale_target_ref.kind.is_empty() {
            return Err(crate::Error::invalid_resource(
                "spec.scaleTargetRef.kind and spec.scaleTargetRef.name are required",
            ));
        }
        if self.min_target_replicas < 1 {
            return Err(crate::Error::invalid_resource(
                "spec.minTargetReplicas must be at least 1",
            ));
        }
        if self.cooldown_period < 0 || self.cooldown_period > MAX_COOLDOWN_SECONDS {
            return Err(crate::Error::invalid_resource(format!(
                "spec.cooldownPeriod must be within [0, {MAX_COOLDOWN_SECONDS}]"
            )));
        }
        for trigger in &self.triggers {
            if trigger.type_ != "prometheus" {
                return Err(crate::Error::invalid_resource(format!(
                    "unsupported trigger type: {}",
                    trigger.type_
                )));
            }
        }
        Ok(())
    }

    /// Cooldown with the zero-means-default rule applied
    pub fn cooldown(&self) -> std::time::Duration {
        if self.cooldown_period == 0 {
            DEFAULT_COOLDOWN_PERIOD
        } else {
            std::time::Duration::from_secs(self.cooldown_period as u64)
        }
    }
}

/// Reference to the scalable workload governed by a GovernedService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    /// API version of the target, e.g. `apps/v1` or `argoproj.io/v1alpha1`
    pub api_version: String,
    /// Kind of the target. Canonical singular form is expected; legacy
    /// plural/lowercase spellings are tolerated on input.
    pub kind: String,
    /// Name of the target
    pub name: String,
}

impl ScaleTargetRef {
    /// The target kind in canonical singular form.
    ///
    /// Older resources were written with the plural resource name in the kind
    /// field. Normalization happens on every read; the stored spec is never
    /// rewritten, so callers must not rely on the stored form.
    pub fn canonical_kind(&self) -> String {
        match self.kind.to_lowercase().as_str() {
            "deployment" | "deployments" => "Deployment".to_string(),
            "rollout" | "rollouts" => "Rollout".to_string(),
            _ => self.kind.clone(),
        }
    }

    /// Split `apiVersion` into (group, version). Core resources have an
    /// empty group.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }
}

/// A single trigger: a type tag plus openly-typed metadata interpreted by the
/// matching scaler
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ScaleTrigger {
    /// Trigger type; `prometheus` is the only supported type
    #[serde(rename = "type")]
    pub type_: String,
    /// Scaler-specific configuration
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Autoscaler attached to the same target, paused while the target is held at
/// zero so the two controllers do not fight
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerSpec {
    /// Autoscaler flavor
    #[serde(rename = "type")]
    pub type_: AutoscalerType,
    /// Name of the ScaledObject / HorizontalPodAutoscaler
    pub name: String,
}

/// Supported autoscaler flavors
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AutoscalerType {
    /// Kubernetes HorizontalPodAutoscaler
    Hpa,
    /// KEDA ScaledObject
    Keda,
}

/// Recurring time window during which scale-to-zero decisions may fire
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnabledPeriod {
    /// 5-field cron expression (minute hour dom month dow), UTC
    pub schedule: String,
    /// Window length starting at each cron firing, e.g. `8h`
    pub duration: String,
}

/// Traffic mode of a governed service
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Mode {
    /// Traffic flows to the target's own pods
    #[serde(rename = "serve")]
    Serve,
    /// Traffic is intercepted by the resolver via a shadow endpoint list
    #[serde(rename = "proxy")]
    Proxy,
    /// Mode not yet established
    #[default]
    #[serde(rename = "")]
    Unknown,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serve => write!(f, "serve"),
            Self::Proxy => write!(f, "proxy"),
            Self::Unknown => write!(f, ""),
        }
    }
}

/// Status for a GovernedService, owned by the operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GovernedServiceStatus {
    /// When the resource was last successfully reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled_time: Option<DateTime<Utc>>,

    /// When a scale-up was last attempted. Advanced before the scale call, so
    /// it anchors the cooldown even when the replica change itself fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scaled_up_time: Option<DateTime<Utc>>,

    /// Current traffic mode
    #[serde(default)]
    pub mode: Mode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_spec() -> GovernedServiceSpec {
        GovernedServiceSpec {
            scale_target_ref: ScaleTargetRef {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: "checkout".to_string(),
            },
            service: "checkout-svc".to_string(),
            min_target_replicas: 1,
            cooldown_period: 0,
            triggers: vec![ScaleTrigger {
                type_: "prometheus".to_string(),
                metadata: json!({
                    "serverAddress": "http://prometheus:9090",
                    "query": "sum(rate(http_requests_total[5m]))",
                    "threshold": "0.5",
                }),
            }],
            autoscaler: None,
            enabled_period: None,
        }
    }

    mod validation {
        use super::*;

        #[test]
        fn accepts_well_formed_spec() {
            assert!(sample_spec().validate().is_ok());
        }

        #[test]
        fn rejects_missing_service() {
            let mut spec = sample_spec();
            spec.service = String::new();
            assert!(spec.validate().is_err());
        }

        #[test]
        fn rejects_zero_min_replicas() {
            let mut spec = sample_spec();
            spec.min_target_replicas = 0;
            assert!(spec.validate().is_err());
        }

        #[test]
        fn rejects_cooldown_beyond_one_week() {
            let mut spec = sample_spec();
            spec.cooldown_period = MAX_COOLDOWN_SECONDS + 1;
            assert!(spec.validate().is_err());
        }

        #[test]
        fn rejects_unknown_trigger_type() {
            let mut spec = sample_spec();
            spec.triggers[0].type_ = "kafka".to_string();
            assert!(spec.validate().is_err());
        }
    }

    mod cooldown_resolution {
        use super::*;

        #[test]
        fn zero_uses_system_default() {
            let spec = sample_spec();
            assert_eq!(spec.cooldown(), DEFAULT_COOLDOWN_PERIOD);
        }

        #[test]
        fn explicit_value_wins() {
            let mut spec = sample_spec();
            spec.cooldown_period = 60;
            assert_eq!(spec.cooldown(), std::time::Duration::from_secs(60));
        }
    }

    mod kind_normalization {
        use super::*;

        #[test]
        fn legacy_plural_deployments_becomes_canonical() {
            let target = ScaleTargetRef {
                api_version: "apps/v1".to_string(),
                kind: "deployments".to_string(),
                name: "t".to_string(),
            };
            assert_eq!(target.canonical_kind(), "Deployment");
        }

        #[test]
        fn legacy_plural_rollouts_becomes_canonical() {
            let target = ScaleTargetRef {
                api_version: "argoproj.io/v1alpha1".to_string(),
                kind: "rollouts".to_string(),
                name: "t".to_string(),
            };
            assert_eq!(target.canonical_kind(), "Rollout");
        }

        #[test]
        fn canonical_kind_passes_through() {
            let target = ScaleTargetRef {
                api_version: "apps/v1".to_string(),
                kind: "StatefulSet".to_string(),
                name: "t".to_string(),
            };
            assert_eq!(target.canonical_kind(), "StatefulSet");
        }

        #[test]
        fn group_version_splits_grouped_and_core() {
            let grouped = ScaleTargetRef {
                api_version: "apps/v1".to_string(),
                ..Default::default()
            };
            assert_eq!(grouped.group_version(), ("apps", "v1"));

            let core = ScaleTargetRef {
                api_version: "v1".to_string(),
                ..Default::default()
            };
            assert_eq!(core.group_version(), ("", "v1"));
        }
    }

    mod mode_serialization {
        use super::*;

        #[test]
        fn modes_round_trip_through_their_wire_form() {
            assert_eq!(serde_json::to_string(&Mode::Serve).unwrap(), "\"serve\"");
            assert_eq!(serde_json::to_string(&Mode::Proxy).unwrap(), "\"proxy\"");
            assert_eq!(serde_json::to_string(&Mode::Unknown).unwrap(), "\"\"");

            let parsed: Mode = serde_json::from_str("\"proxy\"").unwrap();
            assert_eq!(parsed, Mode::Proxy);
        }

        #[test]
        fn status_defaults_to_unknown_mode() {
            let status: GovernedServiceStatus = serde_json::from_str("{}").unwrap();
            assert_eq!(status.mode, Mode::Unknown);
        }
    }
}

//! Bench Custom Resource Definition
//!
//! A Bench is one platform installation: the web tier, background workers,
//! scheduler, cache/queue backing services, and a shared sites volume. Sites
//! attach to exactly one Bench and cannot outlive it.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    is_safe_app_name, AppSpec, ComponentReplicas, Condition, FpmRepository, ImageSpec, Phase,
    PodConfig, SecurityContextConfig, StorageSpec, WorkerConfigs, WorkerScalingStatus,
};

/// Specification for a Bench
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "benchops.dev",
    version = "v1alpha1",
    kind = "Bench",
    plural = "benches",
    shortname = "bn",
    status = "BenchStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BenchSpec {
    /// Platform version identifier (e.g., "v15"); used for image tag fallback
    pub version: String,

    /// Explicit image selection; wins over operator defaults when complete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageSpec>,

    /// Applications to install on this bench
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apps: Vec<AppSpec>,

    /// Static replica overrides for web/proxy/realtime/scheduler components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<ComponentReplicas>,

    /// Per-worker-type autoscaling configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<WorkerConfigs>,

    /// Security context override, merged field-by-field over operator defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContextConfig>,

    /// Shared sites volume configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Package-registry repositories appended after operator-level entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fpm_repositories: Vec<FpmRepository>,

    /// Enable version-control app sources; falls back to operator settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_enabled: Option<bool>,

    /// Scheduling tweaks applied to every generated pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_config: Option<PodConfig>,

    /// Raises the cluster-wide Site reconcile concurrency ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_reconcile_concurrency: Option<u32>,
}

impl BenchSpec {
    /// Validate the bench specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.version.trim().is_empty() {
            return Err(crate::Error::configuration("bench version must not be empty"));
        }

        for app in &self.apps {
            if !is_safe_app_name(&app.name) {
                return Err(crate::Error::configuration(format!(
                    "app name '{}' contains characters outside [A-Za-z0-9_-]",
                    app.name
                )));
            }
            if app.source == super::types::AppSource::Git && app.url.is_none() {
                return Err(crate::Error::configuration(format!(
                    "app '{}' has source 'git' but no url",
                    app.name
                )));
            }
        }

        Ok(())
    }
}

/// Status for a Bench
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BenchStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: Phase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the bench state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Apps installed on the bench, as reported by initialization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub installed_apps: Vec<String>,

    /// Names of merged package repositories (operator entries first)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fpm_repositories: Vec<String>,

    /// Per-worker scaling summary keyed by worker type
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub worker_scaling: BTreeMap<String, WorkerScalingStatus>,

    /// Generation of the spec this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl BenchStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: Phase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition, replacing any existing condition of the same type
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Set the installed app list and return self for chaining
    pub fn installed_apps(mut self, apps: Vec<String>) -> Self {
        self.installed_apps = apps;
        self
    }

    /// Set the merged repository names and return self for chaining
    pub fn fpm_repositories(mut self, names: Vec<String>) -> Self {
        self.fpm_repositories = names;
        self
    }

    /// Set the worker scaling summary and return self for chaining
    pub fn worker_scaling(mut self, scaling: BTreeMap<String, WorkerScalingStatus>) -> Self {
        self.worker_scaling = scaling;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::{AppSource, ConditionStatus, ScalingMode};

    fn sample_spec() -> BenchSpec {
        BenchSpec {
            version: "v15".to_string(),
            image: None,
            apps: vec![AppSpec {
                name: "erpnext".to_string(),
                source: AppSource::Image,
                url: None,
                branch: None,
            }],
            replicas: None,
            workers: None,
            security_context: None,
            storage: None,
            fpm_repositories: vec![],
            git_enabled: None,
            pod_config: None,
            site_reconcile_concurrency: None,
        }
    }

    // =========================================================================
    // Spec Validation Stories
    // =========================================================================

    /// Story: a minimal spec with a version and one baked-in app is valid
    #[test]
    fn story_minimal_spec_is_valid() {
        assert!(sample_spec().validate().is_ok());
    }

    /// Story: the version string anchors image fallback, so it cannot be empty
    #[test]
    fn story_empty_version_is_rejected() {
        let mut spec = sample_spec();
        spec.version = "  ".to_string();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    /// Story: app names that could break out of generated scripts are rejected
    /// at validation, before any job is created
    #[test]
    fn story_unsafe_app_names_are_rejected() {
        let mut spec = sample_spec();
        spec.apps.push(AppSpec {
            name: "evil; curl attacker".to_string(),
            source: AppSource::Fpm,
            url: None,
            branch: None,
        });
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("characters outside"));
    }

    /// Story: a git-sourced app without a URL cannot be fetched
    #[test]
    fn story_git_app_requires_url() {
        let mut spec = sample_spec();
        spec.apps.push(AppSpec {
            name: "custom_app".to_string(),
            source: AppSource::Git,
            url: None,
            branch: Some("main".to_string()),
        });
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("no url"));
    }

    // =========================================================================
    // Status Builder Stories
    // =========================================================================

    /// Story: conditions of the same type replace each other rather than
    /// accumulating, so status never carries two Ready conditions
    #[test]
    fn story_conditions_replace_same_type() {
        let status = BenchStatus::with_phase(Phase::Provisioning)
            .condition(Condition::new(
                "Ready",
                ConditionStatus::False,
                "InitJobRunning",
                "waiting for init job",
            ))
            .condition(Condition::new(
                "Ready",
                ConditionStatus::True,
                "AllReady",
                "bench is ready",
            ));

        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, ConditionStatus::True);
        assert_eq!(status.conditions[0].reason, "AllReady");
    }

    /// Story: distinct condition types coexist
    #[test]
    fn story_distinct_condition_types_coexist() {
        let status = BenchStatus::default()
            .condition(Condition::new(
                "Initialized",
                ConditionStatus::True,
                "InitJobSucceeded",
                "init complete",
            ))
            .condition(Condition::new(
                "Progressing",
                ConditionStatus::True,
                "Reconciling",
                "creating workloads",
            ));
        assert_eq!(status.conditions.len(), 2);
    }

    /// Story: the worker scaling summary round-trips through the status builder
    #[test]
    fn story_worker_scaling_summary() {
        let mut scaling = BTreeMap::new();
        scaling.insert(
            "default".to_string(),
            WorkerScalingStatus {
                mode: ScalingMode::Autoscaled,
                current_replicas: Some(2),
                desired_replicas: None,
                externally_managed: true,
            },
        );

        let status = BenchStatus::with_phase(Phase::Ready)
            .worker_scaling(scaling)
            .observed_generation(Some(3));

        assert!(status.worker_scaling["default"].externally_managed);
        assert_eq!(status.observed_generation, Some(3));
    }

    // =========================================================================
    // Serde Stories
    // =========================================================================

    /// Story: a Bench manifest written by hand in YAML deserializes with
    /// camelCase field names and survives a round trip
    #[test]
    fn story_yaml_round_trip() {
        let yaml = r#"
apiVersion: benchops.dev/v1alpha1
kind: Bench
metadata:
  name: main
spec:
  version: v15
  gitEnabled: true
  apps:
    - name: erpnext
      source: image
  workers:
    long:
      enabled: true
      maxReplicas: 4
  storage:
    size: 10Gi
"#;
        let bench: Bench = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(bench.spec.version, "v15");
        assert_eq!(bench.spec.git_enabled, Some(true));
        assert_eq!(
            bench
                .spec
                .workers
                .as_ref()
                .and_then(|w| w.long.as_ref())
                .and_then(|l| l.max_replicas),
            Some(4)
        );

        let out = serde_yaml::to_string(&bench).unwrap();
        let again: Bench = serde_yaml::from_str(&out).unwrap();
        assert_eq!(again.spec, bench.spec);
    }
}

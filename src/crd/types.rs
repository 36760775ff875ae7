//! Supporting types shared by the Bench and Site CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase shared by Bench and Site resources
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Phase {
    /// Resource accepted but reconciliation has not progressed yet
    #[default]
    Pending,
    /// Child resources are being created or updated
    Provisioning,
    /// All child resources are ready
    Ready,
    /// A non-retryable error requires a spec change
    Failed,
    /// Deletion is in progress, finalizer cleanup running
    Terminating,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, Initialized, DependentSitesExist)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,

    /// Generation of the spec this condition was computed from
    #[serde(
        rename = "observedGeneration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
            observed_generation: None,
        }
    }

    /// Attach the observed spec generation and return self for chaining
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LocalObjectReference {
    /// Name of the referenced object
    pub name: String,
}

/// Where an application is sourced from
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppSource {
    /// Installed from a package registry
    #[default]
    Fpm,
    /// Installed from a version-control URL
    Git,
    /// Already baked into the runtime image
    Image,
}

impl std::fmt::Display for AppSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fpm => write!(f, "fpm"),
            Self::Git => write!(f, "git"),
            Self::Image => write!(f, "image"),
        }
    }
}

/// One application requested on a Bench
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    /// Application name as known to the platform
    pub name: String,

    /// Source kind for the application
    #[serde(default)]
    pub source: AppSource,

    /// Repository or registry URL, required for git sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Branch to check out for git sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// App names are interpolated into generated initialization scripts, so they
/// are restricted to a safe character set.
pub fn is_safe_app_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Container image selection for a Bench
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Image repository (e.g., docker.io/frappe/erpnext)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    /// Image tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Static replica overrides for the non-worker components
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentReplicas {
    /// Web application server replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gunicorn: Option<i32>,

    /// Reverse proxy replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nginx: Option<i32>,

    /// Realtime transport replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socketio: Option<i32>,

    /// Scheduler replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<i32>,
}

/// The three background worker classes, one per queue
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    /// General-purpose queue
    Default,
    /// Long-running jobs
    Long,
    /// Short, latency-sensitive jobs
    Short,
}

impl WorkerType {
    /// All worker types in their reconcile order
    pub fn all() -> [WorkerType; 3] {
        [WorkerType::Default, WorkerType::Long, WorkerType::Short]
    }

    /// Queue name consumed by the worker process
    pub fn queue(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Long => "long",
            Self::Short => "short",
        }
    }
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.queue())
    }
}

/// Autoscaling configuration for one worker class.
///
/// All fields are optional; unset fields fall through the priority chain to
/// operator defaults and then hardcoded per-worker defaults.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerAutoscaling {
    /// Whether queue-driven autoscaling is requested for this worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Lower replica bound while autoscaled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Upper replica bound while autoscaled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,

    /// Queue depth that triggers scaling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_length: Option<i64>,

    /// Seconds between queue polls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_interval: Option<i64>,

    /// Seconds to wait before scaling back down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_period: Option<i64>,

    /// Replica count used when autoscaling is disabled or unavailable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_replicas: Option<i32>,
}

/// Per-worker autoscaling overrides on a Bench
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfigs {
    /// Overrides for the default queue worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<WorkerAutoscaling>,

    /// Overrides for the long queue worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long: Option<WorkerAutoscaling>,

    /// Overrides for the short queue worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short: Option<WorkerAutoscaling>,
}

impl WorkerConfigs {
    /// Overrides for the given worker type, if any
    pub fn for_worker(&self, worker: WorkerType) -> Option<&WorkerAutoscaling> {
        match worker {
            WorkerType::Default => self.default.as_ref(),
            WorkerType::Long => self.long.as_ref(),
            WorkerType::Short => self.short.as_ref(),
        }
    }
}

/// Security context override, merged field-by-field over operator defaults
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContextConfig {
    /// UID the containers run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,

    /// GID the containers run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<i64>,

    /// Filesystem group for mounted volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_group: Option<i64>,
}

/// Persistent storage configuration for the shared sites volume
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Requested size (e.g., "10Gi"); immutable after first creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Storage class; cluster default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// One package-registry repository entry
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FpmRepository {
    /// Repository name
    pub name: String,

    /// Repository URL
    pub url: String,

    /// Resolution priority; later entries shadow earlier ones at consumption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Secret holding credentials for the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret_ref: Option<LocalObjectReference>,
}

/// Pod scheduling tweaks applied to every generated workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodConfig {
    /// Node selector applied to all pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Tolerations applied to all pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    /// Extra labels merged into every generated pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_labels: Option<BTreeMap<String, String>>,
}

/// Pod toleration, mirroring the core/v1 shape the schema needs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    /// Taint key; empty matches all keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Exists or Equal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,

    /// Taint value when the operator is Equal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// NoSchedule, PreferNoSchedule, or NoExecute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
}

/// Database deployment mode for a Site
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseMode {
    /// Reuse a namespace-shared database instance
    #[default]
    Shared,
    /// Provision a private instance for this Site
    Dedicated,
    /// Connect to an externally managed database
    External,
}

impl std::fmt::Display for DatabaseMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Dedicated => write!(f, "dedicated"),
            Self::External => write!(f, "external"),
        }
    }
}

/// Database configuration for a Site
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Provider kind (mariadb, postgres, sqlite, external); selection falls
    /// back to heuristics when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Deployment mode
    #[serde(default)]
    pub mode: DatabaseMode,

    /// Database host, used by the external provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Database port, used by the external provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    /// Secret carrying external connection details and credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_secret_ref: Option<LocalObjectReference>,

    /// Explicit backing database cluster for shared/dedicated modes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_cluster_ref: Option<LocalObjectReference>,
}

/// How a worker's replica count is controlled
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMode {
    /// The operator sets replicas directly from the resolved static value
    #[default]
    Static,
    /// An external autoscaler owns the replica count
    Autoscaled,
}

impl std::fmt::Display for ScalingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static => write!(f, "static"),
            Self::Autoscaled => write!(f, "autoscaled"),
        }
    }
}

/// Per-worker scaling summary persisted in Bench status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerScalingStatus {
    /// Resolved scaling mode
    #[serde(default)]
    pub mode: ScalingMode,

    /// Replicas currently observed on the deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_replicas: Option<i32>,

    /// Replicas the controlling party wants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_replicas: Option<i32>,

    /// True when an external autoscaler owns the replica count
    #[serde(default)]
    pub externally_managed: bool,
}

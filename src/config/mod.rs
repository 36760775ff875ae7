//! Operator settings snapshot and priority-chain resolvers
//!
//! Effective configuration is computed per reconciliation pass from a
//! three-level chain: per-resource override, then operator-wide settings,
//! then hardcoded defaults. The operator settings come from an optional
//! ConfigMap that is read fresh each pass into an immutable
//! [`OperatorSettings`] snapshot; its absence is never an error.
//!
//! Resolution is field-by-field, not object-by-object: a Bench may override
//! only `runAsUser` and still inherit `runAsGroup` and `fsGroup` from the
//! next tier.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use tracing::{debug, warn};

use crate::crd::{
    Bench, FpmRepository, WorkerAutoscaling, WorkerType,
};
use crate::{Result, DEFAULT_IMAGE_REPOSITORY, OPERATOR_CONFIGMAP};

/// Read-only snapshot of the operator-wide settings ConfigMap.
///
/// Injected into each reconciliation pass; never cached across passes.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorSettings {
    /// Whether version-control app sources are allowed
    pub git_enabled: bool,
    /// Operator-level package repositories, merged before resource entries
    pub fpm_repositories: Vec<FpmRepository>,
    /// Default image (optionally with a tag to substitute per bench version)
    pub default_image: Option<String>,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            git_enabled: true,
            fpm_repositories: Vec::new(),
            default_image: None,
        }
    }
}

impl OperatorSettings {
    /// Parse settings from ConfigMap data.
    ///
    /// Unparseable values degrade to defaults with a warning; a missing or
    /// malformed settings object must never fail a reconciliation.
    pub fn from_config_map(cm: &ConfigMap) -> Self {
        let mut settings = Self::default();
        let Some(data) = &cm.data else {
            return settings;
        };

        if let Some(raw) = data.get("gitEnabled") {
            match raw.parse::<bool>() {
                Ok(v) => settings.git_enabled = v,
                Err(_) => warn!(value = %raw, "ignoring unparseable gitEnabled in operator settings"),
            }
        }

        if let Some(raw) = data.get("fpmRepositories") {
            match serde_json::from_str::<Vec<FpmRepository>>(raw) {
                Ok(repos) => settings.fpm_repositories = repos,
                Err(e) => {
                    warn!(error = %e, "ignoring unparseable fpmRepositories in operator settings")
                }
            }
        }

        if let Some(image) = data.get("defaultImage") {
            if !image.trim().is_empty() {
                settings.default_image = Some(image.trim().to_string());
            }
        }

        settings
    }

    /// Fetch the settings ConfigMap and parse it; absence yields defaults.
    pub async fn load(client: Client, namespace: &str) -> Result<Self> {
        let api: Api<ConfigMap> = Api::namespaced(client, namespace);
        match api.get_opt(OPERATOR_CONFIGMAP).await? {
            Some(cm) => Ok(Self::from_config_map(&cm)),
            None => {
                debug!(
                    configmap = OPERATOR_CONFIGMAP,
                    "operator settings not found, using defaults"
                );
                Ok(Self::default())
            }
        }
    }
}

// =============================================================================
// Security context resolution
// =============================================================================

/// Operator-wide security defaults, overridable via environment variables
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecurityDefaults {
    /// Default UID for containers
    pub run_as_user: i64,
    /// Default GID for containers
    pub run_as_group: i64,
    /// Default filesystem group for mounted volumes
    pub fs_group: i64,
}

impl Default for SecurityDefaults {
    fn default() -> Self {
        Self {
            run_as_user: 1000,
            run_as_group: 1000,
            fs_group: 1000,
        }
    }
}

impl SecurityDefaults {
    /// Build defaults from `DEFAULT_UID`, `DEFAULT_GID`, and `DEFAULT_FSGROUP`
    /// environment variables, falling back to hardcoded values.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build defaults through an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str, fallback: i64| {
            lookup(key)
                .and_then(|v| match v.parse::<i64>() {
                    Ok(n) => Some(n),
                    Err(_) => {
                        warn!(var = key, value = %v, "ignoring unparseable security default");
                        None
                    }
                })
                .unwrap_or(fallback)
        };
        let fallback = Self::default();
        Self {
            run_as_user: parse("DEFAULT_UID", fallback.run_as_user),
            run_as_group: parse("DEFAULT_GID", fallback.run_as_group),
            fs_group: parse("DEFAULT_FSGROUP", fallback.fs_group),
        }
    }
}

/// Fully resolved security context applied to generated pods
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedSecurityContext {
    /// UID the containers run as
    pub run_as_user: i64,
    /// GID the containers run as
    pub run_as_group: i64,
    /// Filesystem group for mounted volumes
    pub fs_group: i64,
}

/// Resolve the effective security context for a bench, field-by-field.
pub fn resolve_security_context(
    bench: &Bench,
    defaults: &SecurityDefaults,
) -> ResolvedSecurityContext {
    let override_ = bench.spec.security_context.as_ref();
    ResolvedSecurityContext {
        run_as_user: override_
            .and_then(|s| s.run_as_user)
            .unwrap_or(defaults.run_as_user),
        run_as_group: override_
            .and_then(|s| s.run_as_group)
            .unwrap_or(defaults.run_as_group),
        fs_group: override_
            .and_then(|s| s.fs_group)
            .unwrap_or(defaults.fs_group),
    }
}

// =============================================================================
// Image resolution
// =============================================================================

/// Resolve the container image for a bench.
///
/// Priority: explicit spec repository+tag, then the operator default image
/// (with its tag substituted by the bench version when the image string has
/// exactly one colon-delimited tag segment), then the hardcoded repository
/// tagged with the bench version.
pub fn resolve_image(bench: &Bench, settings: &OperatorSettings) -> String {
    if let Some(image) = &bench.spec.image {
        if let (Some(repo), Some(tag)) = (&image.repository, &image.tag) {
            if !repo.is_empty() && !tag.is_empty() {
                return format!("{repo}:{tag}");
            }
        }
    }

    if let Some(default_image) = &settings.default_image {
        if default_image.matches(':').count() == 1 {
            let base = default_image
                .split(':')
                .next()
                .unwrap_or(default_image.as_str());
            return format!("{}:{}", base, bench.spec.version);
        }
        // No single tag segment to substitute (bare repo or registry with
        // port); use the configured image untouched.
        return default_image.clone();
    }

    format!("{}:{}", DEFAULT_IMAGE_REPOSITORY, bench.spec.version)
}

// =============================================================================
// Git enablement and repository merge
// =============================================================================

/// Whether git app sources are enabled for this bench
pub fn git_enabled(bench: &Bench, settings: &OperatorSettings) -> bool {
    bench.spec.git_enabled.unwrap_or(settings.git_enabled)
}

/// Merge package repositories: operator entries first, resource entries
/// appended. No de-duplication: later entries legitimately shadow earlier
/// ones when the list is consumed.
pub fn merge_fpm_repositories(bench: &Bench, settings: &OperatorSettings) -> Vec<FpmRepository> {
    let mut merged = settings.fpm_repositories.clone();
    merged.extend(bench.spec.fpm_repositories.iter().cloned());
    merged
}

// =============================================================================
// Worker autoscaling resolution
// =============================================================================

/// Fully resolved autoscaling parameters for one worker class
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedWorkerAutoscaling {
    /// Whether autoscaling is requested
    pub enabled: bool,
    /// Lower replica bound while autoscaled
    pub min_replicas: i32,
    /// Upper replica bound while autoscaled
    pub max_replicas: i32,
    /// Queue depth that triggers scaling
    pub queue_length: i64,
    /// Seconds between queue polls
    pub polling_interval: i64,
    /// Seconds to wait before scaling back down
    pub cooldown_period: i64,
    /// Replica count used in static mode
    pub static_replicas: i32,
}

fn worker_defaults(worker: WorkerType) -> ResolvedWorkerAutoscaling {
    // Long jobs scale conservatively; short jobs tolerate deeper queues.
    let (max_replicas, queue_length) = match worker {
        WorkerType::Default => (10, 5),
        WorkerType::Long => (5, 3),
        WorkerType::Short => (10, 10),
    };
    ResolvedWorkerAutoscaling {
        enabled: false,
        min_replicas: 1,
        max_replicas,
        queue_length,
        polling_interval: 30,
        cooldown_period: 300,
        static_replicas: 1,
    }
}

/// Resolve the effective autoscaling config for one worker class,
/// field-by-field over the hardcoded per-worker defaults.
pub fn resolve_worker_autoscaling(bench: &Bench, worker: WorkerType) -> ResolvedWorkerAutoscaling {
    let defaults = worker_defaults(worker);
    let override_: Option<&WorkerAutoscaling> = bench
        .spec
        .workers
        .as_ref()
        .and_then(|w| w.for_worker(worker));

    let Some(o) = override_ else {
        return defaults;
    };

    ResolvedWorkerAutoscaling {
        enabled: o.enabled.unwrap_or(defaults.enabled),
        min_replicas: o.min_replicas.unwrap_or(defaults.min_replicas),
        max_replicas: o.max_replicas.unwrap_or(defaults.max_replicas),
        queue_length: o.queue_length.unwrap_or(defaults.queue_length),
        polling_interval: o.polling_interval.unwrap_or(defaults.polling_interval),
        cooldown_period: o.cooldown_period.unwrap_or(defaults.cooldown_period),
        static_replicas: o.static_replicas.unwrap_or(defaults.static_replicas),
    }
}

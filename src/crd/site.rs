//! Site Custom Resource Definition
//!
//! A Site is one tenant: a database, a credentials Secret, and site-specific
//! configuration, attached to exactly one Bench in the same namespace.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    is_safe_app_name, Condition, DatabaseConfig, LocalObjectReference, Phase,
};

/// Specification for a Site
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "benchops.dev",
    version = "v1alpha1",
    kind = "Site",
    plural = "sites",
    shortname = "st",
    status = "SiteStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Bench","type":"string","jsonPath":".spec.benchRef"}"#,
    printcolumn = r#"{"name":"DBReady","type":"boolean","jsonPath":".status.databaseReady"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SiteSpec {
    /// Site name; also the external hostname candidate
    pub site_name: String,

    /// Name of the Bench this site runs on (same namespace)
    pub bench_ref: String,

    /// Database provisioning configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_config: Option<DatabaseConfig>,

    /// Subset of the bench's apps to install on this site
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apps: Vec<String>,

    /// Secret holding the admin password; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password_secret_ref: Option<LocalObjectReference>,

    /// Explicit serving domain; derived from the site name when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl SiteSpec {
    /// Validate the site specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.site_name.trim().is_empty() {
            return Err(crate::Error::configuration("siteName must not be empty"));
        }
        if self.bench_ref.trim().is_empty() {
            return Err(crate::Error::configuration("benchRef must not be empty"));
        }
        for app in &self.apps {
            if !is_safe_app_name(app) {
                return Err(crate::Error::configuration(format!(
                    "app name '{app}' contains characters outside [A-Za-z0-9_-]"
                )));
            }
        }
        Ok(())
    }

    /// Resolve the serving domain for this site.
    ///
    /// An explicit `domain` wins; a dotted site name is taken as a hostname;
    /// otherwise a cluster-internal name is derived from the namespace.
    pub fn resolved_domain(&self, namespace: &str) -> String {
        if let Some(domain) = &self.domain {
            return domain.clone();
        }
        if self.site_name.contains('.') {
            return self.site_name.clone();
        }
        format!("{}.{}.svc", self.site_name, namespace)
    }

    /// Database configuration, defaulted when the spec omits it entirely
    pub fn database_config(&self) -> DatabaseConfig {
        self.db_config.clone().unwrap_or_default()
    }
}

/// Status for a Site
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SiteStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: Phase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the site state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Apps successfully installed on the site
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub installed_apps: Vec<String>,

    /// Requested apps skipped because the bench image does not carry them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_apps: Vec<String>,

    /// True once the database provider reports the backing database ready
    #[serde(default)]
    pub database_ready: bool,

    /// Generation of the spec this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl SiteStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: Phase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
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

    /// Set database readiness and return self for chaining
    pub fn database_ready(mut self, ready: bool) -> Self {
        self.database_ready = ready;
        self
    }

    /// Set the installed app list and return self for chaining
    pub fn installed_apps(mut self, apps: Vec<String>) -> Self {
        self.installed_apps = apps;
        self
    }

    /// Set the skipped app list and return self for chaining
    pub fn skipped_apps(mut self, apps: Vec<String>) -> Self {
        self.skipped_apps = apps;
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

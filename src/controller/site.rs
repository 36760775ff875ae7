//! Site controller implementation
//!
//! Reconciles a tenant Site: waits for its Bench, drives database
//! provisioning through the provider layer (behind a circuit breaker),
//! synthesizes the credentials Secret, and runs the one-shot site
//! initialization Job. Deletion cleans up the database before releasing the
//! finalizer.
//!
//! Credentials never enter generated pod environments; the init job reads
//! them from the Secret mounted at [`CREDENTIALS_MOUNT_PATH`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::circuit::{BreakerRegistry, CircuitBreakerConfig};
use crate::config::{self, OperatorSettings, SecurityDefaults};
use crate::crd::{
    Bench, Condition, ConditionStatus, Phase, Site, SiteStatus,
};
use crate::database::{
    self, CircuitBreakerProvider, DatabaseInfo, DatabaseProvider, KubeResourceStore, ProviderKind,
    ResourceStore,
};
use crate::resources::{
    self, site_credentials_secret, site_init_job, ContainerSpec, PodSettings, SiteCredentials,
};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result, CREDENTIALS_MOUNT_PATH, FIELD_MANAGER, SITE_FINALIZER};

/// Requeue delay while waiting on the bench, the database, or the init job
const REQUEUE_PENDING: Duration = Duration::from_secs(10);
/// Requeue delay after a circuit rejection; long enough for the breaker to
/// reach its half-open probe window
const REQUEUE_CIRCUIT_OPEN: Duration = Duration::from_secs(30);
/// Requeue delay for a settled, Ready site
const REQUEUE_READY: Duration = Duration::from_secs(300);
/// Backoff applied by the error policy
const REQUEUE_ERROR: Duration = Duration::from_secs(5);

/// TTL applied to finished init jobs
const INIT_JOB_TTL_SECONDS: i32 = 3_600;

/// Length of generated admin passwords
const ADMIN_PASSWORD_LENGTH: usize = 24;

/// Secret key carrying the admin password, both in referenced secrets and in
/// the synthesized credentials Secret
const ADMIN_PASSWORD_KEY: &str = "admin-password";

/// Trait abstracting Kubernetes operations for the Site controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SiteApi: Send + Sync {
    /// Patch the status subresource of a Site
    async fn patch_status(&self, namespace: &str, name: &str, status: &SiteStatus) -> Result<()>;

    /// Replace the finalizer list on a Site
    async fn replace_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()>;

    /// Fetch a Bench, None when absent
    async fn get_bench(&self, namespace: &str, name: &str) -> Result<Option<Bench>>;

    /// Fetch a Secret, None when absent
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Server-side apply a Secret
    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;

    /// Fetch a Job, None when absent
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    /// Create a Job; already-exists is success
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<()>;

    /// Snapshot of the operator-level settings ConfigMap
    async fn operator_settings(&self, namespace: &str) -> Result<OperatorSettings>;
}

/// Real [`SiteApi`] backed by a Kubernetes client
pub struct KubeSiteApi {
    client: Client,
}

impl KubeSiteApi {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn ignore_already_exists(err: kube::Error) -> Result<()> {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => Ok(()),
            other => Err(other.into()),
        }
    }
}

#[async_trait]
impl SiteApi for KubeSiteApi {
    async fn patch_status(&self, namespace: &str, name: &str, status: &SiteStatus) -> Result<()> {
        let api: Api<Site> = Api::namespaced(self.client.clone(), namespace);
        let patch = Patch::Merge(serde_json::json!({ "status": status }));
        let params = PatchParams::apply(FIELD_MANAGER);
        retry_with_backoff(&RetryConfig::with_max_attempts(3), "patch_site_status", || {
            api.patch_status(name, &params, &patch)
        })
        .await?;
        Ok(())
    }

    async fn replace_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()> {
        let api: Api<Site> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_bench(&self, namespace: &str, name: &str) -> Result<Option<Bench>> {
        let api: Api<Bench> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::configuration("secret is missing metadata.name"))?;
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(secret),
        )
        .await?;
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&Default::default(), job).await {
            Ok(_) => Ok(()),
            Err(e) => Self::ignore_already_exists(e),
        }
    }

    async fn operator_settings(&self, namespace: &str) -> Result<OperatorSettings> {
        OperatorSettings::load(self.client.clone(), namespace).await
    }
}

/// Shared state for the Site controller
pub struct SiteContext {
    /// Cluster operations (trait object for testability)
    pub api: Arc<dyn SiteApi>,
    /// Backing store used by database providers
    pub store: Arc<dyn ResourceStore>,
    /// One breaker per provider kind, shared across reconciliations
    pub breakers: Arc<BreakerRegistry>,
    /// Environment-derived security defaults, read once at startup
    pub security: SecurityDefaults,
    #[cfg(test)]
    provider_override: Option<Arc<dyn DatabaseProvider>>,
}

impl SiteContext {
    /// Context over a real Kubernetes client
    pub fn new(client: Client) -> Self {
        Self {
            api: Arc::new(KubeSiteApi::new(client.clone())),
            store: Arc::new(KubeResourceStore::new(client)),
            breakers: Arc::new(BreakerRegistry::new()),
            security: SecurityDefaults::from_env(),
            #[cfg(test)]
            provider_override: None,
        }
    }

    /// Context over a mocked api and database provider, for unit tests
    #[cfg(test)]
    pub fn for_testing(api: Arc<dyn SiteApi>, provider: Arc<dyn DatabaseProvider>) -> Self {
        Self {
            api,
            store: Arc::new(database::MockResourceStore::new()),
            breakers: Arc::new(BreakerRegistry::new()),
            security: SecurityDefaults::default(),
            provider_override: Some(provider),
        }
    }

    /// Provider for the selected kind, wrapped in the kind's shared breaker
    fn provider(&self, kind: ProviderKind) -> Arc<dyn DatabaseProvider> {
        #[cfg(test)]
        if let Some(provider) = &self.provider_override {
            return provider.clone();
        }
        let inner = database::build_provider(kind, self.store.clone());
        let breaker = self
            .breakers
            .get_or_create(&kind.to_string(), CircuitBreakerConfig::default());
        Arc::new(CircuitBreakerProvider::new(inner, breaker))
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a Site resource
#[instrument(skip(site, ctx), fields(site = %site.name_any()))]
pub async fn reconcile_site(site: Arc<Site>, ctx: Arc<SiteContext>) -> Result<Action> {
    let name = site.name_any();
    let namespace = site
        .namespace()
        .ok_or_else(|| Error::configuration("site is missing metadata.namespace"))?;

    if site.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&site, &name, &namespace, &ctx).await;
    }

    // Attach the finalizer before provisioning anything we must clean up
    if !site.finalizers().iter().any(|f| f == SITE_FINALIZER) {
        debug!("attaching finalizer");
        let mut finalizers: Vec<String> = site.finalizers().to_vec();
        finalizers.push(SITE_FINALIZER.to_string());
        ctx.api
            .replace_finalizers(&namespace, &name, &finalizers)
            .await?;
    }

    if let Err(e) = site.spec.validate() {
        warn!(error = %e, "site validation failed");
        return fail_terminal(&namespace, &name, &site, &ctx, "ValidationFailed", &e).await;
    }

    // The site cannot progress past Pending until its bench is Ready
    let bench = match ctx.api.get_bench(&namespace, &site.spec.bench_ref).await? {
        Some(bench) => bench,
        None => {
            info!(bench = %site.spec.bench_ref, "referenced bench does not exist");
            let status = SiteStatus::with_phase(Phase::Pending)
                .message(format!("bench '{}' not found", site.spec.bench_ref))
                .condition(Condition::new(
                    "BenchReady",
                    ConditionStatus::False,
                    "BenchNotFound",
                    format!("bench '{}' does not exist in this namespace", site.spec.bench_ref),
                ))
                .observed_generation(site.metadata.generation);
            ctx.api.patch_status(&namespace, &name, &status).await?;
            return Ok(Action::requeue(REQUEUE_PENDING));
        }
    };
    let bench_ready = bench
        .status
        .as_ref()
        .map(|s| s.phase == Phase::Ready)
        .unwrap_or(false);
    if !bench_ready {
        debug!(bench = %site.spec.bench_ref, "waiting for bench to become ready");
        let status = SiteStatus::with_phase(Phase::Pending)
            .message(format!("waiting for bench '{}'", site.spec.bench_ref))
            .condition(Condition::new(
                "BenchReady",
                ConditionStatus::False,
                "BenchNotReady",
                format!("bench '{}' is not Ready yet", site.spec.bench_ref),
            ))
            .observed_generation(site.metadata.generation);
        ctx.api.patch_status(&namespace, &name, &status).await?;
        return Ok(Action::requeue(REQUEUE_PENDING));
    }

    let db_config = site.spec.database_config();
    let kind = match database::select_provider_kind(&db_config) {
        Ok(kind) => kind,
        Err(e) => return fail_terminal(&namespace, &name, &site, &ctx, "UnknownProvider", &e).await,
    };
    let provider = ctx.provider(kind);

    let info = match provider.ensure_database(&site).await {
        Ok(info) => info,
        Err(e) if e.is_circuit_rejection() => {
            warn!(provider = %kind, "database provider circuit is open");
            let status = SiteStatus::with_phase(Phase::Pending)
                .message(format!("database provider '{kind}' is failing, backing off"))
                .condition(Condition::new(
                    "DatabaseReady",
                    ConditionStatus::False,
                    "CircuitOpen",
                    e.to_string(),
                ))
                .observed_generation(site.metadata.generation);
            ctx.api.patch_status(&namespace, &name, &status).await?;
            return Ok(Action::requeue(REQUEUE_CIRCUIT_OPEN));
        }
        // Shared mode without a provisioned instance is an administrator
        // precondition, not a spec defect: wait rather than fail
        Err(Error::Configuration(msg)) if msg.contains("shared") => {
            info!("waiting for an administrator-provisioned shared database");
            let status = SiteStatus::with_phase(Phase::Pending)
                .message(msg.clone())
                .condition(Condition::new(
                    "DatabaseReady",
                    ConditionStatus::False,
                    "WaitingForDatabase",
                    msg,
                ))
                .observed_generation(site.metadata.generation);
            ctx.api.patch_status(&namespace, &name, &status).await?;
            return Ok(Action::requeue(REQUEUE_CIRCUIT_OPEN));
        }
        Err(e) if e.is_terminal() => {
            return fail_terminal(&namespace, &name, &site, &ctx, "DatabaseConfigInvalid", &e).await
        }
        Err(e) => return Err(e),
    };

    if !provider.is_ready(&site).await? {
        debug!(provider = %kind, "database is not ready yet");
        let status = SiteStatus::with_phase(Phase::Provisioning)
            .message("waiting for the database to become ready")
            .database_ready(false)
            .condition(Condition::new(
                "DatabaseReady",
                ConditionStatus::False,
                "Provisioning",
                "database provisioning in progress",
            ))
            .observed_generation(site.metadata.generation);
        ctx.api.patch_status(&namespace, &name, &status).await?;
        return Ok(Action::requeue(REQUEUE_PENDING));
    }

    let credentials = provider.get_credentials(&site).await?;
    let admin_password = resolve_admin_password(&site, &namespace, ctx.as_ref()).await?;
    let admin_password = match admin_password {
        Some(password) => password,
        None => {
            // Referenced admin password secret is not there yet
            let status = SiteStatus::with_phase(Phase::Pending)
                .message("waiting for the referenced admin password secret")
                .observed_generation(site.metadata.generation);
            ctx.api.patch_status(&namespace, &name, &status).await?;
            return Ok(Action::requeue(REQUEUE_PENDING));
        }
    };

    let owner = site
        .controller_owner_ref(&())
        .ok_or_else(|| Error::configuration("site is missing metadata.uid"))?;
    let secret = site_credentials_secret(
        &name,
        &namespace,
        SiteCredentials {
            db_host: info.host.clone(),
            db_port: info.port.clone(),
            db_name: info.name.clone(),
            db_user: credentials.username.clone(),
            db_password: credentials.password.clone(),
            admin_password,
        },
        owner.clone(),
    );
    ctx.api.apply_secret(&namespace, &secret).await?;

    // Apps the bench image does not carry are skipped, not fatal
    let installed_on_bench = bench
        .status
        .as_ref()
        .map(|s| s.installed_apps.clone())
        .unwrap_or_default();
    let (install_apps, skipped_apps): (Vec<String>, Vec<String>) = site
        .spec
        .apps
        .iter()
        .cloned()
        .partition(|app| installed_on_bench.contains(app));

    let initialized = site
        .status
        .as_ref()
        .map(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == "Initialized" && c.status == ConditionStatus::True)
        })
        .unwrap_or(false);

    if !initialized {
        match ctx
            .api
            .get_job(&namespace, &resources::site_init_job_name(&name))
            .await?
        {
            None => {
                info!("creating site init job");
                let settings = ctx.api.operator_settings(&namespace).await?;
                let pod_settings = PodSettings {
                    security: config::resolve_security_context(&bench, &ctx.security),
                    pod_config: bench.spec.pod_config.clone(),
                };
                let container = ContainerSpec {
                    name: "init".to_string(),
                    image: config::resolve_image(&bench, &settings),
                    args: vec![
                        "bash".to_string(),
                        "-c".to_string(),
                        site_init_script(&site, &namespace, &info, &install_apps)?,
                    ],
                    env: site_env(&site, &namespace, &info, &install_apps),
                };
                let job = site_init_job(
                    &name,
                    &site.spec.bench_ref,
                    &namespace,
                    container,
                    &pod_settings,
                    owner,
                    INIT_JOB_TTL_SECONDS,
                );
                ctx.api.create_job(&namespace, &job).await?;
                let status = SiteStatus::with_phase(Phase::Provisioning)
                    .message("site initialization job created")
                    .database_ready(true)
                    .condition(Condition::new(
                        "Initialized",
                        ConditionStatus::False,
                        "InitJobRunning",
                        "site initialization job created",
                    ))
                    .observed_generation(site.metadata.generation);
                ctx.api.patch_status(&namespace, &name, &status).await?;
                return Ok(Action::requeue(REQUEUE_PENDING));
            }
            Some(job) if job_succeeded(&job) => {
                debug!("site init job succeeded");
            }
            Some(job) if job_failed(&job) => {
                warn!("site init job failed");
                let status = SiteStatus::with_phase(Phase::Failed)
                    .message("site initialization job failed")
                    .database_ready(true)
                    .condition(Condition::new(
                        "Initialized",
                        ConditionStatus::False,
                        "InitJobFailed",
                        "site initialization job exhausted its backoff",
                    ))
                    .observed_generation(site.metadata.generation);
                ctx.api.patch_status(&namespace, &name, &status).await?;
                return Ok(Action::await_change());
            }
            Some(_) => {
                debug!("site init job still running");
                let status = SiteStatus::with_phase(Phase::Provisioning)
                    .message("waiting for the site initialization job")
                    .database_ready(true)
                    .observed_generation(site.metadata.generation);
                ctx.api.patch_status(&namespace, &name, &status).await?;
                return Ok(Action::requeue(REQUEUE_PENDING));
            }
        }
    }

    let mut status = SiteStatus::with_phase(Phase::Ready)
        .message("site is ready")
        .database_ready(true)
        .condition(Condition::new(
            "DatabaseReady",
            ConditionStatus::True,
            "DatabaseReady",
            format!("{kind} database is ready"),
        ))
        .condition(Condition::new(
            "Initialized",
            ConditionStatus::True,
            "InitJobSucceeded",
            "site initialization complete",
        ))
        .installed_apps(install_apps)
        .skipped_apps(skipped_apps.clone())
        .observed_generation(site.metadata.generation);
    if !skipped_apps.is_empty() {
        status = status.message(format!(
            "site is ready; skipped apps not installed on the bench: {}",
            skipped_apps.join(", ")
        ));
    }
    ctx.api.patch_status(&namespace, &name, &status).await?;

    Ok(Action::requeue(REQUEUE_READY))
}

/// Deletion: clean up the database, then release the finalizer
async fn handle_deletion(
    site: &Site,
    name: &str,
    namespace: &str,
    ctx: &SiteContext,
) -> Result<Action> {
    if !site.finalizers().iter().any(|f| f == SITE_FINALIZER) {
        return Ok(Action::await_change());
    }

    match database::select_provider_kind(&site.spec.database_config()) {
        Ok(kind) => {
            let provider = ctx.provider(kind);
            match provider.cleanup(site).await {
                Ok(()) => info!(provider = %kind, "database cleanup complete"),
                Err(e) if e.is_circuit_rejection() => {
                    warn!(provider = %kind, "cleanup blocked by open circuit, backing off");
                    return Ok(Action::requeue(REQUEUE_CIRCUIT_OPEN));
                }
                Err(e) if e.is_terminal() => {
                    // A spec this broken never provisioned anything to clean up
                    warn!(error = %e, "skipping cleanup for unprocessable database config");
                }
                Err(e) => return Err(e),
            }
        }
        Err(e) => {
            warn!(error = %e, "skipping cleanup for unknown database provider");
        }
    }

    let finalizers: Vec<String> = site
        .finalizers()
        .iter()
        .filter(|f| *f != SITE_FINALIZER)
        .cloned()
        .collect();
    ctx.api
        .replace_finalizers(namespace, name, &finalizers)
        .await?;
    Ok(Action::await_change())
}

/// Error policy for the Site controller
pub fn site_error_policy(site: Arc<Site>, error: &Error, _ctx: Arc<SiteContext>) -> Action {
    error!(?error, site = %site.name_any(), "reconciliation failed");
    Action::requeue(REQUEUE_ERROR)
}

// =============================================================================
// Helpers
// =============================================================================

async fn fail_terminal(
    namespace: &str,
    name: &str,
    site: &Site,
    ctx: &SiteContext,
    reason: &str,
    error: &Error,
) -> Result<Action> {
    let status = SiteStatus::with_phase(Phase::Failed)
        .message(error.to_string())
        .condition(Condition::new(
            "Ready",
            ConditionStatus::False,
            reason,
            error.to_string(),
        ))
        .observed_generation(site.metadata.generation);
    ctx.api.patch_status(namespace, name, &status).await?;
    // Terminal failures require a spec change
    Ok(Action::await_change())
}

fn job_succeeded(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.succeeded)
        .unwrap_or(0)
        > 0
}

fn job_failed(job: &Job) -> bool {
    job.status.as_ref().and_then(|s| s.failed).unwrap_or(0) > 3
}

fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    if let Some(data) = &secret.data {
        if let Some(bytes) = data.get(key) {
            return String::from_utf8(bytes.0.clone()).ok();
        }
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .cloned()
}

/// Resolve the site's admin password.
///
/// An explicitly referenced secret wins; absent that, an already-synthesized
/// credentials Secret keeps its password across reconciliations; a brand new
/// site gets a generated one. `None` means the referenced secret has not
/// appeared yet.
async fn resolve_admin_password(
    site: &Site,
    namespace: &str,
    ctx: &SiteContext,
) -> Result<Option<String>> {
    if let Some(reference) = &site.spec.admin_password_secret_ref {
        let secret = ctx.api.get_secret(namespace, &reference.name).await?;
        return match secret {
            Some(secret) => secret_value(&secret, ADMIN_PASSWORD_KEY)
                .map(Some)
                .ok_or_else(|| {
                    Error::configuration(format!(
                        "secret '{}' has no '{ADMIN_PASSWORD_KEY}' key",
                        reference.name
                    ))
                }),
            None => Ok(None),
        };
    }

    let existing = ctx
        .api
        .get_secret(namespace, &resources::site_secret_name(&site.name_any()))
        .await?;
    if let Some(secret) = existing {
        if let Some(password) = secret_value(&secret, ADMIN_PASSWORD_KEY) {
            return Ok(Some(password));
        }
    }

    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ADMIN_PASSWORD_LENGTH)
        .map(char::from)
        .collect();
    Ok(Some(password))
}

/// Non-sensitive environment for the site init job.
///
/// Connection facts and passwords come from the mounted credentials Secret,
/// never from here. `INSTALL_APPS` carries the apps actually being installed
/// (requested minus skipped), space-joined.
fn site_env(
    site: &Site,
    namespace: &str,
    info: &DatabaseInfo,
    install_apps: &[String],
) -> Vec<(String, String)> {
    vec![
        ("SITE_NAME".to_string(), site.spec.site_name.clone()),
        (
            "SITE_DOMAIN".to_string(),
            site.spec.resolved_domain(namespace),
        ),
        ("DB_PROVIDER".to_string(), info.provider.clone()),
        ("BENCH_NAME".to_string(), site.spec.bench_ref.clone()),
        ("INSTALL_APPS".to_string(), install_apps.join(" ")),
    ]
}

/// Generate the site initialization script.
///
/// Credentials are read from the mounted Secret at runtime; the script text
/// itself carries no secrets. App names were validated before this point; the
/// check is repeated because they are interpolated into shell.
fn site_init_script(
    site: &Site,
    namespace: &str,
    info: &DatabaseInfo,
    install_apps: &[String],
) -> Result<String> {
    for app in install_apps {
        if !crate::crd::is_safe_app_name(app) {
            return Err(Error::configuration(format!(
                "app name '{app}' contains characters outside [A-Za-z0-9_-]"
            )));
        }
    }

    let domain = site.spec.resolved_domain(namespace);
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        "set -euo pipefail".to_string(),
        "cd /home/frappe/frappe-bench".to_string(),
        format!("DB_HOST=\"$(cat {CREDENTIALS_MOUNT_PATH}/db-host)\""),
        format!("DB_PORT=\"$(cat {CREDENTIALS_MOUNT_PATH}/db-port)\""),
        format!("DB_NAME=\"$(cat {CREDENTIALS_MOUNT_PATH}/db-name)\""),
        format!(
            "bench new-site '{domain}' \\\n  --db-type {} \\\n  --db-host \"$DB_HOST\" \\\n  --db-port \"$DB_PORT\" \\\n  --db-name \"$DB_NAME\" \\\n  --db-root-username \"$(cat {CREDENTIALS_MOUNT_PATH}/db-user)\" \\\n  --db-root-password \"$(cat {CREDENTIALS_MOUNT_PATH}/db-password)\" \\\n  --admin-password \"$(cat {CREDENTIALS_MOUNT_PATH}/admin-password)\" \\\n  --no-mariadb-socket",
            info.provider
        ),
    ];
    for app in install_apps {
        lines.push(format!("bench --site '{domain}' install-app {app}"));
    }
    lines.push(format!("bench --site '{domain}' enable-scheduler"));
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        BenchSpec, BenchStatus, DatabaseConfig, DatabaseMode, LocalObjectReference, SiteSpec,
    };
    use crate::database::{DatabaseCredentials, MockDatabaseProvider};
    use k8s_openapi::api::batch::v1::JobStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn sample_site(name: &str) -> Site {
        let mut site = Site::new(
            name,
            SiteSpec {
                site_name: name.to_string(),
                bench_ref: "main".to_string(),
                db_config: None,
                apps: vec!["erpnext".to_string()],
                admin_password_secret_ref: None,
                domain: None,
            },
        );
        site.metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("prod".to_string()),
            uid: Some(format!("uid-{name}")),
            generation: Some(1),
            finalizers: Some(vec![SITE_FINALIZER.to_string()]),
            ..Default::default()
        };
        site
    }

    fn deleting_site(name: &str) -> Site {
        let mut site = sample_site(name);
        site.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        site
    }

    fn ready_bench() -> Bench {
        let mut bench = Bench::new(
            "main",
            BenchSpec {
                version: "v15".to_string(),
                image: None,
                apps: vec![],
                replicas: None,
                workers: None,
                security_context: None,
                storage: None,
                fpm_repositories: vec![],
                git_enabled: None,
                pod_config: None,
                site_reconcile_concurrency: None,
            },
        );
        bench.metadata.namespace = Some("prod".to_string());
        bench.status = Some(
            BenchStatus::with_phase(Phase::Ready)
                .installed_apps(vec!["erpnext".to_string(), "hrms".to_string()]),
        );
        bench
    }

    fn succeeded_job() -> Job {
        Job {
            status: Some(JobStatus {
                succeeded: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ready_provider() -> MockDatabaseProvider {
        ready_provider_except(&[])
    }

    /// Like [`ready_provider`], but installs no catch-all for the methods
    /// named in `overridden`. Mockall serves calls from the earliest
    /// unexhausted expectation, so a catch-all registered here would shadow
    /// any expectation (including `.never()`) a test adds afterwards for the
    /// same method.
    fn ready_provider_except(overridden: &[&str]) -> MockDatabaseProvider {
        let skip = |name: &str| overridden.contains(&name);
        let mut provider = MockDatabaseProvider::new();
        if !skip("ensure_database") {
            provider.expect_ensure_database().returning(|_| {
                Ok(DatabaseInfo {
                    host: "shared-mariadb.prod.svc".to_string(),
                    port: "3306".to_string(),
                    name: "tenant1".to_string(),
                    provider: "mariadb".to_string(),
                })
            });
        }
        if !skip("is_ready") {
            provider.expect_is_ready().returning(|_| Ok(true));
        }
        if !skip("get_credentials") {
            provider.expect_get_credentials().returning(|_| {
                Ok(DatabaseCredentials {
                    username: "tenant1".to_string(),
                    password: "s3cret-db-pw".to_string(),
                    secret_name: "tenant1-db-password".to_string(),
                })
            });
        }
        provider
    }

    /// Mock that allows the whole happy path and records patched statuses
    fn permissive_api(statuses: Arc<Mutex<Vec<SiteStatus>>>) -> MockSiteApi {
        permissive_api_except(statuses, &[])
    }

    /// Like [`permissive_api`], but installs no catch-all for the methods
    /// named in `overridden`. Mockall serves calls from the earliest
    /// unexhausted expectation, so a catch-all registered here would shadow
    /// any expectation (including `.never()`) a test adds afterwards for the
    /// same method.
    fn permissive_api_except(
        statuses: Arc<Mutex<Vec<SiteStatus>>>,
        overridden: &[&str],
    ) -> MockSiteApi {
        let skip = |name: &str| overridden.contains(&name);
        let mut api = MockSiteApi::new();
        api.expect_patch_status().returning(move |_, _, status| {
            statuses
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(status.clone());
            Ok(())
        });
        if !skip("replace_finalizers") {
            api.expect_replace_finalizers().returning(|_, _, _| Ok(()));
        }
        if !skip("get_bench") {
            api.expect_get_bench().returning(|_, _| Ok(Some(ready_bench())));
        }
        if !skip("get_secret") {
            api.expect_get_secret().returning(|_, _| Ok(None));
        }
        if !skip("apply_secret") {
            api.expect_apply_secret().returning(|_, _| Ok(()));
        }
        if !skip("get_job") {
            api.expect_get_job().returning(|_, _| Ok(Some(succeeded_job())));
        }
        if !skip("create_job") {
            api.expect_create_job().returning(|_, _| Ok(()));
        }
        if !skip("operator_settings") {
            api.expect_operator_settings()
                .returning(|_| Ok(OperatorSettings::default()));
        }
        api
    }

    // =========================================================================
    // Bench Dependency Stories
    // =========================================================================

    /// Story: a site referencing a nonexistent bench parks in Pending with a
    /// BenchNotFound condition instead of erroring
    #[tokio::test]
    async fn story_missing_bench_parks_site_pending() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut api = permissive_api_except(
            statuses.clone(),
            &["get_bench", "apply_secret", "create_job"],
        );
        api.expect_get_bench().returning(|_, _| Ok(None));
        api.expect_apply_secret().never();
        api.expect_create_job().never();

        let ctx = Arc::new(SiteContext::for_testing(
            Arc::new(api),
            Arc::new(MockDatabaseProvider::new()),
        ));
        let action = reconcile_site(Arc::new(sample_site("tenant1")), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_PENDING));

        let patched = statuses.lock().unwrap();
        let last = patched.last().unwrap();
        assert_eq!(last.phase, Phase::Pending);
        assert!(last
            .conditions
            .iter()
            .any(|c| c.type_ == "BenchReady" && c.reason == "BenchNotFound"));
    }

    /// Story: a bench that exists but is not Ready holds the site in Pending
    #[tokio::test]
    async fn story_unready_bench_holds_site() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut api = permissive_api_except(statuses.clone(), &["get_bench", "apply_secret"]);
        api.expect_get_bench().returning(|_, _| {
            let mut bench = ready_bench();
            bench.status = Some(BenchStatus::with_phase(Phase::Provisioning));
            Ok(Some(bench))
        });
        api.expect_apply_secret().never();

        let ctx = Arc::new(SiteContext::for_testing(
            Arc::new(api),
            Arc::new(MockDatabaseProvider::new()),
        ));
        let action = reconcile_site(Arc::new(sample_site("tenant1")), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_PENDING));
        assert_eq!(statuses.lock().unwrap().last().unwrap().phase, Phase::Pending);
    }

    // =========================================================================
    // Database Provisioning Stories
    // =========================================================================

    /// Story: an unknown provider name is a terminal failure; nothing is
    /// provisioned and only a spec change recovers the site
    #[tokio::test]
    async fn story_unknown_provider_fails_terminally() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let api = permissive_api(statuses.clone());

        let mut site = sample_site("tenant1");
        site.spec.db_config = Some(DatabaseConfig {
            provider: Some("cockroach".to_string()),
            ..Default::default()
        });

        let ctx = Arc::new(SiteContext::for_testing(
            Arc::new(api),
            Arc::new(MockDatabaseProvider::new()),
        ));
        let action = reconcile_site(Arc::new(site), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let patched = statuses.lock().unwrap();
        let last = patched.last().unwrap();
        assert_eq!(last.phase, Phase::Failed);
        assert!(last.message.as_deref().unwrap_or("").contains("cockroach"));
    }

    /// Story: a circuit rejection backs off without counting more failures;
    /// credentials are never requested
    #[tokio::test]
    async fn story_circuit_rejection_backs_off() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let api = permissive_api(statuses.clone());

        let mut provider = MockDatabaseProvider::new();
        provider
            .expect_ensure_database()
            .returning(|_| Err(Error::CircuitOpen("mariadb".to_string())));
        provider.expect_get_credentials().never();

        let ctx = Arc::new(SiteContext::for_testing(Arc::new(api), Arc::new(provider)));
        let action = reconcile_site(Arc::new(sample_site("tenant1")), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_CIRCUIT_OPEN));

        let patched = statuses.lock().unwrap();
        let last = patched.last().unwrap();
        assert_eq!(last.phase, Phase::Pending);
        assert!(last
            .conditions
            .iter()
            .any(|c| c.reason == "CircuitOpen"));
    }

    /// Story: shared mode without an administrator-provisioned instance waits
    /// rather than failing; the site recovers without a spec change once the
    /// instance appears
    #[tokio::test]
    async fn story_missing_shared_database_waits() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let api = permissive_api(statuses.clone());

        let mut provider = MockDatabaseProvider::new();
        provider.expect_ensure_database().returning(|_| {
            Err(Error::configuration(
                "shared database mode requires databaseClusterRef: no shared MariaDB instance is configured for this namespace",
            ))
        });

        let ctx = Arc::new(SiteContext::for_testing(Arc::new(api), Arc::new(provider)));
        let action = reconcile_site(Arc::new(sample_site("tenant1")), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_CIRCUIT_OPEN));

        let patched = statuses.lock().unwrap();
        let last = patched.last().unwrap();
        assert_eq!(last.phase, Phase::Pending);
        assert!(last
            .conditions
            .iter()
            .any(|c| c.reason == "WaitingForDatabase"));
    }

    /// Story: a provisioned-but-unready database keeps the site in
    /// Provisioning; credentials are not requested yet
    #[tokio::test]
    async fn story_unready_database_keeps_provisioning() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let api = permissive_api(statuses.clone());

        let mut provider = ready_provider_except(&["is_ready", "get_credentials"]);
        provider.expect_is_ready().returning(|_| Ok(false));
        provider.expect_get_credentials().never();

        let ctx = Arc::new(SiteContext::for_testing(Arc::new(api), Arc::new(provider)));
        let action = reconcile_site(Arc::new(sample_site("tenant1")), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_PENDING));

        let patched = statuses.lock().unwrap();
        let last = patched.last().unwrap();
        assert_eq!(last.phase, Phase::Provisioning);
        assert!(!last.database_ready);
    }

    // =========================================================================
    // Credentials Stories
    // =========================================================================

    /// Story: the credentials Secret carries all six keys; the init job's
    /// environment and script never carry the passwords
    #[tokio::test]
    async fn story_credentials_stay_out_of_the_job() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut api = permissive_api_except(
            statuses.clone(),
            &["apply_secret", "get_job", "create_job"],
        );
        api.expect_apply_secret()
            .times(1)
            .withf(|_, secret| {
                let data = secret.string_data.as_ref().unwrap();
                secret.metadata.name.as_deref() == Some("tenant1-credentials")
                    && data["db-host"] == "shared-mariadb.prod.svc"
                    && data["db-password"] == "s3cret-db-pw"
                    && data.contains_key("admin-password")
            })
            .returning(|_, _| Ok(()));
        api.expect_get_job().returning(|_, _| Ok(None));
        api.expect_create_job()
            .times(1)
            .withf(|_, job| {
                let serialized = serde_json::to_string(job).unwrap();
                let env: Vec<(String, Option<String>)> = job
                    .spec
                    .iter()
                    .flat_map(|s| s.template.spec.iter())
                    .flat_map(|p| p.containers.iter())
                    .flat_map(|c| c.env.iter().flatten())
                    .map(|e| (e.name.clone(), e.value.clone()))
                    .collect();
                !serialized.contains("s3cret-db-pw")
                    && env.iter().any(|(n, _)| n == "SITE_NAME")
                    && env.iter().any(|(n, v)| {
                        // Space-joined, installable apps only (custom_app is
                        // not on the bench and is skipped)
                        n == "INSTALL_APPS" && v.as_deref() == Some("erpnext hrms")
                    })
                    && !env.iter().any(|(n, _)| {
                        ["DB_HOST", "DB_PORT", "DB_NAME", "DB_USER", "DB_PASSWORD", "ADMIN_PASSWORD"]
                            .contains(&n.as_str())
                    })
            })
            .returning(|_, _| Ok(()));

        let mut site = sample_site("tenant1");
        site.spec.apps = vec![
            "erpnext".to_string(),
            "hrms".to_string(),
            "custom_app".to_string(),
        ];
        let ctx = Arc::new(SiteContext::for_testing(
            Arc::new(api),
            Arc::new(ready_provider()),
        ));
        let action = reconcile_site(Arc::new(site), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_PENDING));
        assert_eq!(
            statuses.lock().unwrap().last().unwrap().phase,
            Phase::Provisioning
        );
    }

    /// Story: an existing credentials Secret keeps its admin password across
    /// reconciliations instead of being rotated every pass
    #[tokio::test]
    async fn story_admin_password_is_stable() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut api = permissive_api_except(statuses.clone(), &["get_secret", "apply_secret"]);
        api.expect_get_secret().returning(|_, name| {
            assert_eq!(name, "tenant1-credentials");
            Ok(Some(Secret {
                string_data: Some(BTreeMap::from([(
                    "admin-password".to_string(),
                    "existing-admin-pw".to_string(),
                )])),
                ..Default::default()
            }))
        });
        api.expect_apply_secret()
            .times(1)
            .withf(|_, secret| {
                secret.string_data.as_ref().unwrap()["admin-password"] == "existing-admin-pw"
            })
            .returning(|_, _| Ok(()));

        let ctx = Arc::new(SiteContext::for_testing(
            Arc::new(api),
            Arc::new(ready_provider()),
        ));
        reconcile_site(Arc::new(sample_site("tenant1")), ctx)
            .await
            .unwrap();
    }

    /// Story: a referenced admin password secret that has not appeared yet
    /// parks the site in Pending instead of generating a throwaway password
    #[tokio::test]
    async fn story_referenced_admin_secret_is_awaited() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut api = permissive_api_except(statuses.clone(), &["get_secret", "apply_secret"]);
        api.expect_get_secret().returning(|_, _| Ok(None));
        api.expect_apply_secret().never();

        let mut site = sample_site("tenant1");
        site.spec.admin_password_secret_ref = Some(LocalObjectReference {
            name: "tenant1-admin".to_string(),
        });

        let ctx = Arc::new(SiteContext::for_testing(
            Arc::new(api),
            Arc::new(ready_provider()),
        ));
        let action = reconcile_site(Arc::new(site), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_PENDING));
        assert_eq!(statuses.lock().unwrap().last().unwrap().phase, Phase::Pending);
    }

    // =========================================================================
    // Convergence Stories
    // =========================================================================

    /// Story: a converged site reports Ready, with apps the bench image does
    /// not carry listed as skipped rather than failing the site
    #[tokio::test]
    async fn story_converged_site_reports_ready_with_skips() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let api = permissive_api(statuses.clone());

        let mut site = sample_site("tenant1");
        site.spec.apps.push("payments".to_string());

        let ctx = Arc::new(SiteContext::for_testing(
            Arc::new(api),
            Arc::new(ready_provider()),
        ));
        let action = reconcile_site(Arc::new(site), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_READY));

        let patched = statuses.lock().unwrap();
        let last = patched.last().unwrap();
        assert_eq!(last.phase, Phase::Ready);
        assert!(last.database_ready);
        assert_eq!(last.installed_apps, vec!["erpnext".to_string()]);
        assert_eq!(last.skipped_apps, vec!["payments".to_string()]);
        assert!(last
            .message
            .as_deref()
            .unwrap_or("")
            .contains("payments"));
    }

    // =========================================================================
    // Deletion Stories
    // =========================================================================

    /// Story: deletion cleans up the database before the finalizer is released
    #[tokio::test]
    async fn story_deletion_cleans_database_first() {
        let mut api = MockSiteApi::new();
        api.expect_replace_finalizers()
            .times(1)
            .withf(|_, _, finalizers| !finalizers.iter().any(|f| f == SITE_FINALIZER))
            .returning(|_, _, _| Ok(()));

        let mut provider = MockDatabaseProvider::new();
        provider.expect_cleanup().times(1).returning(|_| Ok(()));

        let ctx = Arc::new(SiteContext::for_testing(Arc::new(api), Arc::new(provider)));
        let action = reconcile_site(Arc::new(deleting_site("tenant1")), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: an open circuit during cleanup backs off and keeps the
    /// finalizer, so the database is never orphaned silently
    #[tokio::test]
    async fn story_deletion_blocked_by_open_circuit() {
        let mut api = MockSiteApi::new();
        api.expect_replace_finalizers().never();

        let mut provider = MockDatabaseProvider::new();
        provider
            .expect_cleanup()
            .returning(|_| Err(Error::CircuitOpen("mariadb".to_string())));

        let ctx = Arc::new(SiteContext::for_testing(Arc::new(api), Arc::new(provider)));
        let action = reconcile_site(Arc::new(deleting_site("tenant1")), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_CIRCUIT_OPEN));
    }

    /// Story: an unparseable database config cannot block deletion forever;
    /// cleanup is skipped and the finalizer released
    #[tokio::test]
    async fn story_deletion_proceeds_despite_bad_config() {
        let mut api = MockSiteApi::new();
        api.expect_replace_finalizers()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut site = deleting_site("tenant1");
        site.spec.db_config = Some(DatabaseConfig {
            provider: Some("cockroach".to_string()),
            ..Default::default()
        });

        let ctx = Arc::new(SiteContext::for_testing(
            Arc::new(api),
            Arc::new(MockDatabaseProvider::new()),
        ));
        let action = reconcile_site(Arc::new(site), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    // =========================================================================
    // Script Stories
    // =========================================================================

    /// Story: the init script references credentials by mounted file path,
    /// never by literal value
    #[test]
    fn story_script_reads_credentials_from_mount() {
        let site = sample_site("tenant1");
        let info = DatabaseInfo {
            host: "shared-mariadb.prod.svc".to_string(),
            port: "3306".to_string(),
            name: "tenant1".to_string(),
            provider: "mariadb".to_string(),
        };
        let script =
            site_init_script(&site, "prod", &info, &["erpnext".to_string()]).unwrap();

        assert!(script.contains("/etc/site-credentials/db-password"));
        assert!(script.contains("/etc/site-credentials/admin-password"));
        assert!(script.contains("bench new-site 'tenant1.prod.svc'"));
        assert!(script.contains("install-app erpnext"));
        assert!(!script.contains("s3cret"));
    }

    /// Story: deletion with an unexpected database mode still validates app
    /// names before interpolating them into shell
    #[test]
    fn story_script_rejects_unsafe_app_names() {
        let site = sample_site("tenant1");
        let info = DatabaseInfo {
            host: "h".to_string(),
            port: "3306".to_string(),
            name: "tenant1".to_string(),
            provider: "mariadb".to_string(),
        };
        let err =
            site_init_script(&site, "prod", &info, &["evil; rm -rf /".to_string()]).unwrap_err();
        assert!(err.is_terminal());
    }

    /// Story: a dedicated-mode site flows through the same reconcile path
    #[tokio::test]
    async fn story_dedicated_mode_uses_selected_provider() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let api = permissive_api(statuses.clone());

        let mut site = sample_site("tenant1");
        site.spec.db_config = Some(DatabaseConfig {
            provider: Some("mariadb".to_string()),
            mode: DatabaseMode::Dedicated,
            ..Default::default()
        });

        let ctx = Arc::new(SiteContext::for_testing(
            Arc::new(api),
            Arc::new(ready_provider()),
        ));
        let action = reconcile_site(Arc::new(site), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_READY));
    }
}

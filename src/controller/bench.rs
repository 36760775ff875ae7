//! Bench controller implementation
//!
//! Reconciles a Bench into its child resources: the shared sites PVC, the
//! one-shot initialization Job, redis cache/queue backing services, the web
//! tier deployments, and the three queue workers with their scaling decision.
//!
//! Deletion runs a staged protocol: refuse while dependent Sites exist, scale
//! workloads to zero, wait for drain, delete the PVC, then release the
//! finalizer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::{
    self, OperatorSettings, ResolvedWorkerAutoscaling, SecurityDefaults,
};
use crate::crd::{
    AppSource, Bench, BenchStatus, Condition, ConditionStatus, Phase, ScalingMode, Site,
    WorkerType,
};
use crate::resources::{
    self, bench_deployment, bench_init_job, redis_statefulset, redis_service, sites_pvc,
    ContainerSpec, PodSettings,
};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::scaling;
use crate::{Error, Result, BENCH_FINALIZER, FIELD_MANAGER};

/// Requeue delay while children are still converging
const REQUEUE_PENDING: Duration = Duration::from_secs(10);
/// Requeue delay for a settled, Ready bench
const REQUEUE_READY: Duration = Duration::from_secs(300);
/// Backoff applied by the error policy
const REQUEUE_ERROR: Duration = Duration::from_secs(5);

/// TTL applied to finished init jobs
const INIT_JOB_TTL_SECONDS: i32 = 3_600;

/// Web-tier components reconciled as plain deployments
const COMPONENTS: [&str; 4] = ["gunicorn", "nginx", "socketio", "scheduler"];

/// Trait abstracting Kubernetes operations for the Bench controller.
///
/// This trait allows mocking the cluster in tests while using the real
/// client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BenchApi: Send + Sync {
    /// Patch the status subresource of a Bench
    async fn patch_status(&self, namespace: &str, name: &str, status: &BenchStatus)
        -> Result<()>;

    /// Replace the finalizer list on a Bench
    async fn replace_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()>;

    /// Fetch a PVC, None when absent
    async fn get_pvc(&self, namespace: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>>;

    /// Create a PVC; already-exists is success
    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()>;

    /// Delete a PVC; absence is success
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()>;

    /// Fetch a Job, None when absent
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    /// Create a Job; already-exists is success
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<()>;

    /// Fetch a Deployment, None when absent
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Server-side apply a Deployment
    async fn apply_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()>;

    /// Pin a Deployment's replica count
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    /// Server-side apply a StatefulSet
    async fn apply_stateful_set(&self, namespace: &str, set: &StatefulSet) -> Result<()>;

    /// Fetch a StatefulSet, None when absent
    async fn get_stateful_set(&self, namespace: &str, name: &str)
        -> Result<Option<StatefulSet>>;

    /// Pin a StatefulSet's replica count
    async fn scale_stateful_set(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    /// Server-side apply a Service
    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<()>;

    /// List all Sites in a namespace
    async fn list_sites(&self, namespace: &str) -> Result<Vec<Site>>;

    /// Snapshot of the operator-level settings ConfigMap
    async fn operator_settings(&self, namespace: &str) -> Result<OperatorSettings>;

    /// Whether the KEDA ScaledObject CRD is installed (fail-open probe)
    async fn keda_available(&self) -> bool;

    /// Server-side apply a ScaledObject
    async fn apply_scaled_object(
        &self,
        namespace: &str,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<()>;

    /// Delete a ScaledObject; absence is success
    async fn delete_scaled_object(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Real [`BenchApi`] backed by a Kubernetes client
pub struct KubeBenchApi {
    client: Client,
}

impl KubeBenchApi {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }

    fn ignore_not_found(err: kube::Error) -> Result<()> {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Ok(()),
            other => Err(other.into()),
        }
    }

    fn ignore_already_exists(err: kube::Error) -> Result<()> {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => Ok(()),
            other => Err(other.into()),
        }
    }

    fn scaled_object_api(&self, namespace: &str) -> Api<kube::api::DynamicObject> {
        let resource = kube::discovery::ApiResource::from_gvk(&scaling::scaled_object_gvk());
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

#[async_trait]
impl BenchApi for KubeBenchApi {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BenchStatus,
    ) -> Result<()> {
        let api: Api<Bench> = Api::namespaced(self.client.clone(), namespace);
        let patch = Patch::Merge(serde_json::json!({ "status": status }));
        let params = PatchParams::apply(FIELD_MANAGER);
        // Status writes race with concurrent watch-driven updates; a bounded
        // in-process retry is cheaper than a full requeue round-trip
        retry_with_backoff(&RetryConfig::with_max_attempts(3), "patch_bench_status", || {
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
        let api: Api<Bench> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&Default::default(), pvc).await {
            Ok(_) => Ok(()),
            Err(e) => Self::ignore_already_exists(e),
        }
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(e) => Self::ignore_not_found(e),
        }
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

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = deployment
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::configuration("deployment is missing metadata.name"))?;
        api.patch(name, &Self::apply_params(), &Patch::Apply(deployment))
            .await?;
        Ok(())
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => Self::ignore_not_found(e),
        }
    }

    async fn apply_stateful_set(&self, namespace: &str, set: &StatefulSet) -> Result<()> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let name = set
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::configuration("statefulset is missing metadata.name"))?;
        api.patch(name, &Self::apply_params(), &Patch::Apply(set))
            .await?;
        Ok(())
    }

    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn scale_stateful_set(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => Self::ignore_not_found(e),
        }
    }

    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let name = service
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::configuration("service is missing metadata.name"))?;
        api.patch(name, &Self::apply_params(), &Patch::Apply(service))
            .await?;
        Ok(())
    }

    async fn list_sites(&self, namespace: &str) -> Result<Vec<Site>> {
        let api: Api<Site> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn operator_settings(&self, namespace: &str) -> Result<OperatorSettings> {
        OperatorSettings::load(self.client.clone(), namespace).await
    }

    async fn keda_available(&self) -> bool {
        scaling::keda_available(&self.client).await
    }

    async fn apply_scaled_object(
        &self,
        namespace: &str,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        self.scaled_object_api(namespace)
            .patch(name, &Self::apply_params(), &Patch::Apply(value))
            .await?;
        Ok(())
    }

    async fn delete_scaled_object(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .scaled_object_api(namespace)
            .delete(name, &Default::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => Self::ignore_not_found(e),
        }
    }
}

/// Shared state for the Bench controller
pub struct BenchContext {
    /// Cluster operations (trait object for testability)
    pub api: Arc<dyn BenchApi>,
    /// Environment-derived security defaults, read once at startup
    pub security: SecurityDefaults,
}

impl BenchContext {
    /// Context over a real Kubernetes client
    pub fn new(client: Client) -> Self {
        Self {
            api: Arc::new(KubeBenchApi::new(client)),
            security: SecurityDefaults::from_env(),
        }
    }

    /// Context over a mocked api, for unit tests
    #[cfg(test)]
    pub fn for_testing(api: Arc<dyn BenchApi>) -> Self {
        Self {
            api,
            security: SecurityDefaults::default(),
        }
    }
}

// =============================================================================
// Pure decision logic
// =============================================================================

/// One step of the staged deletion protocol
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeletionStep {
    /// Dependent Sites still reference this bench; deletion must wait
    BlockedOnSites(usize),
    /// Workloads still have pods; scale to zero and wait for drain
    AwaitDrain,
    /// Safe to delete storage and release the finalizer
    Finish,
}

/// Decide the next deletion step from observed state.
///
/// Pure so the ordering invariant (sites before drain before storage) can be
/// asserted directly.
pub fn decide_deletion_step(dependent_sites: usize, workloads_drained: bool) -> DeletionStep {
    if dependent_sites > 0 {
        DeletionStep::BlockedOnSites(dependent_sites)
    } else if !workloads_drained {
        DeletionStep::AwaitDrain
    } else {
        DeletionStep::Finish
    }
}

/// Whether a deployment has fully drained (no pods left behind it).
///
/// A scaled-down deployment can report zero desired replicas while pods are
/// still terminating, so both the replica and ready-replica counts must reach
/// zero.
fn deployment_drained(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .map(|s| s.replicas.unwrap_or(0) == 0 && s.ready_replicas.unwrap_or(0) == 0)
        .unwrap_or(true)
}

/// Whether a statefulset has fully drained, same gate as deployments
fn stateful_set_drained(set: &StatefulSet) -> bool {
    set.status
        .as_ref()
        .map(|s| s.replicas == 0 && s.ready_replicas.unwrap_or(0) == 0)
        .unwrap_or(true)
}

/// Whether an init job has completed successfully
fn job_succeeded(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.succeeded)
        .unwrap_or(0)
        > 0
}

/// Whether an init job has exhausted its backoff
fn job_failed(job: &Job) -> bool {
    job.status.as_ref().and_then(|s| s.failed).unwrap_or(0) > 3
}

/// Generate the bench initialization script.
///
/// Returns the script plus the names of apps it installs and the names it
/// skips (git apps while git sources are disabled). App names were validated
/// against the identifier allow-list before this point; the check is repeated
/// here because the names are interpolated into a shell script.
pub fn bench_init_script(
    bench: &Bench,
    settings: &OperatorSettings,
) -> Result<(String, Vec<String>, Vec<String>)> {
    let git_enabled = config::git_enabled(bench, settings);
    let mut lines = vec![
        "#!/bin/bash".to_string(),
        "set -euo pipefail".to_string(),
        "cd /home/frappe/frappe-bench".to_string(),
    ];
    let mut installed = Vec::new();
    let mut skipped = Vec::new();

    for repo in config::merge_fpm_repositories(bench, settings) {
        lines.push(format!("fpm repo add '{}' '{}'", repo.name, repo.url));
    }

    for app in &bench.spec.apps {
        if !crate::crd::is_safe_app_name(&app.name) {
            return Err(Error::configuration(format!(
                "app name '{}' contains characters outside [A-Za-z0-9_-]",
                app.name
            )));
        }
        match app.source {
            AppSource::Image => {
                // Baked into the image; nothing to fetch
                installed.push(app.name.clone());
            }
            AppSource::Fpm => {
                lines.push(format!("fpm install {}", app.name));
                installed.push(app.name.clone());
            }
            AppSource::Git => {
                if !git_enabled {
                    skipped.push(app.name.clone());
                    continue;
                }
                let url = app.url.as_deref().ok_or_else(|| {
                    Error::configuration(format!("app '{}' has source 'git' but no url", app.name))
                })?;
                let branch = app
                    .branch
                    .as_deref()
                    .map(|b| format!(" --branch '{b}'"))
                    .unwrap_or_default();
                lines.push(format!("bench get-app {} '{url}'{branch}", app.name));
                installed.push(app.name.clone());
            }
        }
    }

    let skip_assets = bench
        .annotations()
        .get(crate::SKIP_ASSET_BUILD_ANNOTATION)
        .map(|v| v == "true")
        .unwrap_or(false);
    if !skip_assets {
        lines.push("bench build".to_string());
    }

    Ok((lines.join("\n"), installed, skipped))
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a Bench resource
#[instrument(skip(bench, ctx), fields(bench = %bench.name_any()))]
pub async fn reconcile_bench(bench: Arc<Bench>, ctx: Arc<BenchContext>) -> Result<Action> {
    let name = bench.name_any();
    let namespace = bench
        .namespace()
        .ok_or_else(|| Error::configuration("bench is missing metadata.namespace"))?;

    if bench.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&bench, &name, &namespace, &ctx).await;
    }

    // Attach the finalizer before creating anything we must clean up
    if !bench.finalizers().iter().any(|f| f == BENCH_FINALIZER) {
        debug!("attaching finalizer");
        let mut finalizers: Vec<String> = bench.finalizers().to_vec();
        finalizers.push(BENCH_FINALIZER.to_string());
        ctx.api
            .replace_finalizers(&namespace, &name, &finalizers)
            .await?;
    }

    if let Err(e) = bench.spec.validate() {
        warn!(error = %e, "bench validation failed");
        let status = BenchStatus::with_phase(Phase::Failed)
            .message(e.to_string())
            .condition(Condition::new(
                "Ready",
                ConditionStatus::False,
                "ValidationFailed",
                e.to_string(),
            ))
            .observed_generation(bench.metadata.generation);
        ctx.api.patch_status(&namespace, &name, &status).await?;
        // Validation errors require a spec change
        return Ok(Action::await_change());
    }

    let owner = bench
        .controller_owner_ref(&())
        .ok_or_else(|| Error::configuration("bench is missing metadata.uid"))?;
    let settings = ctx.api.operator_settings(&namespace).await?;
    let pod_settings = PodSettings {
        security: config::resolve_security_context(&bench, &ctx.security),
        pod_config: bench.spec.pod_config.clone(),
    };
    let image = config::resolve_image(&bench, &settings);

    // Shared storage first: everything else mounts it
    if ctx
        .api
        .get_pvc(&namespace, &resources::pvc_name(&name))
        .await?
        .is_none()
    {
        info!("creating shared sites volume");
        let pvc = sites_pvc(&name, &namespace, bench.spec.storage.as_ref(), owner.clone());
        ctx.api.create_pvc(&namespace, &pvc).await?;
    }

    // One-shot initialization: created once, never recreated. Success is
    // remembered in status so TTL reaping of the job cannot re-trigger it.
    let initialized = bench
        .status
        .as_ref()
        .map(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == "Initialized" && c.status == ConditionStatus::True)
        })
        .unwrap_or(false);
    let (script, installed_apps, skipped_apps) = bench_init_script(&bench, &settings)?;

    if !initialized {
        match ctx
            .api
            .get_job(&namespace, &resources::init_job_name(&name))
            .await?
        {
            None => {
                info!("creating bench init job");
                let container = ContainerSpec {
                    name: "init".to_string(),
                    image: image.clone(),
                    args: vec!["bash".to_string(), "-c".to_string(), script],
                    env: bench_env(&name),
                };
                let job = bench_init_job(
                    &name,
                    &namespace,
                    container,
                    &pod_settings,
                    owner.clone(),
                    INIT_JOB_TTL_SECONDS,
                );
                ctx.api.create_job(&namespace, &job).await?;
                let status = provisioning_status(&bench, "Initialization job created");
                ctx.api.patch_status(&namespace, &name, &status).await?;
                return Ok(Action::requeue(REQUEUE_PENDING));
            }
            Some(job) if job_succeeded(&job) => {
                debug!("init job succeeded");
            }
            Some(job) if job_failed(&job) => {
                // Left in place for diagnosis; never recreated
                warn!("init job failed");
                let status = BenchStatus::with_phase(Phase::Failed)
                    .message("initialization job failed")
                    .condition(Condition::new(
                        "Initialized",
                        ConditionStatus::False,
                        "InitJobFailed",
                        "initialization job exhausted its backoff",
                    ))
                    .observed_generation(bench.metadata.generation);
                ctx.api.patch_status(&namespace, &name, &status).await?;
                return Ok(Action::await_change());
            }
            Some(_) => {
                debug!("init job still running");
                let status = provisioning_status(&bench, "Waiting for initialization job");
                ctx.api.patch_status(&namespace, &name, &status).await?;
                return Ok(Action::requeue(REQUEUE_PENDING));
            }
        }
    }

    // Auxiliary services after initialization; the init script works against
    // the shared volume only and never needs the queue
    for tier in ["cache", "queue"] {
        let set = redis_statefulset(&name, &namespace, tier, &pod_settings, owner.clone());
        if let Err(e) = ctx.api.apply_stateful_set(&namespace, &set).await {
            return Err(degraded(&bench, &namespace, &name, ctx.as_ref(), "redis statefulset", e).await);
        }
        let svc = redis_service(&name, &namespace, tier, owner.clone());
        if let Err(e) = ctx.api.apply_service(&namespace, &svc).await {
            return Err(degraded(&bench, &namespace, &name, ctx.as_ref(), "redis service", e).await);
        }
    }

    // Web tier
    let replicas = bench.spec.replicas.clone().unwrap_or_default();
    for component in COMPONENTS {
        let count = component_replicas(&replicas, component);
        let container = ContainerSpec {
            name: component.to_string(),
            image: image.clone(),
            args: component_args(component),
            env: bench_env(&name),
        };
        let deployment = bench_deployment(
            &name,
            &namespace,
            component,
            Some(count),
            container,
            &pod_settings,
            BTreeMap::new(),
            owner.clone(),
        );
        if let Err(e) = ctx.api.apply_deployment(&namespace, &deployment).await {
            return Err(degraded(&bench, &namespace, &name, ctx.as_ref(), component, e).await);
        }
    }

    // Workers: one probe per pass, shared by all three scaling decisions
    let keda = ctx.api.keda_available().await;
    let mut worker_scaling = BTreeMap::new();
    for worker in WorkerType::all() {
        let resolved = config::resolve_worker_autoscaling(&bench, worker);
        let mode = scaling::decide_scaling_mode(keda, &resolved);
        let worker_deployment = build_worker_deployment(
            &name,
            &namespace,
            worker,
            mode,
            &resolved,
            &image,
            &pod_settings,
            owner.clone(),
        );
        if let Err(e) = ctx.api.apply_deployment(&namespace, &worker_deployment).await {
            return Err(degraded(&bench, &namespace, &name, ctx.as_ref(), "worker", e).await);
        }

        // ScaledObject failures degrade to static scaling rather than failing
        // the whole reconciliation
        let so_name = resources::worker_name(&name, worker);
        match mode {
            ScalingMode::Autoscaled => {
                let so = scaling::scaled_object(&name, &namespace, worker, &resolved, owner.clone());
                if let Err(e) = ctx.api.apply_scaled_object(&namespace, &so_name, &so).await {
                    warn!(worker = %worker, error = %e, "failed to apply scaled object");
                }
            }
            ScalingMode::Static => {
                if let Err(e) = ctx.api.delete_scaled_object(&namespace, &so_name).await {
                    warn!(worker = %worker, error = %e, "failed to delete scaled object");
                }
            }
        }
        worker_scaling.insert(
            worker.to_string(),
            scaling::worker_scaling_status(mode, &resolved),
        );
    }

    let repo_names = config::merge_fpm_repositories(&bench, &settings)
        .into_iter()
        .map(|r| r.name)
        .collect();
    let mut status = BenchStatus::with_phase(Phase::Ready)
        .message("Bench is ready")
        .condition(Condition::new(
            "Ready",
            ConditionStatus::True,
            "AllChildrenReady",
            "all child resources applied",
        ))
        .condition(Condition::new(
            "Initialized",
            ConditionStatus::True,
            "InitJobSucceeded",
            "initialization complete",
        ))
        .installed_apps(installed_apps)
        .fpm_repositories(repo_names)
        .worker_scaling(worker_scaling)
        .observed_generation(bench.metadata.generation);
    if !skipped_apps.is_empty() {
        status = status.message(format!(
            "Bench is ready; skipped git apps (git sources disabled): {}",
            skipped_apps.join(", ")
        ));
    }
    ctx.api.patch_status(&namespace, &name, &status).await?;

    Ok(Action::requeue(REQUEUE_READY))
}

/// Staged deletion: block on Sites, drain workloads, delete storage, release
async fn handle_deletion(
    bench: &Bench,
    name: &str,
    namespace: &str,
    ctx: &BenchContext,
) -> Result<Action> {
    if !bench.finalizers().iter().any(|f| f == BENCH_FINALIZER) {
        // Nothing to release; let the API server finish the delete
        return Ok(Action::await_change());
    }

    let dependent = ctx
        .api
        .list_sites(namespace)
        .await?
        .into_iter()
        .filter(|s| s.spec.bench_ref == name)
        .count();

    // Dependent sites gate everything: no workload is touched and nothing is
    // scaled down until the count reaches zero.
    let mut drained = true;
    if dependent == 0 {
        for deployment_name in deployment_workload_names(name) {
            if let Some(deployment) = ctx.api.get_deployment(namespace, &deployment_name).await? {
                if !deployment_drained(&deployment) {
                    drained = false;
                }
                ctx.api.scale_deployment(namespace, &deployment_name, 0).await?;
            }
        }
        for set_name in stateful_set_workload_names(name) {
            if let Some(set) = ctx.api.get_stateful_set(namespace, &set_name).await? {
                if !stateful_set_drained(&set) {
                    drained = false;
                }
                ctx.api.scale_stateful_set(namespace, &set_name, 0).await?;
            }
        }
    }

    match decide_deletion_step(dependent, drained) {
        DeletionStep::BlockedOnSites(count) => {
            info!(sites = count, "deletion blocked on dependent sites");
            let status = BenchStatus::with_phase(Phase::Terminating)
                .message(format!("{count} dependent site(s) must be deleted first"))
                .condition(Condition::new(
                    "Terminating",
                    ConditionStatus::True,
                    "DeletionRequested",
                    "bench deletion in progress",
                ))
                .condition(Condition::new(
                    "DependentSitesExist",
                    ConditionStatus::True,
                    "SitesReferenceBench",
                    format!("{count} site(s) still reference this bench"),
                ))
                .observed_generation(bench.metadata.generation);
            ctx.api.patch_status(namespace, name, &status).await?;
            Ok(Action::requeue(REQUEUE_PENDING))
        }
        DeletionStep::AwaitDrain => {
            debug!("waiting for workloads to drain");
            let status = BenchStatus::with_phase(Phase::Terminating)
                .message("Waiting for workloads to drain")
                .condition(Condition::new(
                    "Terminating",
                    ConditionStatus::True,
                    "DeletionRequested",
                    "bench deletion in progress",
                ))
                .condition(Condition::new(
                    "DependentSitesExist",
                    ConditionStatus::False,
                    "NoSites",
                    "no sites reference this bench",
                ))
                .observed_generation(bench.metadata.generation);
            ctx.api.patch_status(namespace, name, &status).await?;
            Ok(Action::requeue(REQUEUE_PENDING))
        }
        DeletionStep::Finish => {
            info!("workloads drained, deleting storage and releasing finalizer");
            for worker in WorkerType::all() {
                let so_name = resources::worker_name(name, worker);
                if let Err(e) = ctx.api.delete_scaled_object(namespace, &so_name).await {
                    warn!(worker = %worker, error = %e, "failed to delete scaled object");
                }
            }
            ctx.api
                .delete_pvc(namespace, &resources::pvc_name(name))
                .await?;
            let finalizers: Vec<String> = bench
                .finalizers()
                .iter()
                .filter(|f| *f != BENCH_FINALIZER)
                .cloned()
                .collect();
            ctx.api
                .replace_finalizers(namespace, name, &finalizers)
                .await?;
            Ok(Action::await_change())
        }
    }
}

/// Error policy for the Bench controller
pub fn bench_error_policy(bench: Arc<Bench>, error: &Error, _ctx: Arc<BenchContext>) -> Action {
    error!(?error, bench = %bench.name_any(), "reconciliation failed");
    Action::requeue(REQUEUE_ERROR)
}

fn provisioning_status(bench: &Bench, message: &str) -> BenchStatus {
    BenchStatus::with_phase(Phase::Provisioning)
        .message(message)
        .condition(Condition::new(
            "Initialized",
            ConditionStatus::False,
            "InitJobRunning",
            message,
        ))
        .condition(Condition::new(
            "Progressing",
            ConditionStatus::True,
            "Reconciling",
            message,
        ))
        .observed_generation(bench.metadata.generation)
}

/// Surface a child-apply failure as a Degraded condition, then hand the
/// original error back for the error policy. The status write is best-effort;
/// the apply failure is the one worth reporting.
async fn degraded(
    bench: &Bench,
    namespace: &str,
    name: &str,
    ctx: &BenchContext,
    step: &str,
    err: Error,
) -> Error {
    warn!(step, error = %err, "child resource apply failed");
    let phase = bench
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or(Phase::Provisioning);
    let status = BenchStatus::with_phase(phase)
        .message(format!("{step} apply failed: {err}"))
        .condition(Condition::new(
            "Degraded",
            ConditionStatus::True,
            "ChildApplyFailed",
            format!("{step}: {err}"),
        ))
        .observed_generation(bench.metadata.generation);
    if let Err(patch_err) = ctx.api.patch_status(namespace, name, &status).await {
        warn!(error = %patch_err, "failed to record degraded condition");
    }
    err
}

/// Non-sensitive environment shared by every bench container
fn bench_env(bench: &str) -> Vec<(String, String)> {
    vec![
        (
            "REDIS_CACHE".to_string(),
            format!("redis://{}-redis-cache:6379", bench),
        ),
        (
            "REDIS_QUEUE".to_string(),
            format!("redis://{}", resources::redis_queue_address(bench)),
        ),
    ]
}

fn component_replicas(replicas: &crate::crd::ComponentReplicas, component: &str) -> i32 {
    match component {
        "gunicorn" => replicas.gunicorn,
        "nginx" => replicas.nginx,
        "socketio" => replicas.socketio,
        "scheduler" => replicas.scheduler,
        _ => None,
    }
    .unwrap_or(1)
}

fn component_args(component: &str) -> Vec<String> {
    match component {
        "gunicorn" => vec![],
        "nginx" => vec!["nginx-entrypoint.sh".to_string()],
        "socketio" => vec![
            "node".to_string(),
            "/home/frappe/frappe-bench/apps/frappe/socketio.js".to_string(),
        ],
        "scheduler" => vec!["bench".to_string(), "schedule".to_string()],
        other => vec![other.to_string()],
    }
}

#[allow(clippy::too_many_arguments)]
fn build_worker_deployment(
    bench: &str,
    namespace: &str,
    worker: WorkerType,
    mode: ScalingMode,
    resolved: &ResolvedWorkerAutoscaling,
    image: &str,
    settings: &PodSettings,
    owner: OwnerReference,
) -> Deployment {
    // Autoscaled workers leave replicas unset so the external autoscaler's
    // count is never overwritten
    let replicas = match mode {
        ScalingMode::Autoscaled => None,
        ScalingMode::Static => Some(resolved.static_replicas),
    };
    let container = ContainerSpec {
        name: "worker".to_string(),
        image: image.to_string(),
        args: vec![
            "bench".to_string(),
            "worker".to_string(),
            "--queue".to_string(),
            worker.queue().to_string(),
        ],
        env: bench_env(bench),
    };
    bench_deployment(
        bench,
        namespace,
        &format!("worker-{worker}"),
        replicas,
        container,
        settings,
        BTreeMap::new(),
        owner,
    )
}

/// Deployments subject to the drain gate: web tier plus workers
fn deployment_workload_names(bench: &str) -> Vec<String> {
    let mut names: Vec<String> = COMPONENTS
        .iter()
        .map(|c| resources::component_name(bench, c))
        .collect();
    names.extend(WorkerType::all().map(|w| resources::worker_name(bench, w)));
    names
}

/// StatefulSets subject to the drain gate: both redis tiers
fn stateful_set_workload_names(bench: &str) -> Vec<String> {
    vec![
        resources::redis_name(bench, "cache"),
        resources::redis_name(bench, "queue"),
    ]
}

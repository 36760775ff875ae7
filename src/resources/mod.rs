//! Builders for the child resources the operator manages.
//!
//! Everything here is pure: functions take resolved configuration and return
//! fully formed `k8s-openapi` objects. The reconcilers own all I/O, so the
//! desired shape of every child resource can be asserted in tests without a
//! cluster.
//!
//! Create/update idempotence is the caller's contract: "already exists" on
//! create and "not found" on delete are treated as success by the reconcilers.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PodSecurityContext, PodSpec, PodTemplateSpec, ResourceRequirements, Secret, SecretVolumeSource,
    SecurityContext, Service, ServicePort, ServiceSpec, Toleration as K8sToleration, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::core::ObjectMeta;

use crate::config::ResolvedSecurityContext;
use crate::crd::{PodConfig, StorageSpec, WorkerType};
use crate::CREDENTIALS_MOUNT_PATH;

/// Redis image used for the cache and queue backing services
pub const REDIS_IMAGE: &str = "docker.io/library/redis:7-alpine";

/// Mount point of the shared sites volume inside every bench container
pub const SITES_MOUNT_PATH: &str = "/home/frappe/frappe-bench/sites";

const SITES_SUBPATH: &str = "frappe-sites";
const SITES_VOLUME: &str = "sites";

// =============================================================================
// Naming
// =============================================================================

/// Name of the shared sites PVC for a bench
pub fn pvc_name(bench: &str) -> String {
    format!("{bench}-sites")
}

/// Name of the bench initialization job
pub fn init_job_name(bench: &str) -> String {
    format!("{bench}-init")
}

/// Name of a component deployment (gunicorn, nginx, socketio, scheduler)
pub fn component_name(bench: &str, component: &str) -> String {
    format!("{bench}-{component}")
}

/// Name of a worker deployment; also the ScaledObject name for that worker
pub fn worker_name(bench: &str, worker: WorkerType) -> String {
    format!("{bench}-worker-{worker}")
}

/// Name of a redis backing StatefulSet/Service ("cache" or "queue" tier)
pub fn redis_name(bench: &str, tier: &str) -> String {
    format!("{bench}-redis-{tier}")
}

/// Address of the queue redis, used by workers and the autoscaler trigger
pub fn redis_queue_address(bench: &str) -> String {
    format!("{}:6379", redis_name(bench, "queue"))
}

/// Name of a site's credentials Secret
pub fn site_secret_name(site: &str) -> String {
    format!("{site}-credentials")
}

/// Name of a site's initialization job
pub fn site_init_job_name(site: &str) -> String {
    format!("{site}-init")
}

// =============================================================================
// Labels
// =============================================================================

/// Base labels shared by every child resource of a bench
pub fn bench_labels(bench: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "bench".to_string()),
        ("app.kubernetes.io/instance".to_string(), bench.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "bench-operator".to_string(),
        ),
    ])
}

/// Labels for one component of a bench; used as deployment selectors, so the
/// component key must stay stable for the lifetime of the resource
pub fn component_labels(bench: &str, component: &str) -> BTreeMap<String, String> {
    let mut labels = bench_labels(bench);
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        component.to_string(),
    );
    labels
}

// =============================================================================
// Pod-level settings shared by all generated workloads
// =============================================================================

/// Resolved pod-level configuration threaded into every builder
#[derive(Clone, Debug)]
pub struct PodSettings {
    /// Effective security context after priority resolution
    pub security: ResolvedSecurityContext,
    /// Scheduling tweaks from the bench spec
    pub pod_config: Option<PodConfig>,
}

impl PodSettings {
    fn pod_security_context(&self) -> PodSecurityContext {
        PodSecurityContext {
            run_as_user: Some(self.security.run_as_user),
            run_as_group: Some(self.security.run_as_group),
            fs_group: Some(self.security.fs_group),
            ..Default::default()
        }
    }

    fn container_security_context(&self) -> SecurityContext {
        SecurityContext {
            run_as_user: Some(self.security.run_as_user),
            run_as_group: Some(self.security.run_as_group),
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }
    }

    fn node_selector(&self) -> Option<BTreeMap<String, String>> {
        self.pod_config.as_ref().and_then(|p| p.node_selector.clone())
    }

    fn tolerations(&self) -> Option<Vec<K8sToleration>> {
        self.pod_config.as_ref().and_then(|p| {
            p.tolerations.as_ref().map(|ts| {
                ts.iter()
                    .map(|t| K8sToleration {
                        key: t.key.clone(),
                        operator: t.operator.clone(),
                        value: t.value.clone(),
                        effect: t.effect.clone(),
                        ..Default::default()
                    })
                    .collect()
            })
        })
    }

    fn extra_labels(&self) -> BTreeMap<String, String> {
        self.pod_config
            .as_ref()
            .and_then(|p| p.extra_labels.clone())
            .unwrap_or_default()
    }
}

// =============================================================================
// Persistent storage
// =============================================================================

/// Shared sites PVC. Size and class are immutable after first creation; the
/// reconciler only ever creates this object, never updates it.
pub fn sites_pvc(
    bench: &str,
    namespace: &str,
    storage: Option<&StorageSpec>,
    owner: OwnerReference,
) -> PersistentVolumeClaim {
    let size = storage
        .and_then(|s| s.size.clone())
        .unwrap_or_else(|| "1Gi".to_string());
    let storage_class = storage.and_then(|s| s.storage_class_name.clone());

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(pvc_name(bench)),
            namespace: Some(namespace.to_string()),
            labels: Some(bench_labels(bench)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            storage_class_name: storage_class,
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Workloads
// =============================================================================

/// Container definition consumed by the deployment/job builders
#[derive(Clone, Debug)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Resolved image
    pub image: String,
    /// Process arguments
    pub args: Vec<String>,
    /// Non-sensitive environment variables only; credentials are file-mounted
    pub env: Vec<(String, String)>,
}

fn build_container(spec: &ContainerSpec, settings: &PodSettings, extra_mounts: Vec<VolumeMount>) -> Container {
    let mut mounts = vec![VolumeMount {
        name: SITES_VOLUME.to_string(),
        mount_path: SITES_MOUNT_PATH.to_string(),
        sub_path: Some(SITES_SUBPATH.to_string()),
        ..Default::default()
    }];
    mounts.extend(extra_mounts);

    Container {
        name: spec.name.clone(),
        image: Some(spec.image.clone()),
        args: if spec.args.is_empty() {
            None
        } else {
            Some(spec.args.clone())
        },
        env: Some(
            spec.env
                .iter()
                .map(|(name, value)| EnvVar {
                    name: name.clone(),
                    value: Some(value.clone()),
                    ..Default::default()
                })
                .collect(),
        ),
        volume_mounts: Some(mounts),
        security_context: Some(settings.container_security_context()),
        resources: Some(ResourceRequirements::default()),
        ..Default::default()
    }
}

fn pod_template(
    labels: BTreeMap<String, String>,
    container: Container,
    settings: &PodSettings,
    volumes: Vec<Volume>,
    restart_policy: Option<&str>,
) -> PodTemplateSpec {
    let mut pod_labels = labels;
    pod_labels.extend(settings.extra_labels());

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_labels),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            security_context: Some(settings.pod_security_context()),
            node_selector: settings.node_selector(),
            tolerations: settings.tolerations(),
            volumes: Some(volumes),
            restart_policy: restart_policy.map(String::from),
            ..Default::default()
        }),
    }
}

fn sites_volume(bench: &str) -> Volume {
    Volume {
        name: SITES_VOLUME.to_string(),
        persistent_volume_claim: Some(
            k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name(bench),
                ..Default::default()
            },
        ),
        ..Default::default()
    }
}

/// A bench component deployment (web tier, proxy, realtime, scheduler, worker).
///
/// `replicas: None` leaves the replica count untouched on the server, which is
/// how autoscaled workers avoid fighting the external autoscaler.
#[allow(clippy::too_many_arguments)]
pub fn bench_deployment(
    bench: &str,
    namespace: &str,
    component: &str,
    replicas: Option<i32>,
    container: ContainerSpec,
    settings: &PodSettings,
    annotations: BTreeMap<String, String>,
    owner: OwnerReference,
) -> Deployment {
    let selector = component_labels(bench, component);
    let container = build_container(&container, settings, vec![]);

    Deployment {
        metadata: ObjectMeta {
            name: Some(component_name(bench, component)),
            namespace: Some(namespace.to_string()),
            labels: Some(selector.clone()),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations)
            },
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas,
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: pod_template(
                selector,
                container,
                settings,
                vec![sites_volume(bench)],
                None,
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Redis backing StatefulSet for one tier ("cache" or "queue").
///
/// The selector is immutable in the API, so these labels must never change
/// for an existing bench.
pub fn redis_statefulset(
    bench: &str,
    namespace: &str,
    tier: &str,
    settings: &PodSettings,
    owner: OwnerReference,
) -> StatefulSet {
    let component = format!("redis-{tier}");
    let selector = component_labels(bench, &component);
    let name = redis_name(bench, tier);

    let container = Container {
        name: "redis".to_string(),
        image: Some(REDIS_IMAGE.to_string()),
        ports: Some(vec![ContainerPort {
            container_port: 6379,
            name: Some("redis".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(selector.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: name,
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: pod_template(selector, container, settings, vec![], None),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Headless Service fronting a redis tier
pub fn redis_service(bench: &str, namespace: &str, tier: &str, owner: OwnerReference) -> Service {
    let component = format!("redis-{tier}");
    let selector = component_labels(bench, &component);

    Service {
        metadata: ObjectMeta {
            name: Some(redis_name(bench, tier)),
            namespace: Some(namespace.to_string()),
            labels: Some(selector.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("redis".to_string()),
                port: 6379,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Bench initialization job. Created once and never recreated; a failed init
/// job is left in place for external diagnosis.
#[allow(clippy::too_many_arguments)]
pub fn bench_init_job(
    bench: &str,
    namespace: &str,
    container: ContainerSpec,
    settings: &PodSettings,
    owner: OwnerReference,
    ttl_seconds_after_finished: i32,
) -> Job {
    let labels = component_labels(bench, "init");
    let container = build_container(&container, settings, vec![]);

    Job {
        metadata: ObjectMeta {
            name: Some(init_job_name(bench)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(3),
            ttl_seconds_after_finished: Some(ttl_seconds_after_finished),
            template: pod_template(
                labels,
                container,
                settings,
                vec![sites_volume(bench)],
                Some("Never"),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Site credentials and initialization
// =============================================================================

/// All secret-classified values a site initialization consumes.
///
/// These are written into a Secret with fixed keys and mounted read-only;
/// they must never appear in any generated environment variable.
#[derive(Clone)]
pub struct SiteCredentials {
    /// Database host
    pub db_host: String,
    /// Database port
    pub db_port: String,
    /// Logical database name
    pub db_name: String,
    /// Database username
    pub db_user: String,
    /// Database password
    pub db_password: String,
    /// Site administrator password
    pub admin_password: String,
}

impl std::fmt::Debug for SiteCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Passwords stay out of debug output and logs
        f.debug_struct("SiteCredentials")
            .field("db_host", &self.db_host)
            .field("db_port", &self.db_port)
            .field("db_name", &self.db_name)
            .field("db_user", &self.db_user)
            .field("db_password", &"<redacted>")
            .field("admin_password", &"<redacted>")
            .finish()
    }
}

impl SiteCredentials {
    /// Fixed key layout consumed by file reads inside the init container
    pub fn into_string_data(self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("db-host".to_string(), self.db_host),
            ("db-port".to_string(), self.db_port),
            ("db-name".to_string(), self.db_name),
            ("db-user".to_string(), self.db_user),
            ("db-password".to_string(), self.db_password),
            ("admin-password".to_string(), self.admin_password),
        ])
    }
}

/// The site credentials Secret. Owned by the Site so it is garbage-collected
/// with it.
pub fn site_credentials_secret(
    site: &str,
    namespace: &str,
    credentials: SiteCredentials,
    owner: OwnerReference,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(site_secret_name(site)),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        string_data: Some(credentials.into_string_data()),
        ..Default::default()
    }
}

/// Site initialization job.
///
/// The credentials Secret is mounted read-only at [`CREDENTIALS_MOUNT_PATH`];
/// the container spec's env may carry only non-sensitive identifiers. The
/// caller is responsible for keeping credentials out of `container.env`.
#[allow(clippy::too_many_arguments)]
pub fn site_init_job(
    site: &str,
    bench: &str,
    namespace: &str,
    container: ContainerSpec,
    settings: &PodSettings,
    owner: OwnerReference,
    ttl_seconds_after_finished: i32,
) -> Job {
    let labels = component_labels(bench, &format!("site-init-{site}"));
    let secret_mount = VolumeMount {
        name: "credentials".to_string(),
        mount_path: CREDENTIALS_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    };
    let container = build_container(&container, settings, vec![secret_mount]);

    let volumes = vec![
        sites_volume(bench),
        Volume {
            name: "credentials".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(site_secret_name(site)),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    Job {
        metadata: ObjectMeta {
            name: Some(site_init_job_name(site)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(3),
            ttl_seconds_after_finished: Some(ttl_seconds_after_finished),
            template: pod_template(labels, container, settings, volumes, Some("Never")),
            ..Default::default()
        }),
        ..Default::default()
    }
}

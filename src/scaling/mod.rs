//! Worker autoscaling decisions and KEDA integration
//!
//! Workers scale on redis queue depth via KEDA ScaledObjects. KEDA is an
//! optional cluster capability: the probe fails open, so a flaky API server
//! never silently downgrades benches to static scaling. When autoscaling is
//! active the operator leaves the worker Deployment's replica count alone and
//! reports the scaling as externally managed.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::GroupVersionKind;
use kube::{Api, Client};
use serde_json::{json, Value};
use tracing::warn;

use crate::config::ResolvedWorkerAutoscaling;
use crate::crd::{ScalingMode, WorkerScalingStatus, WorkerType};
use crate::resources::{bench_labels, redis_queue_address, worker_name};

const KEDA_GROUP: &str = "keda.sh";
const KEDA_VERSION: &str = "v1alpha1";
const KEDA_CRD_NAME: &str = "scaledobjects.keda.sh";

/// GVK of KEDA's ScaledObject kind
pub fn scaled_object_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk(KEDA_GROUP, KEDA_VERSION, "ScaledObject")
}

/// Whether the cluster has the KEDA ScaledObject CRD installed.
///
/// Fails open: only a definitive "not installed" answer disables autoscaling.
/// A transient API error must not flip autoscaled benches to static mode, so
/// it is treated as available and the ScaledObject apply surfaces any real
/// problem.
pub async fn keda_available(client: &Client) -> bool {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    match api.get_opt(KEDA_CRD_NAME).await {
        Ok(Some(_)) => true,
        Ok(None) => false,
        Err(e) => {
            warn!(error = %e, "keda capability probe failed, assuming available");
            true
        }
    }
}

/// Decide the scaling mode for one worker.
///
/// Autoscaled only when both the bench asked for it and the cluster can do it.
pub fn decide_scaling_mode(
    keda_available: bool,
    resolved: &ResolvedWorkerAutoscaling,
) -> ScalingMode {
    if keda_available && resolved.enabled {
        ScalingMode::Autoscaled
    } else {
        ScalingMode::Static
    }
}

/// The status entry reported for one worker's scaling decision
pub fn worker_scaling_status(
    mode: ScalingMode,
    resolved: &ResolvedWorkerAutoscaling,
) -> WorkerScalingStatus {
    match mode {
        ScalingMode::Autoscaled => WorkerScalingStatus {
            mode,
            current_replicas: None,
            desired_replicas: None,
            externally_managed: true,
        },
        ScalingMode::Static => WorkerScalingStatus {
            mode,
            current_replicas: Some(resolved.static_replicas),
            desired_replicas: Some(resolved.static_replicas),
            externally_managed: false,
        },
    }
}

/// ScaledObject for one worker deployment, scaling on redis queue depth.
///
/// KEDA's schema is foreign to this crate, so the object is synthesized as
/// JSON and applied dynamically. Name matches the worker deployment.
pub fn scaled_object(
    bench: &str,
    namespace: &str,
    worker: WorkerType,
    resolved: &ResolvedWorkerAutoscaling,
    owner: OwnerReference,
) -> Value {
    let name = worker_name(bench, worker);
    json!({
        "apiVersion": format!("{KEDA_GROUP}/{KEDA_VERSION}"),
        "kind": "ScaledObject",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": bench_labels(bench),
            "ownerReferences": [owner],
        },
        "spec": {
            "scaleTargetRef": {
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "name": name,
            },
            "minReplicaCount": resolved.min_replicas,
            "maxReplicaCount": resolved.max_replicas,
            "pollingInterval": resolved.polling_interval,
            "cooldownPeriod": resolved.cooldown_period,
            "triggers": [
                {
                    "type": "redis",
                    "metadata": {
                        "address": redis_queue_address(bench),
                        "listName": format!("rq:queue:{}", worker.queue()),
                        "listLength": resolved.queue_length.to_string(),
                        "activationListLength": "1",
                        "databaseIndex": "0",
                        "enableTLS": "false",
                    }
                }
            ],
        },
    })
}

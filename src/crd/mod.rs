//! Custom Resource Definitions for the Bench operator
//!
//! This module contains all CRD definitions watched by the operator.

mod bench;
mod site;
mod types;

pub use bench::{Bench, BenchSpec, BenchStatus};
pub use site::{Site, SiteSpec, SiteStatus};
pub use types::{
    is_safe_app_name, AppSource, AppSpec, ComponentReplicas, Condition, ConditionStatus,
    DatabaseConfig, DatabaseMode, FpmRepository, ImageSpec, LocalObjectReference, Phase, PodConfig,
    ScalingMode, SecurityContextConfig, StorageSpec, Toleration, WorkerAutoscaling, WorkerConfigs,
    WorkerScalingStatus, WorkerType,
};

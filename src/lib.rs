//! Bench Operator - Kubernetes operator for Bench platform installations and tenant Sites
//!
//! The operator watches two custom resources:
//! - A `Bench` is one platform installation: web tier, workers, scheduler, cache/queue
//!   backing services, and a shared sites volume.
//! - A `Site` is one tenant attached to exactly one Bench, with its own database and
//!   credentials.
//!
//! Each reconciliation pass is short-lived and non-blocking: anything not yet ready is
//! expressed as a requeue, never as an in-process wait. Databases are provisioned
//! through a pluggable provider layer that can be wrapped in a circuit breaker so a
//! misbehaving upstream fails fast instead of stalling the reconcile queue.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Bench, Site)
//! - [`controller`] - Reconciliation logic for both resources
//! - [`config`] - Operator settings snapshot and priority-chain resolvers
//! - [`database`] - Database provider abstraction (MariaDB, External, SQLite, Postgres)
//! - [`circuit`] - Circuit breaker gating calls to external dependencies
//! - [`resources`] - Idempotent child-resource synchronization
//! - [`scaling`] - Worker autoscaling decision engine and KEDA integration
//! - [`retry`] - Retry with exponential backoff for transient failures
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod circuit;
pub mod config;
pub mod controller;
pub mod crd;
pub mod database;
pub mod error;
pub mod resources;
pub mod retry;
pub mod scaling;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralizing these here keeps CRD defaults, controller behavior, and test
// fixtures consistent.

/// API group for all operator-owned custom resources
pub const API_GROUP: &str = "benchops.dev";

/// Finalizer attached to every Bench while the operator owns its teardown
pub const BENCH_FINALIZER: &str = "benchops.dev/bench-finalizer";

/// Finalizer attached to every Site while the operator owns its teardown
pub const SITE_FINALIZER: &str = "benchops.dev/site-finalizer";

/// Name of the optional operator-wide settings ConfigMap
pub const OPERATOR_CONFIGMAP: &str = "bench-operator-config";

/// Annotation opting a Bench out of asset-build steps in generated jobs
pub const SKIP_ASSET_BUILD_ANNOTATION: &str = "benchops.dev/skip-asset-build";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "bench-operator";

/// Image used when neither the Bench spec nor operator settings name one
pub const DEFAULT_IMAGE_REPOSITORY: &str = "docker.io/frappe/erpnext";

/// Default per-kind ceiling for concurrent Site reconciliations
pub const DEFAULT_MAX_CONCURRENT_SITE_RECONCILES: usize = 10;

/// Environment variable raising the Site reconcile concurrency ceiling
pub const MAX_CONCURRENT_SITE_RECONCILES_ENV: &str = "MAX_CONCURRENT_SITE_RECONCILES";

/// Path where the site credentials Secret is mounted read-only in init jobs
pub const CREDENTIALS_MOUNT_PATH: &str = "/etc/site-credentials";

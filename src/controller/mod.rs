//! Controller implementations for the Bench operator CRDs
//!
//! This module contains the reconciliation logic for Bench and Site resources.
//! Controllers follow the Kubernetes controller pattern with observe-diff-act
//! loops; all cluster I/O goes through narrow trait seams so the decision
//! logic is testable without a cluster.

mod bench;
mod site;

pub use bench::{
    bench_error_policy, reconcile_bench, BenchApi, BenchContext, DeletionStep, KubeBenchApi,
};
pub use site::{reconcile_site, site_error_policy, KubeSiteApi, SiteApi, SiteContext};

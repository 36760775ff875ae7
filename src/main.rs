//! Bench Operator - Kubernetes operator for Bench platform installations and tenant Sites

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bench_operator::controller::{
    bench_error_policy, reconcile_bench, reconcile_site, site_error_policy, BenchContext,
    SiteContext,
};
use bench_operator::crd::{Bench, Site};
use bench_operator::{
    DEFAULT_MAX_CONCURRENT_SITE_RECONCILES, FIELD_MANAGER, MAX_CONCURRENT_SITE_RECONCILES_ENV,
};

/// Bench operator - CRD-driven management of Bench installations and tenant Sites
#[derive(Parser, Debug)]
#[command(name = "bench-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches Bench and Site CRDs in all namespaces and reconciles them
    /// into deployments, jobs, backing services, and databases.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    // This MUST succeed for the application to operate securely.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install FIPS-validated crypto provider: {:?}. \
             The application cannot operate securely without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML for both resources
        let bench_crd = serde_yaml::to_string(&Bench::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Bench CRD: {}", e))?;
        let site_crd = serde_yaml::to_string(&Site::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Site CRD: {}", e))?;
        println!("{bench_crd}---\n{site_crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller) | None => run_controller().await,
    }
}

/// Ensure both operator CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply so
/// the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing Bench CRD...");
    crds.patch("benches.benchops.dev", &params, &Patch::Apply(&Bench::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install Bench CRD: {}", e))?;

    tracing::info!("Installing Site CRD...");
    crds.patch("sites.benchops.dev", &params, &Patch::Apply(&Site::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install Site CRD: {}", e))?;

    tracing::info!("All operator CRDs installed/updated");
    Ok(())
}

/// Ceiling for concurrent Site reconciliations, overridable via environment
fn site_concurrency() -> u16 {
    std::env::var(MAX_CONCURRENT_SITE_RECONCILES_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_CONCURRENT_SITE_RECONCILES as u16)
}

/// Run in controller mode - manages Benches and Sites
async fn run_controller() -> anyhow::Result<()> {
    tracing::info!("Bench operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // Operator installs its own CRDs on startup
    ensure_crds_installed(&client).await?;

    let benches: Api<Bench> = Api::all(client.clone());
    let sites: Api<Site> = Api::all(client.clone());

    let bench_ctx = Arc::new(BenchContext::new(client.clone()));
    let site_ctx = Arc::new(SiteContext::new(client));

    // Any Bench may raise the cluster-wide site reconcile ceiling
    let requested_by_benches = benches
        .list(&Default::default())
        .await
        .map(|list| {
            list.items
                .iter()
                .filter_map(|b| b.spec.site_reconcile_concurrency)
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    let concurrency = site_concurrency().max(requested_by_benches as u16);
    tracing::info!("Starting Bench operator controllers...");
    tracing::info!("  - Bench controller");
    tracing::info!(concurrency, "  - Site controller");

    let bench_controller = Controller::new(benches, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile_bench, bench_error_policy, bench_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Bench reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Bench reconciliation error");
                }
            }
        });

    // Sites reconcile concurrently up to the ceiling; one slow database
    // provider must not serialize every tenant behind it
    let site_controller = Controller::new(sites, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile_site, site_error_policy, site_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Site reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Site reconciliation error");
                }
            }
        });

    // Run both controllers concurrently
    tokio::select! {
        _ = bench_controller => {
            tracing::info!("Bench controller completed");
        }
        _ = site_controller => {
            tracing::info!("Site controller completed");
        }
    }

    tracing::info!("Bench operator shutting down");
    Ok(())
}

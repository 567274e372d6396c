//! lbsync: plan load balancer reconciliations against a cloud snapshot.
//!
//! Loads a service descriptor, its backends and a recorded cloud state into
//! the in-memory cloud, runs one provider operation and prints the resulting
//! status, the remote calls issued and the final state as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lbsync::{
    AuditLogger, Call, CloudSnapshot, Instance, LoadBalancerProvider, LoadBalancerStatus,
    MemoryCloud, ReconcilerConfig, ServiceDescriptor,
};

/// Load balancer reconciliation planner
#[derive(Parser, Debug)]
#[command(name = "lbsync", version, about)]
struct Cli {
    /// Reconciler configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Converge the service's load balancer and show the calls made
    Plan(Inputs),
    /// Show the status of the service's load balancer
    Status(Inputs),
    /// Delete the service's load balancer
    Delete(Inputs),
}

#[derive(Args, Debug)]
struct Inputs {
    /// Service descriptor (JSON)
    #[arg(long)]
    service: PathBuf,

    /// Cloud snapshot to start from (JSON)
    #[arg(long)]
    state: PathBuf,

    /// Backend instances (JSON array)
    #[arg(long)]
    instances: Option<PathBuf>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    load_balancer: String,
    status: Option<LoadBalancerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    calls: Vec<Call>,
    state: CloudSnapshot,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr, the report to stdout
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lbsync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => read_json(path)?,
        None => ReconcilerConfig::default(),
    };
    debug!("Reconciler config: {:?}", config);

    let inputs = match &cli.command {
        Commands::Plan(inputs) | Commands::Status(inputs) | Commands::Delete(inputs) => inputs,
    };
    let service: ServiceDescriptor = read_json(&inputs.service)?;
    let snapshot: CloudSnapshot = read_json(&inputs.state)?;
    let instances: Vec<Instance> = match &inputs.instances {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };

    let cloud = Arc::new(MemoryCloud::from_snapshot(snapshot));
    let provider = LoadBalancerProvider::with_api(cloud.clone(), config, AuditLogger::tracing());
    let name = service.load_balancer_name();
    info!(
        "Service {}/{} maps to load balancer {}",
        service.namespace, service.name, name
    );

    let result = match cli.command {
        Commands::Plan(_) => provider
            .ensure_load_balancer(&service, &instances)
            .await
            .map(Some),
        Commands::Status(_) => provider.get_load_balancer(&service).await,
        Commands::Delete(_) => provider
            .ensure_load_balancer_deleted(&service)
            .await
            .map(|()| None),
    };

    let (status, error) = match result {
        Ok(status) => (status, None),
        Err(e) => (None, Some(e)),
    };
    let report = Report {
        load_balancer: name,
        status,
        error: error.as_ref().map(|e| e.to_string()),
        calls: cloud.calls().await,
        state: cloud.snapshot().await,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    match error {
        Some(e) => Err(e).context("reconciliation failed"),
        None => Ok(()),
    }
}

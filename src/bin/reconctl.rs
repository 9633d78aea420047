//! # reconctl
//!
//! Operator CLI for the GitOps reconciler.
//!
//! Offline commands work on a manifest directory; online commands talk to a
//! running controller's HTTP surface.
//!
//! ```bash
//! # Validate units and print the reconciliation order
//! reconctl check ./manifests
//!
//! # Print the composed documents a unit would apply
//! reconctl build ./manifests apps/web
//!
//! # Show status of every unit, or one unit
//! reconctl status
//! reconctl status apps/web --server http://localhost:5000
//!
//! # Force the next pass of a unit
//! reconctl reconcile apps/web
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gitops_reconciler::constants::{DEFAULT_SCOPE, DEFAULT_UNIT_INTERVAL};
use gitops_reconciler::controller::loader::{load_units, UnitWorkload};
use gitops_reconciler::controller::reconciler::apply::build_desired_set;
use gitops_reconciler::controller::scheduler::DependencyGraph;
use gitops_reconciler::controller::secrets::MaterializedOutputs;
use gitops_reconciler::controller::validation::parse_kubernetes_duration;
use gitops_reconciler::crd::UnitId;
use gitops_reconciler::source::DirectorySource;
use serde_json::Value;
use std::path::PathBuf;

/// GitOps reconciler CLI
#[derive(Parser)]
#[command(name = "reconctl")]
#[command(about = "GitOps reconciler CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Controller HTTP address for online commands
    #[arg(short, long, global = true, default_value = "http://localhost:5000")]
    server: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the units of a manifest directory and print their order
    Check {
        /// Manifest directory
        path: PathBuf,
    },
    /// Print the composed documents of one unit
    Build {
        /// Manifest directory
        path: PathBuf,
        /// Unit as `scope/name` (scope defaults to "default")
        unit: String,
    },
    /// Show unit status from a running controller
    Status {
        /// Unit as `scope/name`; all units when omitted
        unit: Option<String>,
    },
    /// Force the next pass of a unit
    Reconcile {
        /// Unit as `scope/name`
        unit: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { path } => check(path),
        Commands::Build { path, unit } => build(path, &unit),
        Commands::Status { unit } => status(&cli.server, unit.as_deref()).await,
        Commands::Reconcile { unit } => reconcile(&cli.server, &unit).await,
    }
}

fn load_graph(path: PathBuf) -> Result<(gitops_reconciler::source::Snapshot, DependencyGraph)> {
    let snapshot = DirectorySource::new(path)
        .load()
        .context("Failed to read manifest directory")?;
    let interval = parse_kubernetes_duration(DEFAULT_UNIT_INTERVAL)
        .context("Invalid default unit interval")?;
    let units = load_units(&snapshot, interval)?;
    let graph = DependencyGraph::build(units)?;
    Ok((snapshot, graph))
}

fn check(path: PathBuf) -> Result<()> {
    let (snapshot, graph) = load_graph(path)?;
    println!("Revision: {}", snapshot.revision());
    println!("{} unit(s), in reconciliation order:", graph.len());
    for id in graph.topological_order() {
        let Some(unit) = graph.get(&id) else {
            continue;
        };
        let deps: Vec<String> = unit.depends_on.iter().map(ToString::to_string).collect();
        let suspended = if unit.suspend { " (suspended)" } else { "" };
        if deps.is_empty() {
            println!("  {id} [{}]{suspended}", unit.kind());
        } else {
            println!("  {id} [{}] <- {}{suspended}", unit.kind(), deps.join(", "));
        }
    }
    Ok(())
}

fn build(path: PathBuf, unit: &str) -> Result<()> {
    let (snapshot, graph) = load_graph(path)?;
    let id = UnitId::parse(unit, DEFAULT_SCOPE);
    let Some(unit) = graph.get(&id) else {
        bail!("unknown unit {id}");
    };
    let UnitWorkload::Manifests {
        source_path,
        patches,
        ..
    } = &unit.workload
    else {
        bail!("{id} is a SecretTemplate; its output depends on the source secret and is not built offline");
    };

    let desired = build_desired_set(&id, &snapshot, source_path, patches, &MaterializedOutputs::new())?;
    for (resource, error) in &desired.resource_errors {
        eprintln!("warning: {resource}: {error}");
    }
    for document in desired.documents {
        println!("---");
        print!("{}", serde_yaml::to_string(&document.into_body())?);
    }
    Ok(())
}

async fn status(server: &str, unit: Option<&str>) -> Result<()> {
    let url = match unit {
        Some(unit) => {
            let id = UnitId::parse(unit, DEFAULT_SCOPE);
            format!("{}/status/{}/{}", server.trim_end_matches('/'), id.scope, id.name)
        }
        None => format!("{}/status", server.trim_end_matches('/')),
    };
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach controller at {server}"))?;
    if !response.status().is_success() {
        bail!("{} returned {}", url, response.status());
    }
    let body: Value = response.json().await.context("Invalid status response")?;

    match body.get("units").and_then(Value::as_array) {
        Some(units) => {
            if let Some(error) = body.get("loadError").and_then(Value::as_str) {
                println!("Snapshot load error: {error}");
            }
            println!("{:<40} {:<12} {:<10} {}", "UNIT", "STATE", "GENERATION", "LAST ERROR");
            for unit in units {
                print_row(unit);
            }
        }
        None => println!("{}", serde_json::to_string_pretty(&body)?),
    }
    Ok(())
}

fn print_row(unit: &Value) {
    let field = |key: &str| unit.get(key).and_then(Value::as_str).unwrap_or("-").to_string();
    let generation = unit.get("generation").and_then(Value::as_u64).unwrap_or_default();
    println!(
        "{:<40} {:<12} {:<10} {}",
        field("id"),
        field("state"),
        generation,
        field("lastError")
    );
}

async fn reconcile(server: &str, unit: &str) -> Result<()> {
    let id = UnitId::parse(unit, DEFAULT_SCOPE);
    let url = format!(
        "{}/units/{}/{}/reconcile",
        server.trim_end_matches('/'),
        id.scope,
        id.name
    );
    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("Failed to reach controller at {server}"))?;
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let error = body.get("error").and_then(Value::as_str).unwrap_or("request failed");
        bail!("{id}: {error} ({status})");
    }
    println!(
        "Reconciliation requested for {id} (generation {})",
        body.get("generation").and_then(Value::as_u64).unwrap_or_default()
    );
    Ok(())
}

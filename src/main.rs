//! # GitOps Reconciler
//!
//! Drives a target environment toward the desired state declared in a
//! manifest tree.
//!
//! Units (`Unit` and `SecretTemplate` documents) are read from the tree on
//! every new revision, ordered by their `dependsOn` edges, and reconciled
//! with bounded concurrency: a unit is only reconciled once all of its
//! dependencies are Ready. See `README.md` for configuration keys.

use anyhow::Result;
use gitops_reconciler::runtime::initialization::initialize;
use gitops_reconciler::runtime::run_loop::run_controller;

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;
    run_controller(init).await
}

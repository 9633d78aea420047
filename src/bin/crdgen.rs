//! # CRD Generator
//!
//! Prints the `Unit` and `SecretTemplate` CustomResourceDefinitions as a
//! multi-document YAML stream.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/reconcile.gitops.io.yaml
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use anyhow::{Context, Result};
use gitops_reconciler::crd::{SecretTemplate, Unit};
use kube::core::CustomResourceExt;

fn main() -> Result<()> {
    let crds = [Unit::crd(), SecretTemplate::crd()];
    let mut out = String::new();
    for crd in &crds {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(crd).context("Failed to serialize CRD")?);
    }
    print!("{out}");
    Ok(())
}

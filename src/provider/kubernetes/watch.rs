//! # Source Secret Watch Loop
//!
//! Watches `Secret` objects across all namespaces and reports changes, so that
//! an operator bumping the force-refresh annotation (or rotating the secret)
//! re-renders dependent secret units without waiting for their interval.
//!
//! Only changes to a secret's data or to its force-refresh annotation are
//! reported; label and status churn is ignored.

use futures::{pin_mut, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use kube_runtime::watcher;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::constants::FORCE_REFRESH_ANNOTATION;
use crate::crd::SecretSourceRef;

/// Start watching source secrets
///
/// Every relevant change after the initial list is sent on `changes`; the
/// receiver decides which units, if any, reference the secret.
pub fn start_source_secret_watch(client: Client, changes: mpsc::UnboundedSender<SecretSourceRef>) {
    tokio::spawn(async move {
        let secrets: Api<Secret> = Api::all(client);
        info!("Starting watch for source secrets across all namespaces");

        let stream = watcher(secrets, watcher::Config::default());
        pin_mut!(stream);
        let mut seen: BTreeMap<SecretSourceRef, String> = BTreeMap::new();

        while let Some(event_result) = stream.next().await {
            match event_result {
                Ok(watcher::Event::InitApply(secret)) => {
                    if let Some(reference) = reference_of(&secret) {
                        seen.insert(reference, fingerprint(&secret));
                    }
                }
                Ok(watcher::Event::Apply(secret)) => {
                    let Some(reference) = reference_of(&secret) else {
                        continue;
                    };
                    let current = fingerprint(&secret);
                    if seen.get(&reference) == Some(&current) {
                        continue;
                    }
                    seen.insert(reference.clone(), current);
                    debug!(source = %reference, "Source secret changed");
                    if changes.send(reference).is_err() {
                        break;
                    }
                }
                Ok(watcher::Event::Delete(secret)) => {
                    let Some(reference) = reference_of(&secret) else {
                        continue;
                    };
                    seen.remove(&reference);
                    debug!(source = %reference, "Source secret deleted");
                    if changes.send(reference).is_err() {
                        break;
                    }
                }
                Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
                Err(e) => {
                    warn!("Error watching source secrets: {}", e);
                }
            }
        }

        warn!("Source secret watch stream ended");
    });
}

fn reference_of(secret: &Secret) -> Option<SecretSourceRef> {
    Some(SecretSourceRef {
        name: secret.metadata.name.clone()?,
        namespace: secret.metadata.namespace.clone(),
    })
}

/// Digest of what a render depends on: data plus the force-refresh annotation
fn fingerprint(secret: &Secret) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in secret.data.iter().flatten() {
        hasher.update(key.as_bytes());
        hasher.update([0]);
        hasher.update(&value.0);
        hasher.update([0]);
    }
    if let Some(requested) = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(FORCE_REFRESH_ANNOTATION))
    {
        hasher.update(requested.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    fn secret(password: &str, requested_at: Option<&str>, label: Option<&str>) -> Secret {
        let mut secret = Secret::default();
        secret.metadata.name = Some("postgres-root".to_string());
        secret.metadata.namespace = Some("vault-sync".to_string());
        secret.data = Some(BTreeMap::from([(
            "password".to_string(),
            ByteString(password.as_bytes().to_vec()),
        )]));
        secret.metadata.annotations = requested_at
            .map(|at| BTreeMap::from([(FORCE_REFRESH_ANNOTATION.to_string(), at.to_string())]));
        secret.metadata.labels =
            label.map(|l| BTreeMap::from([("team".to_string(), l.to_string())]));
        secret
    }

    #[test]
    fn test_fingerprint_tracks_data_and_refresh_annotation() {
        let base = fingerprint(&secret("s3cret", None, None));
        assert_eq!(base, fingerprint(&secret("s3cret", None, Some("payments"))));
        assert_ne!(base, fingerprint(&secret("rotated", None, None)));
        assert_ne!(base, fingerprint(&secret("s3cret", Some("2026-01-01T00:00:00Z"), None)));
    }

    #[test]
    fn test_reference_of() {
        let reference = reference_of(&secret("x", None, None)).unwrap();
        assert_eq!(reference.to_string(), "vault-sync/postgres-root");
    }
}

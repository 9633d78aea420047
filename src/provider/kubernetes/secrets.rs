//! # Kubernetes Secret Source
//!
//! Reads source secrets from `Secret` objects.
//!
//! Secrets do not reliably carry `metadata.generation`, so the source
//! generation is taken from, in order: the `reconcile.gitops.io/generation`
//! annotation, `metadata.generation`, then `metadata.resourceVersion`.

use super::api_error_code;
use crate::constants::GENERATION_ANNOTATION;
use crate::crd::SecretSourceRef;
use crate::provider::{SecretSourceError, SecretSourceProvider, SourceSecret};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use std::collections::BTreeMap;
use zeroize::Zeroizing;

pub struct KubeSecretSource {
    client: Client,
}

impl std::fmt::Debug for KubeSecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSecretSource").finish_non_exhaustive()
    }
}

impl KubeSecretSource {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Source generation of a Secret object
pub(crate) fn secret_generation(secret: &Secret) -> Option<u64> {
    let metadata = &secret.metadata;
    metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(GENERATION_ANNOTATION))
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| metadata.generation.and_then(|g| u64::try_from(g).ok()))
        .or_else(|| {
            metadata
                .resource_version
                .as_deref()
                .and_then(|v| v.parse().ok())
        })
}

fn secret_fields(
    secret: &Secret,
    reference: &str,
) -> Result<BTreeMap<String, Zeroizing<String>>, SecretSourceError> {
    let mut fields = BTreeMap::new();
    if let Some(data) = &secret.data {
        for (key, value) in data {
            let text = String::from_utf8(value.0.clone()).map_err(|e| {
                SecretSourceError::Unreadable {
                    secret: reference.to_string(),
                    reason: format!("field '{key}' is not valid UTF-8: {}", e.utf8_error()),
                }
            })?;
            fields.insert(key.clone(), Zeroizing::new(text));
        }
    }
    if let Some(string_data) = &secret.string_data {
        for (key, value) in string_data {
            fields.insert(key.clone(), Zeroizing::new(value.clone()));
        }
    }
    Ok(fields)
}

#[async_trait]
impl SecretSourceProvider for KubeSecretSource {
    async fn read(&self, source: &SecretSourceRef) -> Result<SourceSecret, SecretSourceError> {
        let namespace = source.namespace.as_deref().unwrap_or("default");
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let reference = source.to_string();

        let secret = match api.get_opt(&source.name).await {
            Ok(Some(secret)) => secret,
            Ok(None) => return Err(SecretSourceError::NotFound(reference)),
            Err(e) if api_error_code(&e) == Some(403) => {
                return Err(SecretSourceError::Unreadable {
                    secret: reference,
                    reason: e.to_string(),
                })
            }
            Err(e) => return Err(SecretSourceError::Transport(e.to_string())),
        };

        let generation = secret_generation(&secret).ok_or_else(|| SecretSourceError::Unreadable {
            secret: reference.clone(),
            reason: "no generation or resourceVersion".to_string(),
        })?;
        let fields = secret_fields(&secret, &reference)?;
        Ok(SourceSecret { generation, fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;

    fn secret(annotation: Option<&str>, resource_version: Option<&str>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("root".to_string()),
                annotations: annotation.map(|a| {
                    BTreeMap::from([(GENERATION_ANNOTATION.to_string(), a.to_string())])
                }),
                resource_version: resource_version.map(ToString::to_string),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "password".to_string(),
                ByteString(b"s3cret".to_vec()),
            )])),
            ..Default::default()
        }
    }

    #[test]
    fn test_generation_prefers_annotation() {
        assert_eq!(secret_generation(&secret(Some("7"), Some("1200"))), Some(7));
        assert_eq!(secret_generation(&secret(None, Some("1200"))), Some(1200));
        assert_eq!(secret_generation(&secret(None, None)), None);
    }

    #[test]
    fn test_fields_are_decoded() {
        let fields = secret_fields(&secret(None, Some("1")), "vault/root").unwrap();
        assert_eq!(fields["password"].as_str(), "s3cret");
    }
}

//! # Kubernetes Validation
//!
//! Validates unit names and scopes per RFC 1123.

use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;

static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("name regex is valid")
});

static NAMESPACE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("namespace regex is valid"));

/// Validate Kubernetes resource name (RFC 1123 subdomain)
/// Format: lowercase alphanumeric, hyphens, dots
/// Length: 1-253 characters
/// Cannot start or end with hyphen or dot
pub fn validate_kubernetes_name(name: &str, field_name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow::anyhow!("{field_name} cannot be empty"));
    }

    if name.len() > 253 {
        return Err(anyhow::anyhow!(
            "{field_name} '{name}' exceeds maximum length of 253 characters (got {})",
            name.len()
        ));
    }

    if !NAME_REGEX.is_match(name) {
        return Err(anyhow::anyhow!(
            "{field_name} '{name}' must be a valid Kubernetes name (lowercase alphanumeric, hyphens, dots; cannot start/end with hyphen or dot)"
        ));
    }

    Ok(())
}

/// Validate Kubernetes namespace (RFC 1123 label)
/// Format: lowercase alphanumeric, hyphens
/// Length: 1-63 characters
pub fn validate_kubernetes_namespace(namespace: &str, field_name: &str) -> Result<()> {
    if namespace.is_empty() {
        return Err(anyhow::anyhow!("{field_name} cannot be empty"));
    }

    if namespace.len() > 63 {
        return Err(anyhow::anyhow!(
            "{field_name} '{namespace}' exceeds maximum length of 63 characters (got {})",
            namespace.len()
        ));
    }

    if !NAMESPACE_REGEX.is_match(namespace) {
        return Err(anyhow::anyhow!(
            "{field_name} '{namespace}' must be a valid Kubernetes namespace (lowercase alphanumeric, hyphens; cannot start/end with hyphen)"
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(validate_kubernetes_name("cert-manager", "name").is_ok());
        assert!(validate_kubernetes_name("app.v2", "name").is_ok());
        assert!(validate_kubernetes_namespace("infra", "namespace").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(validate_kubernetes_name("", "name").is_err());
        assert!(validate_kubernetes_name("Web", "name").is_err());
        assert!(validate_kubernetes_name("-web", "name").is_err());
        assert!(validate_kubernetes_name(&"a".repeat(254), "name").is_err());
        assert!(validate_kubernetes_namespace("apps.prod", "namespace").is_err());
        assert!(validate_kubernetes_namespace(&"a".repeat(64), "namespace").is_err());
    }
}

//! # Patch Compositor
//!
//! Merges a base document set with ordered overlay patches.
//!
//! Composition is a pure function of its inputs: documents keep their base
//! order, and every target is resolved against the current (already patched)
//! set. A selector must match exactly one document. Operations address a
//! JSON pointer (RFC 6901):
//!
//! | op      | existing path      | missing path (parent exists) |
//! |---------|--------------------|------------------------------|
//! | add     | overwrite / insert | insert (`-` appends)         |
//! | replace | overwrite          | InvalidOperation             |
//! | remove  | delete             | InvalidOperation             |

use crate::controller::secrets::MaterializedOutputs;
use crate::crd::{PatchOp, PatchOperation, PatchSpec, TargetSelector, UnitId};
use crate::manifest::ManifestDocument;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("patch {patch}: no document matches {target}")]
    TargetNotFound { patch: usize, target: String },
    #[error("patch {patch}: {matches} documents match {target}")]
    AmbiguousTarget {
        patch: usize,
        target: String,
        matches: usize,
    },
    #[error("patch {patch} on {target}: {op} '{path}': {reason}")]
    InvalidOperation {
        patch: usize,
        target: String,
        op: &'static str,
        path: String,
        reason: String,
    },
}

/// Apply `patches` in order to `base`
///
/// `scope` is the patching unit's scope, used to resolve `valueFrom` unit names.
pub fn compose(
    base: &[ManifestDocument],
    patches: &[PatchSpec],
    outputs: &MaterializedOutputs,
    scope: &str,
) -> Result<Vec<ManifestDocument>, PatchError> {
    let mut documents = base.to_vec();

    for (index, patch) in patches.iter().enumerate() {
        let position = resolve_target(&documents, &patch.target, index)?;
        let target = patch.target.to_string();
        let original_scope = documents[position].id().scope.clone();
        let mut body = documents[position].body().clone();

        for operation in &patch.operations {
            let invalid = |reason: String| PatchError::InvalidOperation {
                patch: index,
                target: target.clone(),
                op: operation.op.as_str(),
                path: operation.path.clone(),
                reason,
            };
            let value = operation_value(operation, outputs, scope).map_err(invalid)?;
            apply_operation(&mut body, operation.op, &operation.path, value).map_err(invalid)?;
        }

        documents[position] = ManifestDocument::from_value(body, &original_scope).map_err(|e| {
            PatchError::InvalidOperation {
                patch: index,
                target: target.clone(),
                op: "compose",
                path: String::new(),
                reason: format!("patched document lost its identity: {e}"),
            }
        })?;
    }

    Ok(documents)
}

fn matches(document: &ManifestDocument, selector: &TargetSelector) -> bool {
    let id = document.id();
    id.kind == selector.kind
        && id.name == selector.name
        && selector.namespace.as_ref().map_or(true, |ns| *ns == id.scope)
}

fn resolve_target(
    documents: &[ManifestDocument],
    selector: &TargetSelector,
    patch: usize,
) -> Result<usize, PatchError> {
    let mut found = documents
        .iter()
        .enumerate()
        .filter(|(_, doc)| matches(doc, selector))
        .map(|(i, _)| i);
    let first = found.next().ok_or_else(|| PatchError::TargetNotFound {
        patch,
        target: selector.to_string(),
    })?;
    let extra = found.count();
    if extra > 0 {
        return Err(PatchError::AmbiguousTarget {
            patch,
            target: selector.to_string(),
            matches: extra + 1,
        });
    }
    Ok(first)
}

fn operation_value(
    operation: &PatchOperation,
    outputs: &MaterializedOutputs,
    scope: &str,
) -> Result<Option<Value>, String> {
    if let Some(value) = &operation.value {
        return Ok(Some(value.clone()));
    }
    let Some(value_from) = &operation.value_from else {
        return Ok(None);
    };
    let unit = UnitId::parse(&value_from.unit, scope);
    let document = outputs
        .get(&unit)
        .ok_or_else(|| format!("value source {unit} has no rendered output"))?;
    document
        .pointer(&value_from.pointer)
        .cloned()
        .map(Some)
        .ok_or_else(|| format!("value source {unit} has nothing at '{}'", value_from.pointer))
}

fn parse_pointer(path: &str) -> Result<Vec<String>, String> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| "path is not a JSON pointer".to_string())?;
    Ok(rest
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn navigate_mut<'a>(root: &'a mut Value, tokens: &[String]) -> Option<&'a mut Value> {
    tokens.iter().try_fold(root, |current, token| match current {
        Value::Object(map) => map.get_mut(token),
        Value::Array(items) => token.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    })
}

fn apply_operation(
    document: &mut Value,
    op: PatchOp,
    path: &str,
    value: Option<Value>,
) -> Result<(), String> {
    let tokens = parse_pointer(path)?;
    let Some((last, parent_tokens)) = tokens.split_last() else {
        return match (op, value) {
            (PatchOp::Add | PatchOp::Replace, Some(value)) => {
                *document = value;
                Ok(())
            }
            (PatchOp::Remove, _) => Err("cannot remove the document root".to_string()),
            (_, None) => Err("operation has no value".to_string()),
        };
    };
    let parent = navigate_mut(document, parent_tokens)
        .ok_or_else(|| "parent path does not exist".to_string())?;

    match (op, parent) {
        (PatchOp::Add, Value::Object(map)) => {
            map.insert(last.clone(), value.ok_or("operation has no value")?);
        }
        (PatchOp::Add, Value::Array(items)) => {
            let value = value.ok_or("operation has no value")?;
            if last == "-" {
                items.push(value);
            } else {
                let index = array_index(last, items.len() + 1)?;
                items.insert(index, value);
            }
        }
        (PatchOp::Replace, Value::Object(map)) => {
            let slot = map
                .get_mut(last.as_str())
                .ok_or_else(|| "path does not exist".to_string())?;
            *slot = value.ok_or("operation has no value")?;
        }
        (PatchOp::Replace, Value::Array(items)) => {
            let index = array_index(last, items.len())?;
            items[index] = value.ok_or("operation has no value")?;
        }
        (PatchOp::Remove, Value::Object(map)) => {
            map.remove(last.as_str())
                .ok_or_else(|| "path does not exist".to_string())?;
        }
        (PatchOp::Remove, Value::Array(items)) => {
            let index = array_index(last, items.len())?;
            items.remove(index);
        }
        (_, _) => return Err("parent is not an object or array".to_string()),
    }
    Ok(())
}

/// Parse an array index that must be below `bound`
fn array_index(token: &str, bound: usize) -> Result<usize, String> {
    let index: usize = token
        .parse()
        .map_err(|e| format!("'{token}' is not an array index: {e}"))?;
    if index >= bound {
        return Err("path does not exist".to_string());
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ValueFrom;
    use serde_json::json;

    fn doc(value: Value) -> ManifestDocument {
        ManifestDocument::from_value(value, "apps").unwrap()
    }

    fn base() -> Vec<ManifestDocument> {
        vec![
            doc(json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "web"},
                "spec": {
                    "replicas": 1,
                    "template": {"spec": {"containers": [{"name": "web", "image": "web:1.0"}]}}
                }
            })),
            doc(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "settings"},
                "data": {"mode": "dev", "debug": "true"}
            })),
        ]
    }

    fn op(op: PatchOp, path: &str, value: Option<Value>) -> PatchOperation {
        PatchOperation {
            op,
            path: path.to_string(),
            value,
            value_from: None,
        }
    }

    fn patch(kind: &str, name: &str, operations: Vec<PatchOperation>) -> PatchSpec {
        PatchSpec {
            target: TargetSelector {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: None,
            },
            operations,
        }
    }

    fn compose_plain(patches: &[PatchSpec]) -> Result<Vec<ManifestDocument>, PatchError> {
        compose(&base(), patches, &MaterializedOutputs::default(), "apps")
    }

    #[test]
    fn test_operations_apply_in_order() {
        let patches = vec![
            patch(
                "Deployment",
                "web",
                vec![
                    op(PatchOp::Replace, "/spec/replicas", Some(json!(3))),
                    op(
                        PatchOp::Replace,
                        "/spec/template/spec/containers/0/image",
                        Some(json!("web:2.0")),
                    ),
                    op(
                        PatchOp::Add,
                        "/spec/template/spec/containers/-",
                        Some(json!({"name": "sidecar"})),
                    ),
                ],
            ),
            patch(
                "ConfigMap",
                "settings",
                vec![
                    op(PatchOp::Remove, "/data/debug", None),
                    op(PatchOp::Add, "/data/mode", Some(json!("prod"))),
                ],
            ),
        ];
        let out = compose_plain(&patches).unwrap();
        let deployment = out[0].body();
        assert_eq!(deployment["spec"]["replicas"], json!(3));
        assert_eq!(
            deployment["spec"]["template"]["spec"]["containers"][0]["image"],
            json!("web:2.0")
        );
        assert_eq!(
            deployment["spec"]["template"]["spec"]["containers"][1]["name"],
            json!("sidecar")
        );
        assert_eq!(out[1].body()["data"], json!({"mode": "prod"}));
    }

    #[test]
    fn test_later_patch_sees_earlier_patch() {
        let patches = vec![
            patch(
                "ConfigMap",
                "settings",
                vec![op(PatchOp::Add, "/data/feature", Some(json!("on")))],
            ),
            patch(
                "ConfigMap",
                "settings",
                vec![op(PatchOp::Replace, "/data/feature", Some(json!("off")))],
            ),
        ];
        let out = compose_plain(&patches).unwrap();
        assert_eq!(out[1].body()["data"]["feature"], json!("off"));
    }

    #[test]
    fn test_replace_missing_path_fails() {
        let patches = vec![patch(
            "ConfigMap",
            "settings",
            vec![op(PatchOp::Replace, "/data/absent", Some(json!("x")))],
        )];
        let err = compose_plain(&patches).unwrap_err();
        assert!(matches!(
            err,
            PatchError::InvalidOperation { op: "replace", .. }
        ));
    }

    #[test]
    fn test_remove_missing_path_fails() {
        let patches = vec![patch(
            "ConfigMap",
            "settings",
            vec![op(PatchOp::Remove, "/data/absent", None)],
        )];
        assert!(matches!(
            compose_plain(&patches),
            Err(PatchError::InvalidOperation { op: "remove", .. })
        ));
    }

    #[test]
    fn test_add_with_missing_parent_fails() {
        let patches = vec![patch(
            "ConfigMap",
            "settings",
            vec![op(PatchOp::Add, "/metadata/annotations/a", Some(json!("x")))],
        )];
        assert!(matches!(
            compose_plain(&patches),
            Err(PatchError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_target_resolution_errors() {
        let missing = vec![patch("Service", "web", vec![])];
        assert!(matches!(
            compose_plain(&missing),
            Err(PatchError::TargetNotFound { patch: 0, .. })
        ));

        let mut docs = base();
        docs.push(doc(json!({
            "kind": "ConfigMap",
            "metadata": {"name": "settings", "namespace": "other"}
        })));
        let ambiguous = vec![patch("ConfigMap", "settings", vec![])];
        let err = compose(&docs, &ambiguous, &MaterializedOutputs::default(), "apps").unwrap_err();
        assert!(matches!(
            err,
            PatchError::AmbiguousTarget { matches: 2, .. }
        ));

        let mut narrowed = patch("ConfigMap", "settings", vec![]);
        narrowed.target.namespace = Some("other".to_string());
        assert!(compose(&docs, &[narrowed], &MaterializedOutputs::default(), "apps").is_ok());
    }

    #[test]
    fn test_losing_identity_fails() {
        let patches = vec![patch(
            "ConfigMap",
            "settings",
            vec![op(PatchOp::Remove, "/metadata/name", None)],
        )];
        assert!(matches!(
            compose_plain(&patches),
            Err(PatchError::InvalidOperation { op: "compose", .. })
        ));
    }

    #[test]
    fn test_composition_is_byte_identical() {
        let patches = vec![patch(
            "Deployment",
            "web",
            vec![
                op(PatchOp::Add, "/metadata/labels", Some(json!({"z": "1", "a": "2"}))),
                op(PatchOp::Replace, "/spec/replicas", Some(json!(5))),
            ],
        )];
        let first = compose_plain(&patches).unwrap();
        let second = compose_plain(&patches).unwrap();
        let bytes = |docs: &[ManifestDocument]| -> Vec<Vec<u8>> {
            docs.iter().map(ManifestDocument::canonical_bytes).collect()
        };
        assert_eq!(bytes(&first), bytes(&second));
    }

    #[test]
    fn test_value_from_rendered_secret() {
        let mut outputs = MaterializedOutputs::default();
        outputs.insert(
            UnitId::new("apps", "db-credentials"),
            json!({"stringData": {"password": "s3cret"}}),
        );
        let patches = vec![patch(
            "ConfigMap",
            "settings",
            vec![PatchOperation {
                op: PatchOp::Add,
                path: "/data/password".to_string(),
                value: None,
                value_from: Some(ValueFrom {
                    unit: "db-credentials".to_string(),
                    pointer: "/stringData/password".to_string(),
                }),
            }],
        )];
        let out = compose(&base(), &patches, &outputs, "apps").unwrap();
        assert_eq!(out[1].body()["data"]["password"], json!("s3cret"));

        let err = compose(&base(), &patches, &MaterializedOutputs::default(), "apps").unwrap_err();
        assert!(err.to_string().contains("no rendered output"));
    }

    #[test]
    fn test_pointer_escapes() {
        let mut value = json!({"metadata": {"annotations": {}}});
        apply_operation(
            &mut value,
            PatchOp::Add,
            "/metadata/annotations/example.com~1owner",
            Some(json!("team-a")),
        )
        .unwrap();
        assert_eq!(
            value["metadata"]["annotations"]["example.com/owner"],
            json!("team-a")
        );
    }
}

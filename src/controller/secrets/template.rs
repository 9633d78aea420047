//! # Secret Template Rendering
//!
//! Substitutes `{{ .field }}` placeholders in every string of a template
//! document. Rendering is all-or-nothing: a placeholder naming a field the
//! source does not carry fails the whole render, and so does any `{{`
//! that is not a well-formed placeholder. Field names follow the Secret key
//! grammar, so `{{ .tls.crt }}` names the `tls.crt` field.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use thiserror::Error;
use zeroize::Zeroizing;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*\.([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex is valid")
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("template references field '{field}' which the source secret does not carry")]
    MissingField { field: String },
    #[error("template contains a malformed placeholder '{placeholder}'")]
    MalformedPlaceholder { placeholder: String },
    #[error("template must be a mapping")]
    NotAMapping,
}

/// Render `template` against `fields`
///
/// Keys are not substituted, only string values.
pub fn render(
    template: &Value,
    fields: &BTreeMap<String, Zeroizing<String>>,
) -> Result<Value, RenderError> {
    if !template.is_object() {
        return Err(RenderError::NotAMapping);
    }
    render_value(template, fields)
}

fn render_value(
    value: &Value,
    fields: &BTreeMap<String, Zeroizing<String>>,
) -> Result<Value, RenderError> {
    Ok(match value {
        Value::String(text) => Value::String(render_string(text, fields)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_value(item, fields))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut rendered = Map::with_capacity(map.len());
            for (key, item) in map {
                rendered.insert(key.clone(), render_value(item, fields)?);
            }
            Value::Object(rendered)
        }
        scalar => scalar.clone(),
    })
}

fn render_string(
    text: &str,
    fields: &BTreeMap<String, Zeroizing<String>>,
) -> Result<String, RenderError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for captures in PLACEHOLDER.captures_iter(text) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let value = fields
            .get(name.as_str())
            .ok_or_else(|| RenderError::MissingField {
                field: name.as_str().to_string(),
            })?;
        out.push_str(literal(&text[last..whole.start()])?);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(literal(&text[last..])?);
    Ok(out)
}

/// Template text between placeholders, which must not open another one
fn literal(segment: &str) -> Result<&str, RenderError> {
    match segment.find("{{") {
        Some(start) => {
            let rest = &segment[start..];
            let end = rest.find("}}").map_or(rest.len(), |i| i + 2);
            Err(RenderError::MalformedPlaceholder {
                placeholder: rest[..end].to_string(),
            })
        }
        None => Ok(segment),
    }
}

/// Fold `stringData` into base64 `data`, as the API server stores secrets
///
/// `stringData` wins over `data` for the same key.
#[must_use]
pub fn normalize_secret(mut rendered: Value) -> Value {
    let Some(obj) = rendered.as_object_mut() else {
        return rendered;
    };
    let Some(Value::Object(string_data)) = obj.remove("stringData") else {
        return rendered;
    };
    let data = obj
        .entry("data")
        .or_insert_with(|| Value::Object(Map::new()));
    if !data.is_object() {
        *data = Value::Object(Map::new());
    }
    if let Some(data) = data.as_object_mut() {
        for (key, value) in string_data {
            let plain = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            data.insert(key, Value::String(BASE64_STANDARD.encode(plain)));
        }
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, Zeroizing<String>> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Zeroizing::new((*v).to_string())))
            .collect()
    }

    #[test]
    fn test_substitutes_nested_strings() {
        let template = json!({
            "kind": "Secret",
            "stringData": {
                "url": "postgres://{{ .username }}:{{.password}}@db:5432/app",
                "user": "{{ .username }}"
            },
            "ports": [5432, "{{ .port }}"]
        });
        let rendered = render(
            &template,
            &fields(&[("username", "app"), ("password", "s3cret"), ("port", "6432")]),
        )
        .unwrap();
        assert_eq!(
            rendered["stringData"]["url"],
            json!("postgres://app:s3cret@db:5432/app")
        );
        assert_eq!(rendered["stringData"]["user"], json!("app"));
        assert_eq!(rendered["ports"], json!([5432, "6432"]));
    }

    #[test]
    fn test_missing_field_fails_whole_render() {
        let template = json!({"stringData": {"a": "{{ .present }}", "b": "{{ .absent }}"}});
        let err = render(&template, &fields(&[("present", "x")])).unwrap_err();
        assert_eq!(
            err,
            RenderError::MissingField {
                field: "absent".to_string()
            }
        );
    }

    #[test]
    fn test_dotted_field_names() {
        let template = json!({"stringData": {"crt": "{{ .tls.crt }}", "key": "{{.tls.key}}"}});
        let rendered = render(
            &template,
            &fields(&[("tls.crt", "CERT"), ("tls.key", "KEY")]),
        )
        .unwrap();
        assert_eq!(rendered["stringData"]["crt"], json!("CERT"));
        assert_eq!(rendered["stringData"]["key"], json!("KEY"));

        let err = render(&json!({"x": "{{ .absent.key }}"}), &fields(&[])).unwrap_err();
        assert_eq!(
            err,
            RenderError::MissingField {
                field: "absent.key".to_string()
            }
        );
    }

    #[test]
    fn test_unparsed_placeholder_fails_render() {
        let source = fields(&[("password", "x")]);
        for text in ["{{ password }}", "{{ .pass word }}", "prefix {{ .password"] {
            let err = render(&json!({"v": text}), &source).unwrap_err();
            assert!(
                matches!(err, RenderError::MalformedPlaceholder { .. }),
                "{text}: {err:?}"
            );
        }

        // Braces inside a substituted value are data, not template
        let braces = fields(&[("password", "{{ not-a-placeholder }}")]);
        let rendered = render(&json!({"v": "{{ .password }}"}), &braces).unwrap();
        assert_eq!(rendered["v"], json!("{{ not-a-placeholder }}"));
    }

    #[test]
    fn test_render_is_idempotent() {
        let template = json!({"stringData": {"token": "Bearer {{ .token }}"}});
        let source = fields(&[("token", "abc")]);
        assert_eq!(
            render(&template, &source).unwrap(),
            render(&template, &source).unwrap()
        );
    }

    #[test]
    fn test_template_must_be_mapping() {
        assert_eq!(
            render(&json!("{{ .x }}"), &fields(&[("x", "1")])),
            Err(RenderError::NotAMapping)
        );
    }

    #[test]
    fn test_normalize_folds_string_data() {
        let normalized = normalize_secret(json!({
            "data": {"existing": "eA==", "password": "b2xk"},
            "stringData": {"password": "new"}
        }));
        assert!(normalized.get("stringData").is_none());
        assert_eq!(normalized["data"]["existing"], json!("eA=="));
        assert_eq!(normalized["data"]["password"], json!("bmV3"));
    }
}

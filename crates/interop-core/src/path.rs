//! Dot-notation field-path resolution over an [`Envelope`] (§4.7/§4.8, design note on "a small
//! typed path evaluator over a tagged variant tree").
//!
//! Only the paths named in the spec resolve: `header.*` dispatches on named `Header` fields,
//! `body.content.*` dispatches on the [`BodyContent`] variant. Anything else — including any
//! attempt at reflective access into an arbitrary struct — is `None`, which callers treat as
//! `field_not_found`. Bracket indexing (`MSH[3]`) is accepted as a synonym for dot indexing
//! (`MSH.3`) since both appear in the source material this was distilled from.

use crate::envelope::{BodyContent, Envelope, Header};
use serde_json::Value;

fn normalize(path: &str) -> String {
    path.replace('[', ".").replace(']', "")
}

/// Resolves `path` (e.g. `header.message_type`, `body.content.PID.5.1`,
/// `body.content.resourceType`) against `envelope`. Returns `None` if the path does not match any
/// recognized shape for the envelope's actual body variant.
pub fn resolve(envelope: &Envelope, path: &str) -> Option<Value> {
    let normalized = normalize(path);
    let (root, rest) = normalized.split_once('.')?;
    match root {
        "header" => resolve_header(&envelope.header, rest),
        "body" => resolve_body(envelope, rest),
        _ => None,
    }
}

fn resolve_header(header: &Header, rest: &str) -> Option<Value> {
    match rest {
        "message_id" => Some(Value::String(header.message_id.to_string())),
        "correlation_id" => header.correlation_id.as_ref().map(|s| Value::String(s.to_string())),
        "message_type" => Some(Value::String(header.message_type.to_string())),
        "content_type" => Some(Value::String(header.content_type.to_string())),
        "source" => Some(Value::String(header.source.to_string())),
        "status" => Some(Value::String(format!("{:?}", header.status).to_lowercase())),
        "retry_count" => Some(Value::Number(header.retry_count.into())),
        "destinations" => Some(Value::Array(
            header.destinations.iter().map(|d| Value::String(d.to_string())).collect(),
        )),
        _ => {
            let key = rest.strip_prefix("metadata.")?;
            navigate_metadata(&header.metadata, key)
        }
    }
}

fn navigate_metadata(metadata: &std::collections::HashMap<String, Value>, key: &str) -> Option<Value> {
    let (first, remainder) = match key.split_once('.') {
        Some((f, r)) => (f, Some(r)),
        None => (key, None),
    };
    let value = metadata.get(first)?;
    match remainder {
        Some(rest) => resolve_json_path(value, rest),
        None => Some(value.clone()),
    }
}

fn resolve_body(envelope: &Envelope, rest: &str) -> Option<Value> {
    let body = &envelope.body;
    match rest {
        "content_type" => Some(Value::String(body.content_type.to_string())),
        "schema_id" => body.schema_id.as_ref().map(|s| Value::String(s.to_string())),
        _ => {
            let content_path = rest.strip_prefix("content")?;
            let content_path = content_path.strip_prefix('.').unwrap_or(content_path);
            match &body.content {
                BodyContent::Hl7(flat) => flat.get(content_path).map(|v| Value::String(v.clone())),
                BodyContent::Fhir(value) => {
                    if content_path.is_empty() {
                        Some(value.clone())
                    } else {
                        resolve_json_path(value, content_path)
                    }
                }
                BodyContent::Raw => None,
            }
        }
    }
}

fn resolve_json_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(arr) => {
                let index: usize = segment.parse().ok()?;
                arr.get(index)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Body, Header};
    use std::collections::HashMap;

    fn fhir_envelope() -> Envelope {
        let header = Header::new("Patient", "application/fhir+json", "http://ingest");
        let mut body = Body::from_raw("application/fhir+json", Vec::new());
        body.content = BodyContent::Fhir(serde_json::json!({
            "resourceType": "Patient",
            "name": [{"family": "Doe", "given": ["John"]}]
        }));
        Envelope::new(header, body)
    }

    fn hl7_envelope() -> Envelope {
        let header = Header::new("ADT^A01", "application/hl7-v2+er7", "mllp://0.0.0.0:2575");
        let mut body = Body::from_raw("application/hl7-v2+er7", Vec::new());
        let mut flat = HashMap::new();
        flat.insert("MSH.9".to_string(), "ADT^A01".to_string());
        flat.insert("PID.5.1".to_string(), "Doe".to_string());
        body.content = BodyContent::Hl7(flat);
        Envelope::new(header, body)
    }

    #[test]
    fn resolves_header_fields() {
        let envelope = fhir_envelope();
        assert_eq!(
            resolve(&envelope, "header.message_type"),
            Some(Value::String("Patient".to_string()))
        );
    }

    #[test]
    fn resolves_fhir_dot_and_array_paths() {
        let envelope = fhir_envelope();
        assert_eq!(
            resolve(&envelope, "body.content.resourceType"),
            Some(Value::String("Patient".to_string()))
        );
        assert_eq!(
            resolve(&envelope, "body.content.name.0.family"),
            Some(Value::String("Doe".to_string()))
        );
    }

    #[test]
    fn resolves_hl7_flattened_paths_with_bracket_syntax() {
        let envelope = hl7_envelope();
        assert_eq!(
            resolve(&envelope, "body.content.MSH[9]"),
            Some(Value::String("ADT^A01".to_string()))
        );
        assert_eq!(
            resolve(&envelope, "body.content.PID.5.1"),
            Some(Value::String("Doe".to_string()))
        );
    }

    #[test]
    fn unknown_path_is_none() {
        let envelope = fhir_envelope();
        assert_eq!(resolve(&envelope, "body.content.nonexistent.deep"), None);
        assert_eq!(resolve(&envelope, "not_a_root"), None);
    }
}

//! Drives [`TransformationRule`] application against an [`Envelope`] (§4.7 steps 1-5).

use crate::rules::{MessageFormat, TransformationRegistry, TransformationRule};
use crate::template::render;
use interop_core::envelope::{BodyContent, Envelope, MessageStatus};
use interop_core::error::{EngineError, EngineResult, ErrorKind};
use serde_json::Value;
use std::collections::HashMap;

/// Flattens a FHIR JSON tree into dot-path strings for placeholder resolution, the FHIR
/// counterpart to `interop_hl7::flatten`. Array indices use plain integers (`name.0.family`).
pub fn flatten_json(value: &Value) -> HashMap<String, String> {
    let mut out = HashMap::new();
    flatten_into(value, String::new(), &mut out);
    out
}

fn flatten_into(value: &Value, prefix: String, out: &mut HashMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                flatten_into(v, key, out);
            }
        }
        Value::Array(arr) => {
            for (i, v) in arr.iter().enumerate() {
                let key = format!("{prefix}.{i}");
                flatten_into(v, key, out);
            }
        }
        Value::String(s) => {
            out.insert(prefix, s.clone());
        }
        Value::Null => {}
        other => {
            out.insert(prefix, other.to_string());
        }
    }
}

fn source_flat_view(source_format: MessageFormat, body: &BodyContent) -> EngineResult<HashMap<String, String>> {
    match (source_format, body) {
        (MessageFormat::Hl7v2, BodyContent::Hl7(flat)) => Ok(flat.clone()),
        (MessageFormat::Fhir, BodyContent::Fhir(value)) => Ok(flatten_json(value)),
        _ => Err(EngineError::new(
            ErrorKind::TransformationError,
            "body content variant does not match the rule's declared source_format",
        )),
    }
}

/// Recursively renders every leaf string in `mapping` against `source`, leaving other JSON types
/// (numbers, bools, null) unchanged.
fn render_mapping(mapping: &Value, source: &HashMap<String, String>) -> Value {
    match mapping {
        Value::String(s) => Value::String(render(s, source)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_mapping(v, source)).collect()),
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), render_mapping(v, source))).collect())
        }
        other => other.clone(),
    }
}

/// Flattens a rendered mapping `Value` back into `segment.field[.component]` keys, used when the
/// target format is HL7 (the mapping is already shaped as a flat object of such keys).
fn mapping_to_hl7_flat(rendered: &Value) -> HashMap<String, String> {
    match rendered {
        Value::Object(map) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
        _ => HashMap::new(),
    }
}

/// Applies `rule` to `envelope`, producing a derived envelope per §4.7 step 5: new
/// `message_id`, `correlation_id` pointing at the source, updated `content_type`/`message_type`,
/// and `metadata.transformed_from` set.
pub fn apply(rule: &TransformationRule, envelope: &Envelope) -> EngineResult<Envelope> {
    let source = source_flat_view(rule.source_format, &envelope.body.content)?;
    let rendered = render_mapping(&rule.mapping, &source);

    let mut derived = envelope.derive();
    derived.header.content_type = rule.target_format.content_type().into();
    derived.header.message_type = rule.target_message_type.clone().into();
    derived.header.status = MessageStatus::Transformed;
    derived
        .header
        .metadata
        .insert("transformed_from".to_string(), Value::String(envelope.header.message_id.to_string()));

    derived.body.content_type = rule.target_format.content_type().into();
    derived.body.content = match rule.target_format {
        MessageFormat::Fhir => BodyContent::Fhir(rendered),
        MessageFormat::Hl7v2 => BodyContent::Hl7(mapping_to_hl7_flat(&rendered)),
    };

    Ok(derived)
}

/// Finds and applies the single rule named `rule_name` (used by the routing engine's
/// `transform(name, params)` action).
pub fn apply_named(
    registry: &TransformationRegistry,
    rule_name: &str,
    envelope: &Envelope,
) -> EngineResult<Envelope> {
    let rule = registry
        .by_name(rule_name)
        .ok_or_else(|| EngineError::new(ErrorKind::TransformationError, format!("no such transformation rule: {rule_name}")))?;
    apply(rule, envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::default_rules;
    use interop_core::envelope::{Body, Header};
    use interop_hl7::parse_message;

    fn adt_a01_envelope() -> Envelope {
        let raw = b"MSH|^~\\&|SENDING_APP|SENDING_FACILITY|RECEIVING_APP|RECEIVING_FACILITY|20230629120000||ADT^A01|MSG00001|P|2.3\rEVN|A01|20230629120000\rPID|1||12345||Doe^John||19700101|M\rPV1|1|O\r";
        let parsed = parse_message(raw).unwrap();
        let flat = interop_hl7::flatten(&parsed);
        let header = Header::new("ADT^A01", "application/hl7-v2+er7", "mllp://0.0.0.0:2575");
        let mut body = Body::from_raw("application/hl7-v2+er7", raw.to_vec());
        body.content = BodyContent::Hl7(flat);
        Envelope::new(header, body)
    }

    #[test]
    fn adt_a01_maps_to_fhir_patient() {
        let rules = default_rules();
        let rule = &rules["hl7v2-adt-a01-to-fhir-patient"];
        let envelope = adt_a01_envelope();
        let derived = apply(rule, &envelope).unwrap();

        assert_eq!(
            derived.header.correlation_id.as_deref(),
            Some(envelope.header.message_id.as_str())
        );
        assert_eq!(derived.header.message_type, "Patient");

        let BodyContent::Fhir(value) = &derived.body.content else {
            panic!("expected FHIR content");
        };
        assert_eq!(value["resourceType"], "Patient");
        assert_eq!(value["name"][0]["family"], "Doe");
        assert_eq!(value["name"][0]["given"][0], "John");
        assert_eq!(value["birthDate"], "1970-01-01");
        assert_eq!(value["gender"], "male");
    }
}

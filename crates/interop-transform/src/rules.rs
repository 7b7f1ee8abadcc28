//! [`TransformationRule`] and the registry that looks rules up by `(source_format,
//! source_message_type)` (§3, §4.7).

use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageFormat {
    Hl7v2,
    Fhir,
}

impl MessageFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            MessageFormat::Hl7v2 => "application/hl7-v2+er7",
            MessageFormat::Fhir => "application/fhir+json",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformationRule {
    pub name: String,
    pub source_format: MessageFormat,
    pub target_format: MessageFormat,
    pub source_message_type: Option<String>,
    pub target_message_type: String,
    /// A JSON tree whose leaf strings may contain `{{path}}`/`{% if %}` placeholders. For an
    /// HL7 target this is a flat object keyed by `segment.field[.component[.subcomponent]]`
    /// paths; for a FHIR target it mirrors the target resource's own shape.
    pub mapping: Value,
}

#[derive(Debug, Default)]
pub struct TransformationRegistry {
    rules: Vec<TransformationRule>,
}

impl TransformationRegistry {
    pub fn new() -> Self {
        TransformationRegistry { rules: Vec::new() }
    }

    pub fn register(&mut self, rule: TransformationRule) {
        self.rules.push(rule);
    }

    /// Rules whose `source_format`/`source_message_type` match, further filtered by
    /// `target_format` and `target_message_type` when requested (§4.7 step 2).
    pub fn find(
        &self,
        source_format: MessageFormat,
        source_message_type: &str,
        target: Option<(MessageFormat, &str)>,
    ) -> Vec<&TransformationRule> {
        self.rules
            .iter()
            .filter(|r| r.source_format == source_format)
            .filter(|r| {
                r.source_message_type
                    .as_deref()
                    .map(|t| t == source_message_type)
                    .unwrap_or(true)
            })
            .filter(|r| match target {
                Some((fmt, mt)) => r.target_format == fmt && r.target_message_type == mt,
                None => true,
            })
            .collect()
    }

    pub fn by_name(&self, name: &str) -> Option<&TransformationRule> {
        self.rules.iter().find(|r| r.name == name)
    }
}

/// A default `ADT^A01 -> Patient` mapping matching the fields in testable property 7: PID-5.1 to
/// `name[0].family`, PID-5.2 to `name[0].given[0]`, PID-7 to `birthDate`, PID-8 to `gender`.
pub fn default_rules() -> HashMap<&'static str, TransformationRule> {
    let mapping = serde_json::json!({
        "resourceType": "Patient",
        "name": [
            { "family": "{{PID.5.1}}", "given": ["{{PID.5.2}}"] }
        ],
        "birthDate": "{{PID.7 | date('%Y-%m-%d')}}",
        "gender": "{% if PID.8 == 'M' %}male{% else %}{% if PID.8 == 'F' %}female{% else %}unknown{% endif %}{% endif %}"
    });
    let rule = TransformationRule {
        name: "hl7v2-adt-a01-to-fhir-patient".to_string(),
        source_format: MessageFormat::Hl7v2,
        target_format: MessageFormat::Fhir,
        source_message_type: Some("ADT^A01".to_string()),
        target_message_type: "Patient".to_string(),
        mapping,
    };
    let mut m = HashMap::new();
    m.insert("hl7v2-adt-a01-to-fhir-patient", rule);
    m
}

//! FHIR R4 resource validation (C7): `resourceType` presence plus a per-resource-type required
//! field registry.

use interop_core::error::{EngineError, EngineResult, ErrorKind};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;

/// One required-field check. Most fields are "present and non-null"; a handful (like `Patient`'s
/// `name`) require a non-empty array instead.
#[derive(Debug, Clone, Copy)]
enum Requirement {
    Present(&'static str),
    NonEmptyArray(&'static str),
}

static REQUIRED_FIELDS: Lazy<HashMap<&'static str, Vec<Requirement>>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, Vec<Requirement>> = HashMap::new();
    m.insert("Patient", vec![Requirement::NonEmptyArray("name")]);
    m.insert(
        "Observation",
        vec![Requirement::Present("status"), Requirement::Present("code")],
    );
    m.insert(
        "Encounter",
        vec![Requirement::Present("status"), Requirement::Present("class")],
    );
    m.insert(
        "Condition",
        vec![Requirement::Present("code"), Requirement::Present("subject")],
    );
    m
});

/// Validates a single (non-Bundle) FHIR resource.
pub fn validate_resource(content: &Value) -> EngineResult<()> {
    let resource_type = content
        .get("resourceType")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::new(ErrorKind::ParseError, "missing resourceType"))?;

    if let Some(requirements) = REQUIRED_FIELDS.get(resource_type) {
        for requirement in requirements {
            check(content, *requirement)?;
        }
    }
    Ok(())
}

fn check(content: &Value, requirement: Requirement) -> EngineResult<()> {
    match requirement {
        Requirement::Present(field) => {
            if content.get(field).map(Value::is_null).unwrap_or(true) {
                return Err(EngineError::new(
                    ErrorKind::ValidationError,
                    format!("Missing required field: {field}"),
                ));
            }
        }
        Requirement::NonEmptyArray(field) => {
            let ok = content
                .get(field)
                .and_then(Value::as_array)
                .map(|a| !a.is_empty())
                .unwrap_or(false);
            if !ok {
                return Err(EngineError::new(
                    ErrorKind::ValidationError,
                    format!("Missing required field: {field}"),
                ));
            }
        }
    }
    Ok(())
}

/// If `content` is a `Bundle`, returns the resource of each `entry`, otherwise `None`.
pub fn unwrap_bundle(content: &Value) -> Option<Vec<Value>> {
    if content.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
        return None;
    }
    let entries = content.get("entry").and_then(Value::as_array)?;
    Some(
        entries
            .iter()
            .filter_map(|entry| entry.get("resource").cloned())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patient_requires_nonempty_name() {
        let patient = json!({"resourceType": "Patient", "name": []});
        let err = validate_resource(&patient).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);

        let patient_ok = json!({"resourceType": "Patient", "name": [{"family": "Doe"}]});
        assert!(validate_resource(&patient_ok).is_ok());
    }

    #[test]
    fn observation_requires_status_and_code() {
        let obs = json!({"resourceType": "Observation", "status": "final"});
        assert!(validate_resource(&obs).is_err());

        let obs_ok = json!({"resourceType": "Observation", "status": "final", "code": {}});
        assert!(validate_resource(&obs_ok).is_ok());
    }

    #[test]
    fn missing_resource_type_is_a_parse_error() {
        let err = validate_resource(&json!({})).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseError);
    }

    #[test]
    fn unwraps_bundle_entries() {
        let bundle = json!({
            "resourceType": "Bundle",
            "entry": [
                {"resource": {"resourceType": "Patient", "name": [{"family": "Doe"}]}},
                {"resource": {"resourceType": "Observation", "status": "final", "code": {}}}
            ]
        });
        let resources = unwrap_bundle(&bundle).unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0]["resourceType"], "Patient");
    }

    #[test]
    fn non_bundle_unwraps_to_none() {
        let patient = json!({"resourceType": "Patient", "name": [{"family": "Doe"}]});
        assert!(unwrap_bundle(&patient).is_none());
    }
}

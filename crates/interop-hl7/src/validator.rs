//! Required-segment validation (C6).

use crate::message::V2Message;
use interop_core::error::{EngineError, EngineResult, ErrorKind};
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Message-type-indexed required segment lists. Keyed on MSH-9 exactly as it appears
/// (`ADT^A01`), since distinct trigger events can require different segments even under the same
/// message structure.
static REQUIRED_SEGMENTS: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
    m.insert("ADT^A01", &["MSH", "EVN", "PID", "PV1"]);
    m.insert("ADT^A04", &["MSH", "EVN", "PID", "PV1"]);
    m.insert("ADT^A08", &["MSH", "EVN", "PID", "PV1"]);
    m.insert("ORU^R01", &["MSH", "PID", "OBR", "OBX"]);
    m.insert("ORU^R03", &["MSH", "PID", "OBR", "OBX"]);
    m.insert("VXU^V04", &["MSH", "PID", "RXA"]);
    m.insert("OML^O21", &["MSH", "PID", "ORC"]);
    m
});

const MIN_MSH_FIELDS: usize = 12;

/// Validates that `msg` has a well-formed `MSH` and every segment its message type requires.
/// Classifies failures per §4.5: a short `MSH` is `invalid_format`; a missing required segment is
/// `missing_segment` (reported as a `ValidationError`).
pub fn validate(msg: &V2Message) -> EngineResult<()> {
    let msh = msg
        .msh()
        .ok_or_else(|| EngineError::new(ErrorKind::ParseError, "invalid_format: no MSH segment"))?;

    if msh.field_count() < MIN_MSH_FIELDS {
        return Err(EngineError::new(
            ErrorKind::ParseError,
            format!(
                "invalid_format: MSH has {} fields, expected at least {MIN_MSH_FIELDS}",
                msh.field_count()
            ),
        ));
    }

    let message_type = msg
        .message_type()
        .ok_or_else(|| EngineError::new(ErrorKind::ParseError, "invalid_format: MSH-9 missing"))?;

    if let Some(required) = REQUIRED_SEGMENTS.get(message_type.as_str()) {
        for segment_id in required.iter() {
            if msg.first_segment(segment_id).is_none() {
                return Err(EngineError::new(
                    ErrorKind::ValidationError,
                    format!("Missing required segment: {segment_id}"),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_message;

    #[test]
    fn accepts_complete_adt_a01() {
        let raw = b"MSH|^~\\&|A|B|C|D|20230629120000||ADT^A01|MSG00001|P|2.3\rEVN|A01|20230629120000\rPID|1||12345||Doe^John||19700101|M\rPV1|1|O\r";
        let msg = parse_message(raw).unwrap();
        assert!(validate(&msg).is_ok());
    }

    #[test]
    fn rejects_adt_a01_missing_pid() {
        let raw = b"MSH|^~\\&|A|B|C|D|20230629120000||ADT^A01|MSG00002|P|2.3\rEVN|A01|20230629120000\r";
        let msg = parse_message(raw).unwrap();
        let err = validate(&msg).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
        assert!(err.message.contains("PID"));
    }

    #[test]
    fn rejects_short_msh() {
        let raw = b"MSH|^~\\&|A|B\r";
        let msg = parse_message(raw).unwrap();
        let err = validate(&msg).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseError);
    }
}

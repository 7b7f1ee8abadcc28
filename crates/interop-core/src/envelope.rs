//! The message envelope (C1): header + body carried across every stage.
//!
//! `BodyContent` is the "tagged variant tree" called for in the design notes: body content is
//! one of a small closed set of shapes, and path resolution (see [`crate::path`]) dispatches on
//! the tag rather than doing reflective lookup into an arbitrary structure. HL7 content is stored
//! pre-flattened to dot-path strings by the parsing stage (see `interop-hl7::flatten`); FHIR
//! content stays as a `serde_json::Value` tree since its paths are standard JSON dot/array
//! addressing.

use crate::strings::EngineString;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageStatus {
    Received,
    Validated,
    Transformed,
    Routed,
    Sent,
    Failed,
}

/// Per-stage error record, stored at `header.metadata["errors"]`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorEntry {
    pub service: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Header {
    pub message_id: EngineString,
    pub correlation_id: Option<EngineString>,
    pub message_type: EngineString,
    pub content_type: EngineString,
    pub source: EngineString,
    pub destinations: Vec<EngineString>,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Header {
    pub fn new(message_type: impl Into<EngineString>, content_type: impl Into<EngineString>, source: impl Into<EngineString>) -> Self {
        Header {
            message_id: Uuid::new_v4().to_string().into(),
            correlation_id: None,
            message_type: message_type.into(),
            content_type: content_type.into(),
            source: source.into(),
            destinations: Vec::new(),
            timestamp: Utc::now(),
            status: MessageStatus::Received,
            retry_count: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn push_error(&mut self, service: &str, kind: &str, message: &str) {
        let entry = serde_json::json!({ "service": service, "kind": kind, "message": message });
        self.metadata
            .entry("errors".to_string())
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        if let Some(serde_json::Value::Array(errors)) = self.metadata.get_mut("errors") {
            errors.push(entry);
        }
    }
}

/// Body content, tagged by source format. `Raw` means the bytes have not been parsed yet.
#[derive(Debug, Clone)]
pub enum BodyContent {
    /// Flattened HL7 dot-paths (`MSH.9`, `PID.5.1`, ...) to their textual value.
    Hl7(HashMap<String, String>),
    /// Parsed FHIR resource or Bundle JSON.
    Fhir(serde_json::Value),
    Raw,
}

#[derive(Debug, Clone)]
pub struct Body {
    pub content_type: EngineString,
    pub content: BodyContent,
    pub raw_content: Vec<u8>,
    pub schema_id: Option<EngineString>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Body {
    pub fn from_raw(content_type: impl Into<EngineString>, raw_content: Vec<u8>) -> Self {
        Body {
            content_type: content_type.into(),
            content: BodyContent::Raw,
            raw_content,
            schema_id: None,
            metadata: HashMap::new(),
        }
    }
}

/// The envelope carried through every queue. See invariants in [`crate::path`] and the module
/// doc comment above.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub header: Header,
    pub body: Body,
}

impl Envelope {
    pub fn new(header: Header, body: Body) -> Self {
        Envelope { header, body }
    }

    /// Deep clone with a fresh `message_id` and `correlation_id` pointing back at this envelope,
    /// per the cloning invariant in §3.
    pub fn derive(&self) -> Self {
        let mut header = self.header.clone();
        header.correlation_id = Some(header.message_id.clone());
        header.message_id = Uuid::new_v4().to_string().into();
        Envelope {
            header,
            body: self.body.clone(),
        }
    }

    /// Requeue with an incremented retry count; the only sanctioned way to "regress" status.
    pub fn with_incremented_retry(&self, status: MessageStatus) -> Self {
        let mut clone = self.clone();
        clone.header.retry_count += 1;
        clone.header.status = status;
        clone
    }
}

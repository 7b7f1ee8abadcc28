//! Structured representation of a parsed ER7 message.
//!
//! A message is a sequence of segments (order preserved, including repeats — e.g. multiple
//! `OBX` segments keep their original order rather than collapsing into a map). Each segment
//! carries the raw field separator set it was parsed with, since MSH's own delimiter fields make
//! per-message delimiters possible in principle even though every segment in a message shares
//! them in practice.

use compact_str::CompactString;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: char,
    pub subcomponent: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Delimiters {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            subcomponent: '&',
        }
    }
}

/// One field component, itself split into subcomponents on `&`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct V2Component {
    pub subcomponents: Vec<CompactString>,
}

impl V2Component {
    pub fn simple(text: &str) -> Self {
        V2Component {
            subcomponents: vec![CompactString::from(text)],
        }
    }

    /// The component's first subcomponent, or empty string if it has none.
    pub fn text(&self) -> &str {
        self.subcomponents.first().map(|s| s.as_str()).unwrap_or("")
    }

    pub fn subcomponent(&self, index: usize) -> Option<&str> {
        self.subcomponents.get(index - 1).map(|s| s.as_str())
    }

    fn to_er7(&self, d: Delimiters) -> String {
        self.subcomponents
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(&d.subcomponent.to_string())
    }
}

/// One field occurrence, split into components on `^`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct V2Field {
    pub components: Vec<V2Component>,
}

impl V2Field {
    pub fn simple(text: &str) -> Self {
        V2Field {
            components: vec![V2Component::simple(text)],
        }
    }

    pub fn component(&self, index: usize) -> Option<&V2Component> {
        self.components.get(index - 1)
    }

    /// First component's first subcomponent — the plain-text value for fields with no internal
    /// structure (the common case).
    pub fn text(&self) -> &str {
        self.components.first().map(|c| c.text()).unwrap_or("")
    }

    fn to_er7(&self, d: Delimiters) -> String {
        self.components
            .iter()
            .map(|c| c.to_er7(d))
            .collect::<Vec<_>>()
            .join(&d.component.to_string())
    }
}

/// One occurrence of a segment (e.g. one `OBX` line among several).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V2Segment {
    pub segment_id: CompactString,
    /// Raw split-by-field-separator tokens, index 0 is the segment id token itself.
    pub raw_fields: Vec<V2Field>,
}

impl V2Segment {
    /// 1-based HL7 field access, segment-id aware: for `MSH`, field 1 is the (elided) separator
    /// character itself and field 2 onward are `raw_fields[1..]`; for every other segment, field
    /// `n` is `raw_fields[n]`.
    pub fn field(&self, n: usize) -> Option<&V2Field> {
        if self.segment_id == "MSH" {
            if n == 1 {
                return None;
            }
            self.raw_fields.get(n - 1)
        } else {
            self.raw_fields.get(n)
        }
    }

    pub fn field_count(&self) -> usize {
        if self.segment_id == "MSH" {
            self.raw_fields.len() + 1
        } else {
            self.raw_fields.len()
        }
    }

    fn to_er7(&self, d: Delimiters) -> String {
        // raw_fields[0] is always the literal segment-id token reproduced above; every segment,
        // MSH included, reconstructs cleanly by joining the rest back with the field separator.
        let mut parts = vec![self.segment_id.to_string()];
        parts.extend(self.raw_fields.iter().skip(1).map(|f| f.to_er7(d)));
        parts.join(&d.field.to_string())
    }
}

/// A fully parsed HL7 v2 message: an ordered sequence of segments plus the delimiters used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V2Message {
    pub segments: Vec<V2Segment>,
    pub delimiters: Delimiters,
}

impl V2Message {
    /// All occurrences of `segment_id`, in message order.
    pub fn segments_by_id(&self, segment_id: &str) -> Vec<&V2Segment> {
        self.segments
            .iter()
            .filter(|s| s.segment_id == segment_id)
            .collect()
    }

    pub fn first_segment(&self, segment_id: &str) -> Option<&V2Segment> {
        self.segments.iter().find(|s| s.segment_id == segment_id)
    }

    pub fn msh(&self) -> Option<&V2Segment> {
        self.first_segment("MSH")
    }

    /// MSH-9: message type, e.g. `ADT^A01`.
    pub fn message_type(&self) -> Option<String> {
        self.msh().and_then(|msh| msh.field(9)).map(|f| f.to_er7(self.delimiters))
    }

    /// MSH-10: message control id.
    pub fn message_control_id(&self) -> Option<&str> {
        self.msh().and_then(|msh| msh.field(10)).map(|f| f.text())
    }

    /// Reconstructs the ER7 text, segments joined by `\r`, trailing `\r` included.
    pub fn to_er7_string(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            out.push_str(&segment.to_er7(self.delimiters));
            out.push('\r');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_message;

    #[test]
    fn field_indexing_accounts_for_msh_offset() {
        let raw = b"MSH|^~\\&|SENDING_APP|SENDING_FACILITY|RECEIVING_APP|RECEIVING_FACILITY|20230629120000||ADT^A01|MSG00001|P|2.3\rPID|1||12345||Doe^John||19700101|M\r";
        let msg = parse_message(raw).unwrap();
        assert_eq!(msg.message_type().as_deref(), Some("ADT^A01"));
        assert_eq!(msg.message_control_id(), Some("MSG00001"));
        let pid = msg.first_segment("PID").unwrap();
        assert_eq!(pid.field(5).unwrap().component(1).unwrap().text(), "Doe");
        assert_eq!(pid.field(5).unwrap().component(2).unwrap().text(), "John");
        assert_eq!(pid.field(7).unwrap().text(), "19700101");
        assert_eq!(pid.field(8).unwrap().text(), "M");
    }
}

//! String primitives shared across the engine.
//!
//! We lean on `compact_str` the way the rest of this codebase's ancestry does: most strings
//! flowing through the pipeline (segment ids, queue names, message types) are short enough to
//! stay inline, so a `CompactString` avoids a heap allocation in the common case.

pub use compact_str::{format_compact, CompactString, ToCompactString};

/// The string type used for identifiers and short text throughout the engine.
pub type EngineString = CompactString;

pub trait EngineStringConversions: ToString {
    fn to_engine_string(&self) -> EngineString {
        EngineString::from(self.to_string())
    }
}

impl<T: ToString> EngineStringConversions for T {}

/// Splits `s` on `sep`, returning an empty vec for an empty string rather than `vec![""]`.
pub fn split_nonempty(s: &str, sep: char) -> Vec<&str> {
    if s.is_empty() {
        return Vec::new();
    }
    s.split(sep).collect()
}

/// Standard (non-URL-safe) base64 with padding, used for HTTP Basic auth headers.
pub fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

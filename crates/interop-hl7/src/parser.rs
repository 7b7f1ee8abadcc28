//! ER7 text → [`V2Message`] (C6).
//!
//! Splits on `\r` (normalizing `\r\n` first), reads delimiters from the `MSH` segment, then
//! splits each segment by field separator, each field by component separator, each component by
//! subcomponent separator.

use crate::message::{Delimiters, V2Component, V2Field, V2Message, V2Segment};
use compact_str::CompactString;
use interop_core::error::{EngineError, EngineResult};

/// Decodes `raw` as UTF-8, falling back to lossy replacement for bytes that aren't valid UTF-8
/// (the spec's "decoded as UTF-8, fallback replacement").
fn decode(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(raw).into_owned(),
    }
}

fn split_component(text: &str, sub_sep: char) -> V2Component {
    V2Component {
        subcomponents: text.split(sub_sep).map(CompactString::from).collect(),
    }
}

fn split_field(text: &str, component_sep: char, sub_sep: char) -> V2Field {
    V2Field {
        components: text
            .split(component_sep)
            .map(|c| split_component(c, sub_sep))
            .collect(),
    }
}

fn split_segment(line: &str, d: Delimiters) -> EngineResult<V2Segment> {
    if line.len() < 3 {
        return Err(EngineError::parse("segment shorter than a 3-character id"));
    }
    let segment_id = CompactString::from(&line[0..3]);
    let raw_fields: Vec<V2Field> = line
        .split(d.field)
        .map(|f| split_field(f, d.component, d.subcomponent))
        .collect();
    Ok(V2Segment {
        segment_id,
        raw_fields,
    })
}

/// Parses `raw` bytes into a [`V2Message`]. Fails with a parse error (classified
/// `invalid_format` by [`crate::validator`]) if there is no `MSH` segment or the `MSH` segment is
/// too short to carry delimiters.
pub fn parse_message(raw: &[u8]) -> EngineResult<V2Message> {
    let text = decode(raw);
    let normalized = text.replace("\r\n", "\r").replace('\n', "\r");
    let lines: Vec<&str> = normalized
        .split('\r')
        .filter(|l| !l.is_empty())
        .collect();

    let first = lines
        .first()
        .ok_or_else(|| EngineError::parse("empty message"))?;
    if !first.starts_with("MSH") {
        return Err(EngineError::parse("message does not begin with MSH segment"));
    }
    if first.len() < 8 {
        return Err(EngineError::parse("MSH segment too short to carry delimiters"));
    }
    let chars: Vec<char> = first.chars().collect();
    let delimiters = Delimiters {
        field: chars[3],
        component: chars[4],
        repetition: chars[5],
        escape: chars[6],
        subcomponent: chars[7],
    };

    let segments = lines
        .iter()
        .map(|line| split_segment(line, delimiters))
        .collect::<EngineResult<Vec<_>>>()?;

    Ok(V2Message {
        segments,
        delimiters,
    })
}

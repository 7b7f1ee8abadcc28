//! Flattens a parsed [`V2Message`] into the dot-path `segment.field[.component[.subcomponent]]`
//! map consumed by [`interop_core::path`] and the transformation engine (§4.7).
//!
//! Only the first occurrence of each segment id is flattened under its bare name (`PID.5.1`);
//! repeats are additionally indexed by occurrence (`OBX.2.5` for the second `OBX`'s field 5),
//! matching "repeating segments become a list of field lists".

use crate::message::V2Message;
use std::collections::HashMap;

pub fn flatten(msg: &V2Message) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut seen_counts: HashMap<&str, usize> = HashMap::new();

    for segment in &msg.segments {
        let occurrence = {
            let count = seen_counts.entry(segment.segment_id.as_str()).or_insert(0);
            let this_occurrence = *count;
            *count += 1;
            this_occurrence
        };

        for field_num in 1..=segment.field_count() {
            let Some(field) = segment.field(field_num) else {
                continue;
            };
            let joined = field.text();
            insert(&mut out, &segment.segment_id, occurrence, field_num, None, None, joined);

            for (ci, component) in field.components.iter().enumerate() {
                let component_num = ci + 1;
                if field.components.len() > 1 {
                    insert(
                        &mut out,
                        &segment.segment_id,
                        occurrence,
                        field_num,
                        Some(component_num),
                        None,
                        component.text(),
                    );
                }
                if component.subcomponents.len() > 1 {
                    for (si, subcomponent) in component.subcomponents.iter().enumerate() {
                        insert(
                            &mut out,
                            &segment.segment_id,
                            occurrence,
                            field_num,
                            Some(component_num),
                            Some(si + 1),
                            subcomponent,
                        );
                    }
                } else if field.components.len() > 1 {
                    insert(
                        &mut out,
                        &segment.segment_id,
                        occurrence,
                        field_num,
                        Some(component_num),
                        Some(1),
                        component.text(),
                    );
                }
            }
            // A single-component field still answers `.1` / `.1.1` the way HL7 convention
            // allows (PID.5.1 when PID-5 has no `^` at all).
            if field.components.len() == 1 {
                insert(&mut out, &segment.segment_id, occurrence, field_num, Some(1), None, joined);
                insert(&mut out, &segment.segment_id, occurrence, field_num, Some(1), Some(1), joined);
            }
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn insert(
    out: &mut HashMap<String, String>,
    segment_id: &str,
    occurrence: usize,
    field_num: usize,
    component_num: Option<usize>,
    subcomponent_num: Option<usize>,
    value: &str,
) {
    let mut key = String::new();
    key.push_str(segment_id);
    key.push('.');
    key.push_str(&field_num.to_string());
    if let Some(c) = component_num {
        key.push('.');
        key.push_str(&c.to_string());
    }
    if let Some(s) = subcomponent_num {
        key.push('.');
        key.push_str(&s.to_string());
    }
    out.insert(key.clone(), value.to_string());

    // Also index the first occurrence of a segment under an explicit `.0.` prefix-free form is
    // the bare key above; further occurrences get `<segment>#<n>.<rest>` so repeats don't
    // silently clobber the first one.
    if occurrence > 0 {
        let mut repeated_key = String::new();
        repeated_key.push_str(segment_id);
        repeated_key.push('#');
        repeated_key.push_str(&occurrence.to_string());
        repeated_key.push('.');
        repeated_key.push_str(&field_num.to_string());
        if let Some(c) = component_num {
            repeated_key.push('.');
            repeated_key.push_str(&c.to_string());
        }
        if let Some(s) = subcomponent_num {
            repeated_key.push('.');
            repeated_key.push_str(&s.to_string());
        }
        out.insert(repeated_key, value.to_string());
    }
}

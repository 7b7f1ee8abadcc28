//! HL7<->FHIR transformation engine (C8): field-path flattening, a closed-grammar template
//! renderer, and rule-driven mapping between envelope representations.

pub mod engine;
pub mod rules;
pub mod template;

pub use engine::{apply, apply_named, flatten_json};
pub use rules::{default_rules, MessageFormat, TransformationRegistry, TransformationRule};

//! FHIR R4 JSON validation (C7).

pub mod validator;

pub use validator::{unwrap_bundle, validate_resource};

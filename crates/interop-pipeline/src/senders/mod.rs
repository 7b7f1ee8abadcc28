//! Outbound senders (C10): the egress half of the pipeline, one adapter per wire protocol.

pub mod file;
pub mod fhir;
pub mod mllp;

pub use file::{send as send_file, FileSenderConfig};
pub use fhir::{FhirAuth, FhirSender};
pub use mllp::MllpSender;

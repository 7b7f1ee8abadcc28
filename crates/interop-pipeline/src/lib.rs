//! Stage worker framework, ingest/egress adapters, and the orchestrator wiring them together
//! (C3-C5, C10-C11).

pub mod file_watcher;
pub mod http_listener;
pub mod mllp_listener;
pub mod orchestrator;
pub mod processors;
pub mod senders;
pub mod stage;

pub use orchestrator::Orchestrator;
pub use stage::{ProcessOutcome, Processor, Stage, StageState};

//! Processor hooks (§4.5-§4.8) wired into [`crate::stage::Stage`]: validation, transformation,
//! and routing, each expressed as the closure shape [`crate::stage::Processor`]'s blanket impl
//! accepts.

use crate::stage::{ProcessFuture, ProcessOutcome, Processor};
use interop_core::envelope::{BodyContent, Envelope, MessageStatus};
use interop_core::error::EngineError;
use interop_core::queue::QueueManager;
use interop_routing::RoutingEngine;
use interop_transform::TransformationRegistry;
use std::sync::Arc;

fn outcome_for(error: EngineError) -> ProcessOutcome {
    if error.kind.retryable() {
        ProcessOutcome::Retry { error }
    } else {
        ProcessOutcome::DeadLetter { error }
    }
}

fn validate_envelope(envelope: &Envelope) -> Result<(), EngineError> {
    match &envelope.body.content {
        BodyContent::Hl7(_) => {
            let parsed = interop_hl7::parse_message(&envelope.body.raw_content)?;
            interop_hl7::validator::validate(&parsed)
        }
        BodyContent::Fhir(value) => interop_fhir::validate_resource(value),
        BodyContent::Raw => Err(EngineError::validation("body has not been parsed yet")),
    }
}

/// Validation stage processor (C7): parses and validates, then passes the envelope through
/// unchanged with `status` advanced to `Validated`.
pub struct ValidationProcessor;

impl Processor for ValidationProcessor {
    fn process(&self, envelope: Envelope) -> ProcessFuture {
        Box::pin(async move {
            match validate_envelope(&envelope) {
                Ok(()) => {
                    let mut validated = envelope;
                    validated.header.status = MessageStatus::Validated;
                    ProcessOutcome::Success { outputs: vec![validated] }
                }
                Err(e) => outcome_for(e),
            }
        })
    }
}

/// Transformation stage processor (C8): applies every rule whose source side matches the
/// envelope, emitting one derived envelope per match (§4.7 step 2 allows fan-out).
pub struct TransformationProcessor {
    pub registry: Arc<TransformationRegistry>,
}

impl Processor for TransformationProcessor {
    fn process(&self, envelope: Envelope) -> ProcessFuture {
        let registry = Arc::clone(&self.registry);
        Box::pin(async move {
            let source_format = match &envelope.body.content {
                BodyContent::Hl7(_) => interop_transform::MessageFormat::Hl7v2,
                BodyContent::Fhir(_) => interop_transform::MessageFormat::Fhir,
                BodyContent::Raw => {
                    return ProcessOutcome::DeadLetter {
                        error: EngineError::validation("body has not been parsed yet"),
                    }
                }
            };
            let rules = registry.find(source_format, &envelope.header.message_type, None);
            if rules.is_empty() {
                // No matching rule: pass the envelope through unchanged rather than dead-lettering,
                // since not every message type is expected to have a transformation.
                return ProcessOutcome::Success { outputs: vec![envelope] };
            }
            let mut outputs = Vec::with_capacity(rules.len());
            for rule in rules {
                match interop_transform::apply(rule, &envelope) {
                    Ok(derived) => outputs.push(derived),
                    Err(e) => return outcome_for(e),
                }
            }
            ProcessOutcome::Success { outputs }
        })
    }
}

/// Routing stage processor (C9): dispatches through [`RoutingEngine`], which itself publishes to
/// `forward`/`transform` targets, so this stage's own output queue is always `None`.
pub struct RoutingProcessor {
    pub engine: Arc<RoutingEngine>,
    pub queues: Arc<QueueManager<Envelope>>,
    pub transforms: Arc<TransformationRegistry>,
}

impl Processor for RoutingProcessor {
    fn process(&self, envelope: Envelope) -> ProcessFuture {
        let engine = Arc::clone(&self.engine);
        let queues = Arc::clone(&self.queues);
        let transforms = Arc::clone(&self.transforms);
        Box::pin(async move {
            match engine.dispatch(envelope, &queues, &transforms).await {
                Ok(_) => ProcessOutcome::Success { outputs: vec![] },
                Err(e) => outcome_for(e),
            }
        })
    }
}

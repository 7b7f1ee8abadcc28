//! Stage worker framework (C3): lifecycle, in-flight task tracking, and ack-after-success
//! dispatch around a single `process()` hook.

use interop_core::envelope::Envelope;
use interop_core::error::{EngineError, EngineResult};
use interop_core::queue::{Queue, QueueManager};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A stage's position in the lifecycle lattice (§4.2): stopped -> starting -> running -> stopping
/// -> stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Outcome of one `process()` call: zero or more derived envelopes to publish downstream, plus
/// whether the input message should be acked or nacked/dead-lettered.
pub enum ProcessOutcome {
    /// Processing succeeded; publish `outputs` to the stage's output queue (if any), then ack.
    Success { outputs: Vec<Envelope> },
    /// Processing failed with a retryable error; requeued with an incremented retry count until
    /// `max_retries` is hit, then dead-lettered.
    Retry { error: EngineError },
    /// Processing failed terminally; route to the stage's error queue rather than redelivering.
    DeadLetter { error: EngineError },
}

pub type ProcessFuture = Pin<Box<dyn Future<Output = ProcessOutcome> + Send>>;

/// The single hook a stage implements. Boxed so `Stage` can be generic over behavior without a
/// type parameter per stage kind.
pub trait Processor: Send + Sync + 'static {
    fn process(&self, envelope: Envelope) -> ProcessFuture;
}

impl<F, Fut> Processor for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessOutcome> + Send + 'static,
{
    fn process(&self, envelope: Envelope) -> ProcessFuture {
        Box::pin(self(envelope))
    }
}

/// One independently-startable/stoppable worker: a name, an input queue, an optional output
/// queue, an error (dead-letter) queue, and the processor hook that does the actual work.
pub struct Stage {
    pub name: String,
    input_queue: Arc<dyn Queue<Envelope>>,
    output_queue: Option<Arc<dyn Queue<Envelope>>>,
    error_queue: Arc<dyn Queue<Envelope>>,
    processor: Arc<dyn Processor>,
    max_retries: u32,
    drain_timeout: Duration,
    state: Mutex<StageState>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    in_flight: Arc<AtomicU64>,
    drained: Arc<Notify>,
}

impl Stage {
    pub fn new(
        name: impl Into<String>,
        input_queue: Arc<dyn Queue<Envelope>>,
        output_queue: Option<Arc<dyn Queue<Envelope>>>,
        error_queue: Arc<dyn Queue<Envelope>>,
        processor: Arc<dyn Processor>,
        max_retries: u32,
        drain_timeout: Duration,
    ) -> Self {
        Stage {
            name: name.into(),
            input_queue,
            output_queue,
            error_queue,
            processor,
            max_retries,
            drain_timeout,
            state: Mutex::new(StageState::Stopped),
            stop_tx: Mutex::new(None),
            loop_handle: Mutex::new(None),
            in_flight: Arc::new(AtomicU64::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    pub async fn state(&self) -> StageState {
        *self.state.lock().await
    }

    /// stopped -> starting -> running. Spawns the consume loop as a tracked task.
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        {
            let mut state = self.state.lock().await;
            if *state != StageState::Stopped {
                return Err(EngineError::internal(format!(
                    "stage {} cannot start from state other than stopped",
                    self.name
                )));
            }
            *state = StageState::Starting;
        }

        let (stop_tx, stop_rx) = mpsc::channel(1);
        *self.stop_tx.lock().await = Some(stop_tx);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_loop(stop_rx).await });
        *self.loop_handle.lock().await = Some(handle);
        *self.state.lock().await = StageState::Running;
        info!(stage = %self.name, "stage started");
        Ok(())
    }

    /// running -> stopping -> stopped. Signals the consume loop, waits up to `drain_timeout` for
    /// in-flight tasks to finish, then joins the loop task regardless.
    pub async fn stop(self: &Arc<Self>) -> EngineResult<()> {
        {
            let mut state = self.state.lock().await;
            if *state != StageState::Running {
                return Ok(());
            }
            *state = StageState::Stopping;
        }

        if let Some(tx) = self.stop_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }

        let wait_for_drain = async {
            while self.in_flight.load(Ordering::SeqCst) > 0 {
                self.drained.notified().await;
            }
        };
        if tokio::time::timeout(self.drain_timeout, wait_for_drain).await.is_err() {
            warn!(stage = %self.name, "drain timeout elapsed with tasks still in flight");
        }

        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        *self.state.lock().await = StageState::Stopped;
        info!(stage = %self.name, "stage stopped");
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, mut stop_rx: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                biased;
                _ = stop_rx.recv() => {
                    debug!(stage = %self.name, "stop signal received");
                    return;
                }
                consumed = self.input_queue.consume() => {
                    match consumed {
                        Ok(Some((tag, envelope))) => {
                            self.in_flight.fetch_add(1, Ordering::SeqCst);
                            let this = Arc::clone(&self);
                            tokio::spawn(async move {
                                this.handle_one(tag, envelope).await;
                                if this.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                                    this.drained.notify_waiters();
                                }
                            });
                        }
                        Ok(None) => {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                        }
                        Err(e) => {
                            error!(stage = %self.name, error = %e, "consume failed");
                            tokio::time::sleep(Duration::from_millis(200)).await;
                        }
                    }
                }
            }
        }
    }

    /// Dispatches one delivery: ack only after `process()` returns success AND its outputs are
    /// published (§9 "resist the temptation to ack-before-process").
    async fn handle_one(&self, tag: interop_core::queue::DeliveryTag, envelope: Envelope) {
        match self.processor.process(envelope.clone()).await {
            ProcessOutcome::Success { outputs } => {
                let mut publish_failed = false;
                if let Some(output_queue) = &self.output_queue {
                    for out in outputs {
                        if let Err(e) = output_queue.publish(out).await {
                            error!(stage = %self.name, error = %e, "failed publishing stage output");
                            publish_failed = true;
                        }
                    }
                }
                if publish_failed {
                    let _ = self.input_queue.nack(tag).await;
                } else if let Err(e) = self.input_queue.ack(tag).await {
                    error!(stage = %self.name, error = %e, "ack failed");
                }
            }
            ProcessOutcome::Retry { error } => {
                // Redelivery via `nack` would requeue the same, unmodified envelope, so the
                // retry count above would never advance. Ack the failed delivery and republish
                // an incremented copy instead, so the cap is actually reachable. Every attempt,
                // successful or not, gets its own error entry so a dead-lettered envelope carries
                // exactly `max_retries` accumulated errors.
                let retried = envelope.header.status.clone();
                let mut next = envelope.with_incremented_retry(retried);
                next.header.push_error(&self.name, &format!("{:?}", error.kind), &error.message);
                if next.header.retry_count >= self.max_retries {
                    warn!(stage = %self.name, error = %error, "retries exhausted, dead-lettering");
                    if let Err(e) = self.error_queue.publish(next).await {
                        error!(stage = %self.name, error = %e, "failed publishing to error queue");
                    }
                } else {
                    warn!(stage = %self.name, error = %error, "retryable failure, requeuing with incremented retry count");
                    if let Err(e) = self.input_queue.publish(next).await {
                        error!(stage = %self.name, error = %e, "failed requeuing for retry");
                    }
                }
                let _ = self.input_queue.ack(tag).await;
            }
            ProcessOutcome::DeadLetter { error } => {
                self.dead_letter(envelope, &error).await;
                let _ = self.input_queue.ack(tag).await;
            }
        }
    }

    async fn dead_letter(&self, mut envelope: Envelope, error: &EngineError) {
        envelope.header.push_error(&self.name, &format!("{:?}", error.kind), &error.message);
        if let Err(e) = self.error_queue.publish(envelope).await {
            error!(stage = %self.name, error = %e, "failed publishing to error queue");
        }
    }
}

/// Convenience constructor used by the orchestrator: resolves input/output/error queue handles
/// from a [`QueueManager`] by name.
pub async fn build_stage(
    name: impl Into<String>,
    queues: &QueueManager<Envelope>,
    input_queue: &str,
    output_queue: Option<&str>,
    error_queue: &str,
    processor: Arc<dyn Processor>,
    max_retries: u32,
    drain_timeout: Duration,
) -> Arc<Stage> {
    let input = queues.queue(input_queue).await;
    let output = match output_queue {
        Some(name) => Some(queues.queue(name).await),
        None => None,
    };
    let error = queues.queue(error_queue).await;
    Arc::new(Stage::new(name, input, output, error, processor, max_retries, drain_timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use interop_core::envelope::{Body, Header};
    use interop_core::queue::QueueConfig;
    use std::sync::atomic::AtomicUsize;

    fn test_envelope() -> Envelope {
        let header = Header::new("ADT^A01", "application/hl7-v2+er7", "test://");
        let body = Body::from_raw("application/hl7-v2+er7", Vec::new());
        Envelope::new(header, body)
    }

    struct CountingProcessor {
        seen: Arc<AtomicUsize>,
    }

    impl Processor for CountingProcessor {
        fn process(&self, envelope: Envelope) -> ProcessFuture {
            let seen = Arc::clone(&self.seen);
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
                ProcessOutcome::Success { outputs: vec![envelope] }
            })
        }
    }

    #[tokio::test]
    async fn acks_after_successful_process_and_publish() {
        let queues = QueueManager::<Envelope>::new(QueueConfig::default());
        let input = queues.queue("in").await;
        let output = queues.queue("out").await;
        let error = queues.queue("err").await;
        input.publish(test_envelope()).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let processor = Arc::new(CountingProcessor { seen: Arc::clone(&seen) });
        let stage = Arc::new(Stage::new(
            "validation",
            input.clone(),
            Some(output.clone()),
            error.clone(),
            processor,
            5,
            Duration::from_secs(1),
        ));
        stage.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        stage.stop().await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(output.len().await, 1);
        assert_eq!(input.len().await, 0);
    }

    struct FailingProcessor;
    impl Processor for FailingProcessor {
        fn process(&self, _envelope: Envelope) -> ProcessFuture {
            Box::pin(async move {
                ProcessOutcome::DeadLetter { error: EngineError::validation("boom") }
            })
        }
    }

    #[tokio::test]
    async fn dead_letters_on_terminal_failure() {
        let queues = QueueManager::<Envelope>::new(QueueConfig::default());
        let input = queues.queue("in2").await;
        let error = queues.queue("err2").await;
        input.publish(test_envelope()).await.unwrap();

        let stage = Arc::new(Stage::new(
            "transformation",
            input.clone(),
            None,
            error.clone(),
            Arc::new(FailingProcessor),
            5,
            Duration::from_secs(1),
        ));
        stage.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        stage.stop().await.unwrap();

        assert_eq!(error.len().await, 1);
        assert_eq!(input.len().await, 0);
    }

    struct AlwaysRetryProcessor {
        attempts: Arc<AtomicUsize>,
    }
    impl Processor for AlwaysRetryProcessor {
        fn process(&self, _envelope: Envelope) -> ProcessFuture {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                ProcessOutcome::Retry { error: EngineError::transport("unreachable") }
            })
        }
    }

    #[tokio::test]
    async fn retry_count_advances_and_dead_letters_once_max_retries_is_hit() {
        let queues = QueueManager::<Envelope>::new(QueueConfig::default());
        let input = queues.queue("in3").await;
        let error = queues.queue("err3").await;
        input.publish(test_envelope()).await.unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let stage = Arc::new(Stage::new(
            "validation",
            input.clone(),
            None,
            error.clone(),
            Arc::new(AlwaysRetryProcessor { attempts: Arc::clone(&attempts) }),
            2,
            Duration::from_secs(1),
        ));
        stage.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        stage.stop().await.unwrap();

        // retry_count starts at 0: attempt 1 (incremented to 1, 1<2, requeue), attempt 2
        // (incremented to 2, 2>=2, dead-letter). Exactly max_retries attempts, each contributing
        // one accumulated error entry.
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(error.len().await, 1);
        assert_eq!(input.len().await, 0);
        let (_, dead_lettered) = error.consume().await.unwrap().unwrap();
        assert_eq!(dead_lettered.header.retry_count, 2);
        let errors = dead_lettered.header.metadata.get("errors").and_then(|v| v.as_array()).unwrap();
        assert_eq!(errors.len(), 2);
    }
}

//! Orchestrator (C11): builds every configured stage and adapter from [`EngineConfig`], starts
//! them in a fixed order, and tears them down in reverse on shutdown (§6).

use crate::file_watcher::{self, FileWatcherConfig as FileWatcherRuntimeConfig};
use crate::http_listener;
use crate::mllp_listener;
use crate::processors::{RoutingProcessor, TransformationProcessor, ValidationProcessor};
use crate::senders::{self, FhirAuth, FhirSender, MllpSender};
use crate::stage::{build_stage, Stage};
use interop_core::config::EngineConfig;
use interop_core::envelope::Envelope;
use interop_core::error::{EngineError, EngineResult};
use interop_core::queue::{BackpressurePolicy, QueueBackendKind, QueueConfig, QueueManager};
use interop_routing::{Condition, Operator, RouteAction, RouteRule, RoutingEngine};
use interop_transform::{default_rules, TransformationRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Tracks every started piece so shutdown can unwind them in reverse order. Inbound listeners
/// and the file watcher are plain background tasks (no ack/retry lifecycle of their own); stages
/// carry full start/stop semantics.
pub struct Orchestrator {
    queues: Arc<QueueManager<Envelope>>,
    stages: Vec<Arc<Stage>>,
    background: Vec<(&'static str, mpsc::Sender<()>, tokio::task::JoinHandle<()>)>,
    shutdown_timeout: Duration,
}

impl Orchestrator {
    /// Builds every inbound listener, processing stage, and outbound sender named in `config`.
    /// Nothing is started yet; call [`Orchestrator::start`] afterward.
    pub async fn build(config: &EngineConfig) -> EngineResult<Self> {
        let queues = Arc::new(QueueManager::<Envelope>::new(queue_config(config)));
        let mut orchestrator = Orchestrator {
            queues: Arc::clone(&queues),
            stages: Vec::new(),
            background: Vec::new(),
            shutdown_timeout: Duration::from_secs(config.global.shutdown_timeout_secs),
        };

        orchestrator.build_processing_stages(config).await?;
        orchestrator.build_senders(config).await?;
        Ok(orchestrator)
    }

    /// The queue manager backing every stage and sender this orchestrator wired up — exposed so
    /// callers (tests, the CLI's `--dry-run` inspector) can publish directly into a named queue
    /// rather than going through an inbound listener.
    pub fn queues(&self) -> &Arc<QueueManager<Envelope>> {
        &self.queues
    }

    async fn build_processing_stages(&mut self, config: &EngineConfig) -> EngineResult<()> {
        if let Some(io) = &config.processing.validation {
            if io.enabled {
                let stage = build_stage(
                    "validation",
                    &self.queues,
                    &io.input_queue,
                    io.output_queue.as_deref(),
                    &io.error_queue,
                    Arc::new(ValidationProcessor),
                    io.max_retries,
                    self.shutdown_timeout,
                )
                .await;
                self.stages.push(stage);
            }
        }

        if let Some(io) = &config.processing.transformation {
            if io.enabled {
                let mut registry = TransformationRegistry::new();
                for (_, rule) in default_rules() {
                    registry.register(rule);
                }
                let stage = build_stage(
                    "transformation",
                    &self.queues,
                    &io.input_queue,
                    io.output_queue.as_deref(),
                    &io.error_queue,
                    Arc::new(TransformationProcessor { registry: Arc::new(registry) }),
                    io.max_retries,
                    self.shutdown_timeout,
                )
                .await;
                self.stages.push(stage);
            }
        }

        if let Some(routing_config) = &config.processing.routing {
            if routing_config.io.enabled {
                let mut engine = RoutingEngine::new();
                for route in &routing_config.routes {
                    engine.register(build_route_rule(route)?);
                }
                let mut registry = TransformationRegistry::new();
                for (_, rule) in default_rules() {
                    registry.register(rule);
                }
                let stage = build_stage(
                    "routing",
                    &self.queues,
                    &routing_config.io.input_queue,
                    None,
                    &routing_config.io.error_queue,
                    Arc::new(RoutingProcessor {
                        engine: Arc::new(engine),
                        queues: Arc::clone(&self.queues),
                        transforms: Arc::new(registry),
                    }),
                    routing_config.io.max_retries,
                    self.shutdown_timeout,
                )
                .await;
                self.stages.push(stage);
            }
        }

        Ok(())
    }

    async fn build_senders(&mut self, config: &EngineConfig) -> EngineResult<()> {
        for sender_config in &config.outbound.mllp {
            let addr = format!("{}:{}", sender_config.host, sender_config.port);
            let sender = MllpSender::new(addr);
            let input = self.queues.queue(&sender_config.input_queue).await;
            let error = self.queues.queue(&sender_config.error_queue).await;
            self.spawn_sender_loop(sender_config.name.clone(), input, error, sender_config.max_retries, move |envelope| {
                let sender = Arc::clone(&sender);
                async move { sender.send(&envelope).await }
            });
        }

        for sender_config in &config.outbound.fhir {
            let auth = fhir_auth(sender_config);
            let sender = FhirSender::new(sender_config.base_url.clone(), auth);
            let input = self.queues.queue(&sender_config.input_queue).await;
            let error = self.queues.queue(&sender_config.error_queue).await;
            self.spawn_sender_loop(sender_config.name.clone(), input, error, sender_config.max_retries, move |envelope| {
                let sender = Arc::clone(&sender);
                async move { sender.send(&envelope).await }
            });
        }

        for sender_config in &config.outbound.file {
            let file_config = Arc::new(senders::FileSenderConfig {
                directory: PathBuf::from(&sender_config.directory),
                create_subdirs: sender_config.create_subdirs,
            });
            let input = self.queues.queue(&sender_config.input_queue).await;
            let error = self.queues.queue(&sender_config.error_queue).await;
            self.spawn_sender_loop(sender_config.name.clone(), input, error, sender_config.max_retries, move |envelope| {
                let file_config = Arc::clone(&file_config);
                async move { senders::send_file(&file_config, &envelope).await }
            });
        }

        Ok(())
    }

    /// Outbound senders aren't `Stage`s (they have no output queue and their "process" is a
    /// network call rather than a pure transform), so each gets its own small consume/retry loop
    /// as a background task instead.
    fn spawn_sender_loop<F, Fut>(
        &mut self,
        name: String,
        input: Arc<dyn interop_core::queue::Queue<Envelope>>,
        error_queue: Arc<dyn interop_core::queue::Queue<Envelope>>,
        max_retries: u32,
        send: F,
    ) where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = EngineResult<()>> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let label: &'static str = Box::leak(format!("sender:{name}").into_boxed_str());
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.recv() => return,
                    consumed = input.consume() => {
                        match consumed {
                            Ok(Some((tag, mut envelope))) => {
                                match send(envelope.clone()).await {
                                    Ok(()) => { let _ = input.ack(tag).await; }
                                    Err(e) if e.kind.retryable() => {
                                        envelope.header.push_error(&name, &format!("{:?}", e.kind), &e.message);
                                        let retried = envelope.header.status;
                                        let next = envelope.with_incremented_retry(retried);
                                        if next.header.retry_count >= max_retries {
                                            warn!(sender = %name, error = %e, "retries exhausted, dead-lettering");
                                            let _ = error_queue.publish(next).await;
                                        } else {
                                            // Ack the failed delivery and republish an incremented
                                            // copy; a bare `nack` would requeue the same retry_count
                                            // forever and the cap below would never engage.
                                            warn!(sender = %name, error = %e, "send failed, requeuing with incremented retry count");
                                            let _ = input.publish(next).await;
                                        }
                                        let _ = input.ack(tag).await;
                                    }
                                    Err(e) => {
                                        envelope.header.push_error(&name, &format!("{:?}", e.kind), &e.message);
                                        let _ = error_queue.publish(envelope).await;
                                        let _ = input.ack(tag).await;
                                    }
                                }
                            }
                            Ok(None) => tokio::time::sleep(Duration::from_millis(20)).await,
                            Err(e) => {
                                warn!(sender = %name, error = %e, "consume failed");
                                tokio::time::sleep(Duration::from_millis(200)).await;
                            }
                        }
                    }
                }
            }
        });
        self.background.push((label, stop_tx, handle));
    }

    /// Starts inbound listeners, then processing stages, in that order (§6 "ingests before
    /// processors" so nothing processes before there is somewhere to route its output).
    pub async fn start(&mut self, config: &EngineConfig) -> EngineResult<()> {
        for mllp in &config.inbound.mllp {
            let ingest = self.queues.queue("raw_messages").await;
            let (stop_tx, stop_rx) = mpsc::channel(1);
            let addr = mllp.bind.clone();
            let listener_config = mllp.clone();
            let label: &'static str = Box::leak(format!("mllp_listener:{addr}").into_boxed_str());
            let handle = tokio::spawn(async move {
                if let Err(e) = mllp_listener::run(&listener_config, ingest, stop_rx).await {
                    warn!(error = %e, "MLLP listener exited with error");
                }
            });
            self.background.push((label, stop_tx, handle));
        }

        if let Some(http) = &config.inbound.http {
            let ingest = self.queues.queue("raw_messages").await;
            let (stop_tx, stop_rx) = mpsc::channel(1);
            let bind = http.bind.clone();
            let label: &'static str = Box::leak(format!("http_listener:{bind}").into_boxed_str());
            let handle = tokio::spawn(async move {
                if let Err(e) = http_listener::run(&bind, ingest, stop_rx).await {
                    warn!(error = %e, "HTTP FHIR listener exited with error");
                }
            });
            self.background.push((label, stop_tx, handle));
        }

        for watcher in &config.inbound.file_watchers {
            let ingest = self.queues.queue("raw_messages").await;
            let (stop_tx, stop_rx) = mpsc::channel(1);
            let watch_dir = PathBuf::from(&watcher.directory);
            let mut runtime_config = FileWatcherRuntimeConfig::new(
                watch_dir.clone(),
                watch_dir.join("processed"),
                watch_dir.join("error"),
            );
            runtime_config.glob = watcher.glob.clone();
            runtime_config.poll_interval = Duration::from_millis(watcher.poll_interval_ms);
            let label: &'static str = Box::leak(format!("file_watcher:{}", watcher.directory).into_boxed_str());
            let handle = tokio::spawn(async move {
                file_watcher::run(runtime_config, ingest, stop_rx).await;
            });
            self.background.push((label, stop_tx, handle));
        }

        for stage in &self.stages {
            stage.start().await?;
        }

        info!(stages = self.stages.len(), background = self.background.len(), "orchestrator started");
        Ok(())
    }

    /// Stops processing stages before background listeners/senders, reversing [`Orchestrator::start`].
    pub async fn stop(&mut self) {
        for stage in self.stages.iter().rev() {
            if let Err(e) = stage.stop().await {
                warn!(stage = %stage.name, error = %e, "error stopping stage");
            }
        }
        while let Some((label, stop_tx, handle)) = self.background.pop() {
            let _ = stop_tx.send(()).await;
            if tokio::time::timeout(self.shutdown_timeout, handle).await.is_err() {
                warn!(task = label, "background task did not stop within shutdown timeout");
            }
        }
        info!("orchestrator stopped");
    }
}

fn queue_config(config: &EngineConfig) -> QueueConfig {
    let backend = if config.queues.backend == "streams" {
        QueueBackendKind::Streams
    } else {
        QueueBackendKind::Memory
    };
    let policy = if config.queues.reject_when_full {
        BackpressurePolicy::Reject
    } else {
        BackpressurePolicy::Block
    };
    QueueConfig {
        backend,
        max_size: config.queues.max_size,
        maxlen: config.queues.maxlen,
        policy,
        visibility_timeout: Duration::from_secs(config.queues.visibility_timeout_secs),
    }
}

fn fhir_auth(config: &interop_core::config::FhirSenderConfig) -> FhirAuth {
    if let (Some(token_url), Some(client_id), Some(client_secret)) =
        (&config.token_url, &config.client_id, &config.client_secret)
    {
        return FhirAuth::ClientCredentials {
            token_url: token_url.clone(),
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
            scope: config.scope.clone(),
        };
    }
    if let Some(token) = &config.bearer_token {
        return FhirAuth::Bearer { token: token.clone() };
    }
    if let Some((username, password)) = &config.basic_auth {
        return FhirAuth::Basic { username: username.clone(), password: password.clone() };
    }
    FhirAuth::None
}

fn build_route_rule(config: &interop_core::config::RouteRuleConfig) -> EngineResult<RouteRule> {
    let conditions = config
        .conditions
        .iter()
        .map(|c| {
            let operator = parse_operator(&c.operator)?;
            Condition::new(c.field_path.clone(), operator, c.value.clone())
                .map_err(EngineError::validation)
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let actions = config
        .actions
        .iter()
        .map(|a| match a {
            interop_core::config::RouteActionConfig::Forward { target_queue } => {
                RouteAction::Forward { target_queue: target_queue.clone() }
            }
            interop_core::config::RouteActionConfig::Transform { rule_name } => {
                RouteAction::Transform { rule_name: rule_name.clone() }
            }
            interop_core::config::RouteActionConfig::Drop => RouteAction::Drop,
            interop_core::config::RouteActionConfig::Log { level, message } => {
                RouteAction::Log { level: level.clone(), message: message.clone() }
            }
        })
        .collect();

    Ok(RouteRule {
        name: config.name.clone(),
        priority: config.priority,
        conditions,
        actions,
        enabled: config.enabled,
    })
}

fn parse_operator(raw: &str) -> EngineResult<Operator> {
    match raw {
        "eq" => Ok(Operator::Eq),
        "ne" => Ok(Operator::Ne),
        "gt" => Ok(Operator::Gt),
        "ge" => Ok(Operator::Ge),
        "lt" => Ok(Operator::Lt),
        "le" => Ok(Operator::Le),
        "contains" => Ok(Operator::Contains),
        "regex" => Ok(Operator::Regex),
        "in" => Ok(Operator::In),
        "not_in" => Ok(Operator::NotIn),
        other => Err(EngineError::validation(format!("unknown route operator: {other}"))),
    }
}

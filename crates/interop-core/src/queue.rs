//! The queue abstraction (C2): a named, ordered, multi-consumer channel with
//! publish/consume/ack/nack and at-least-once delivery.
//!
//! Two backends share one contract, matching §4.1 of the spec:
//!
//! - [`InMemoryQueue`]: a bounded `VecDeque` plus a pending-tag table. Not durable; the default
//!   for tests and single-process deployments.
//! - [`StreamQueue`]: an append-only log with a single consumer-group cursor and approximate
//!   `maxlen` trimming, modeling the "streams/log backend" described in the spec without
//!   depending on an actual external log service — a real Redis-Streams-backed implementation is
//!   a drop-in behind the same [`Queue`] trait (see DESIGN.md).

use crate::error::{EngineError, EngineResult, ErrorKind};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

/// Opaque token identifying one in-flight delivery of a message on one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

/// What a bounded queue does when `publish` would exceed capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Await until space frees up.
    Block,
    /// Fail immediately with [`ErrorKind::Backpressure`].
    Reject,
}

struct Pending<T> {
    item: T,
    deadline: Instant,
}

/// Shared contract both backends implement. Generic over the envelope type so
/// `interop-core` does not need to depend on `interop-pipeline`.
#[async_trait::async_trait]
pub trait Queue<T: Clone + Send + Sync + 'static>: Send + Sync {
    async fn publish(&self, item: T) -> EngineResult<()>;
    /// Returns the next undelivered item, if any, tagging it for ack/nack.
    async fn consume(&self) -> EngineResult<Option<(DeliveryTag, T)>>;
    async fn ack(&self, tag: DeliveryTag) -> EngineResult<()>;
    async fn nack(&self, tag: DeliveryTag) -> EngineResult<()>;
    /// Moves any delivery whose visibility window has expired back onto the ready queue.
    /// Returns how many were requeued. Called lazily by `consume` and may also be driven by a
    /// periodic sweep task.
    async fn sweep_expired(&self) -> EngineResult<usize>;
    async fn len(&self) -> usize;
}

/// In-memory FIFO backend. FIFO per queue per publisher, as required by §4.1.
pub struct InMemoryQueue<T> {
    inner: Mutex<InMemoryState<T>>,
    notify: Notify,
    max_size: Option<usize>,
    policy: BackpressurePolicy,
    visibility_timeout: Duration,
    next_tag: AtomicU64,
}

struct InMemoryState<T> {
    ready: VecDeque<T>,
    pending: HashMap<DeliveryTag, Pending<T>>,
    issued: HashSet<DeliveryTag>,
}

impl<T: Clone + Send + Sync + 'static> InMemoryQueue<T> {
    pub fn new(max_size: Option<usize>, policy: BackpressurePolicy, visibility_timeout: Duration) -> Self {
        InMemoryQueue {
            inner: Mutex::new(InMemoryState {
                ready: VecDeque::new(),
                pending: HashMap::new(),
                issued: HashSet::new(),
            }),
            notify: Notify::new(),
            max_size,
            policy,
            visibility_timeout,
            next_tag: AtomicU64::new(1),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None, BackpressurePolicy::Reject, Duration::from_secs(30))
    }

    fn sweep_locked(state: &mut InMemoryState<T>) -> usize {
        let now = Instant::now();
        let expired_tags: Vec<DeliveryTag> = state
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();
        let count = expired_tags.len();
        for tag in expired_tags {
            if let Some(p) = state.pending.remove(&tag) {
                state.ready.push_back(p.item);
            }
        }
        count
    }
}

#[async_trait::async_trait]
impl<T: Clone + Send + Sync + 'static> Queue<T> for InMemoryQueue<T> {
    async fn publish(&self, item: T) -> EngineResult<()> {
        loop {
            {
                let mut state = self.inner.lock().await;
                let at_capacity = self
                    .max_size
                    .map(|max| state.ready.len() + state.pending.len() >= max)
                    .unwrap_or(false);
                if !at_capacity {
                    state.ready.push_back(item);
                    drop(state);
                    self.notify.notify_one();
                    return Ok(());
                }
                if self.policy == BackpressurePolicy::Reject {
                    return Err(EngineError::new(ErrorKind::Backpressure, "queue is full"));
                }
            }
            self.notify.notified().await;
        }
    }

    async fn consume(&self) -> EngineResult<Option<(DeliveryTag, T)>> {
        let mut state = self.inner.lock().await;
        Self::sweep_locked(&mut state);
        match state.ready.pop_front() {
            Some(item) => {
                let tag = DeliveryTag(self.next_tag.fetch_add(1, Ordering::SeqCst));
                state.issued.insert(tag);
                state.pending.insert(
                    tag,
                    Pending {
                        item: item.clone(),
                        deadline: Instant::now() + self.visibility_timeout,
                    },
                );
                self.notify.notify_one();
                Ok(Some((tag, item)))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> EngineResult<()> {
        let mut state = self.inner.lock().await;
        if !state.issued.contains(&tag) {
            return Err(EngineError::new(
                ErrorKind::Internal,
                "ack of unknown delivery tag",
            ));
        }
        state.pending.remove(&tag);
        self.notify.notify_one();
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag) -> EngineResult<()> {
        let mut state = self.inner.lock().await;
        if !state.issued.contains(&tag) {
            return Err(EngineError::new(
                ErrorKind::Internal,
                "nack of unknown delivery tag",
            ));
        }
        if let Some(p) = state.pending.get_mut(&tag) {
            // Make it immediately eligible for redelivery rather than waiting out the full
            // visibility window again.
            p.deadline = Instant::now();
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn sweep_expired(&self) -> EngineResult<usize> {
        let mut state = self.inner.lock().await;
        Ok(Self::sweep_locked(&mut state))
    }

    async fn len(&self) -> usize {
        let state = self.inner.lock().await;
        state.ready.len() + state.pending.len()
    }
}

/// Append-only log backend with a single consumer-group cursor, modeling a streams/log service.
/// Ack advances the cursor past the tag; nack leaves the cursor behind so the entry redelivers
/// once its visibility expires. Publishes beyond `maxlen` approximately trim the oldest
/// already-acked entries.
pub struct StreamQueue<T> {
    inner: Mutex<StreamState<T>>,
    notify: Notify,
    maxlen: usize,
    visibility_timeout: Duration,
}

struct Entry<T> {
    item: T,
    acked: bool,
    delivered_at: Option<Instant>,
}

struct StreamState<T> {
    log: VecDeque<Entry<T>>,
    cursor: usize,
    /// offset subtracted from indices into `log` to account for trimming.
    base_offset: usize,
    tag_to_index: HashMap<DeliveryTag, usize>,
    issued: HashSet<DeliveryTag>,
    next_tag: u64,
}

impl<T: Clone + Send + Sync + 'static> StreamQueue<T> {
    pub fn new(maxlen: usize, visibility_timeout: Duration) -> Self {
        StreamQueue {
            inner: Mutex::new(StreamState {
                log: VecDeque::new(),
                cursor: 0,
                base_offset: 0,
                tag_to_index: HashMap::new(),
                issued: HashSet::new(),
                next_tag: 1,
            }),
            notify: Notify::new(),
            maxlen,
            visibility_timeout,
        }
    }

    fn trim_locked(state: &mut StreamState<T>, maxlen: usize) {
        while state.log.len() > maxlen {
            // Only ever trim from the front, and only entries already acked and past the
            // cursor, matching "approximate trimming" semantics.
            if state.base_offset >= state.cursor {
                break;
            }
            match state.log.front() {
                Some(e) if e.acked => {
                    state.log.pop_front();
                    state.base_offset += 1;
                }
                _ => break,
            }
        }
    }
}

#[async_trait::async_trait]
impl<T: Clone + Send + Sync + 'static> Queue<T> for StreamQueue<T> {
    async fn publish(&self, item: T) -> EngineResult<()> {
        let mut state = self.inner.lock().await;
        state.log.push_back(Entry {
            item,
            acked: false,
            delivered_at: None,
        });
        let maxlen = self.maxlen;
        Self::trim_locked(&mut state, maxlen);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn consume(&self) -> EngineResult<Option<(DeliveryTag, T)>> {
        let mut state = self.inner.lock().await;
        let now = Instant::now();
        // Redeliver anything past its visibility window first (FIFO is preserved because
        // cursor only advances past acked entries).
        let base = state.base_offset;
        let cursor = state.cursor;
        for (i, entry) in state.log.iter_mut().enumerate() {
            let idx = base + i;
            if idx < cursor && !entry.acked {
                if let Some(delivered_at) = entry.delivered_at {
                    if now.duration_since(delivered_at) >= self.visibility_timeout {
                        let tag = DeliveryTag(state.next_tag);
                        state.next_tag += 1;
                        state.issued.insert(tag);
                        state.tag_to_index.insert(tag, idx);
                        entry.delivered_at = Some(now);
                        return Ok(Some((tag, entry.item.clone())));
                    }
                }
            }
        }
        if state.cursor >= state.base_offset + state.log.len() {
            return Ok(None);
        }
        let idx = state.cursor;
        state.cursor += 1;
        let tag = DeliveryTag(state.next_tag);
        state.next_tag += 1;
        state.issued.insert(tag);
        state.tag_to_index.insert(tag, idx);
        let offset = idx - state.base_offset;
        let item = state.log[offset].item.clone();
        state.log[offset].delivered_at = Some(now);
        Ok(Some((tag, item)))
    }

    async fn ack(&self, tag: DeliveryTag) -> EngineResult<()> {
        let mut state = self.inner.lock().await;
        if !state.issued.contains(&tag) {
            return Err(EngineError::new(
                ErrorKind::Internal,
                "ack of unknown delivery tag",
            ));
        }
        if let Some(&idx) = state.tag_to_index.get(&tag) {
            let offset = idx.saturating_sub(state.base_offset);
            if let Some(entry) = state.log.get_mut(offset) {
                entry.acked = true;
            }
        }
        let maxlen = self.maxlen;
        Self::trim_locked(&mut state, maxlen);
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag) -> EngineResult<()> {
        let mut state = self.inner.lock().await;
        if !state.issued.contains(&tag) {
            return Err(EngineError::new(
                ErrorKind::Internal,
                "nack of unknown delivery tag",
            ));
        }
        if let Some(&idx) = state.tag_to_index.get(&tag) {
            let offset = idx.saturating_sub(state.base_offset);
            if let Some(entry) = state.log.get_mut(offset) {
                // Leave it behind the cursor; it redelivers once visibility expires.
                entry.delivered_at = Some(Instant::now() - self.visibility_timeout);
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn sweep_expired(&self) -> EngineResult<usize> {
        // Redelivery for the stream backend happens lazily inside consume(); nothing to do
        // proactively beyond that.
        Ok(0)
    }

    async fn len(&self) -> usize {
        let state = self.inner.lock().await;
        (state.base_offset + state.log.len()).saturating_sub(state.cursor)
    }
}

/// Backend selection, mirroring `queues.type` in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackendKind {
    Memory,
    Streams,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub backend: QueueBackendKind,
    pub max_size: Option<usize>,
    pub maxlen: usize,
    pub policy: BackpressurePolicy,
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            backend: QueueBackendKind::Memory,
            max_size: None,
            maxlen: 100_000,
            policy: BackpressurePolicy::Reject,
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

/// Process-local registry of named queues. The spec calls the queue manager a "process
/// singleton"; per DESIGN.md we thread an explicit instance through constructors instead of a
/// real global, so tests get their own manager.
pub struct QueueManager<T> {
    config: QueueConfig,
    queues: Mutex<HashMap<String, Arc<dyn Queue<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> QueueManager<T> {
    pub fn new(config: QueueConfig) -> Self {
        QueueManager {
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn build_backend(&self) -> Arc<dyn Queue<T>> {
        match self.config.backend {
            QueueBackendKind::Memory => Arc::new(InMemoryQueue::new(
                self.config.max_size,
                self.config.policy,
                self.config.visibility_timeout,
            )),
            QueueBackendKind::Streams => Arc::new(StreamQueue::new(
                self.config.maxlen,
                self.config.visibility_timeout,
            )),
        }
    }

    /// Returns the named queue, creating it lazily on first reference (§4.1).
    pub async fn queue(&self, name: &str) -> Arc<dyn Queue<T>> {
        let mut queues = self.queues.lock().await;
        if let Some(q) = queues.get(name) {
            return Arc::clone(q);
        }
        let q = self.build_backend();
        queues.insert(name.to_string(), Arc::clone(&q));
        q
    }

    /// Name of the dead-letter queue for a stage.
    pub fn dead_letter_name(stage: &str) -> String {
        format!("{stage}_dead_letter")
    }

    pub async fn dead_letter(&self, stage: &str) -> Arc<dyn Queue<T>> {
        self.queue(&Self::dead_letter_name(stage)).await
    }

    pub async fn queue_names(&self) -> Vec<String> {
        self.queues.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_per_queue_per_consumer() {
        let q = InMemoryQueue::<i32>::unbounded();
        for i in 0..5 {
            q.publish(i).await.unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..5 {
            let (tag, item) = q.consume().await.unwrap().unwrap();
            seen.push(item);
            q.ack(tag).await.unwrap();
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn idempotent_ack_and_unknown_tag_errors() {
        let q = InMemoryQueue::<&str>::unbounded();
        q.publish("hello").await.unwrap();
        let (tag, _) = q.consume().await.unwrap().unwrap();
        q.ack(tag).await.unwrap();
        // Second ack of the same tag is a safe no-op.
        assert!(q.ack(tag).await.is_ok());
        // An unknown tag is an error.
        assert!(q.ack(DeliveryTag(9999)).await.is_err());
    }

    #[tokio::test]
    async fn nack_makes_message_immediately_redeliverable() {
        let q = InMemoryQueue::<&str>::unbounded();
        q.publish("msg").await.unwrap();
        let (tag, _) = q.consume().await.unwrap().unwrap();
        q.nack(tag).await.unwrap();
        let (_, redelivered) = q.consume().await.unwrap().unwrap();
        assert_eq!(redelivered, "msg");
    }

    #[tokio::test]
    async fn backpressure_reject_when_full() {
        let q = InMemoryQueue::<i32>::new(Some(1), BackpressurePolicy::Reject, Duration::from_secs(1));
        q.publish(1).await.unwrap();
        assert!(q.publish(2).await.is_err());
    }

    #[tokio::test]
    async fn lazily_created_queues_are_distinct() {
        let manager = QueueManager::<i32>::new(QueueConfig::default());
        let a = manager.queue("raw_messages").await;
        let b = manager.queue("validated_messages").await;
        a.publish(1).await.unwrap();
        assert_eq!(a.len().await, 1);
        assert_eq!(b.len().await, 0);
    }

    #[tokio::test]
    async fn stream_backend_fifo_single_partition() {
        let q = StreamQueue::<i32>::new(1000, Duration::from_secs(30));
        for i in 0..3 {
            q.publish(i).await.unwrap();
        }
        let (t0, v0) = q.consume().await.unwrap().unwrap();
        let (t1, v1) = q.consume().await.unwrap().unwrap();
        assert_eq!((v0, v1), (0, 1));
        q.ack(t0).await.unwrap();
        q.ack(t1).await.unwrap();
    }
}

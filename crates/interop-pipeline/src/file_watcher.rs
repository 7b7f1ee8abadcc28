//! File watcher ingest (C5): polls an input directory, publishes each new file as an envelope,
//! and moves it to `processed/` or `error/` depending on whether the publish was acked (§4.4).

use interop_core::cache::AHashMap;
use interop_core::envelope::{Body, BodyContent, Envelope, Header};
use interop_core::error::EngineResult;
use interop_core::queue::Queue;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

/// Suppresses reprocessing a filename seen within this window, covering the race where a
/// filesystem event fires twice for the same file before it has been moved out of the watch dir.
const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(3600);

pub struct FileWatcherConfig {
    pub watch_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub error_dir: PathBuf,
    pub glob: String,
    pub poll_interval: Duration,
    pub dedup_window: Duration,
}

impl FileWatcherConfig {
    pub fn new(watch_dir: impl Into<PathBuf>, processed_dir: impl Into<PathBuf>, error_dir: impl Into<PathBuf>) -> Self {
        FileWatcherConfig {
            watch_dir: watch_dir.into(),
            processed_dir: processed_dir.into(),
            error_dir: error_dir.into(),
            glob: "*.hl7".to_string(),
            poll_interval: Duration::from_secs(1),
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

fn glob_matches(pattern: &str, filename: &str) -> bool {
    match pattern.strip_prefix('*') {
        Some(suffix) => filename.ends_with(suffix),
        None => pattern == filename,
    }
}

/// Time-windowed registry of filenames already ingested, so a repeated directory-scan race
/// doesn't republish the same file (§4.4).
struct SeenRegistry {
    entries: AHashMap<String, Instant>,
    window: Duration,
}

impl SeenRegistry {
    fn new(window: Duration) -> Self {
        SeenRegistry { entries: AHashMap::default(), window }
    }

    fn remember_if_new(&mut self, name: &str) -> bool {
        let now = Instant::now();
        self.entries.retain(|_, seen_at| now.duration_since(*seen_at) < self.window);
        if self.entries.contains_key(name) {
            return false;
        }
        self.entries.insert(name.to_string(), now);
        true
    }
}

fn unique_destination(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
    let stem_ext = filename.rsplit_once('.');
    match stem_ext {
        Some((stem, ext)) => dir.join(format!("{stem}_{timestamp}.{ext}")),
        None => dir.join(format!("{filename}_{timestamp}")),
    }
}

async fn poll_once(
    config: &FileWatcherConfig,
    ingest_queue: &Arc<dyn Queue<Envelope>>,
    seen: &Mutex<SeenRegistry>,
) -> EngineResult<()> {
    let mut read_dir = match tokio::fs::read_dir(&config.watch_dir).await {
        Ok(rd) => rd,
        Err(e) => {
            warn!(dir = %config.watch_dir.display(), error = %e, "cannot read watch directory");
            return Ok(());
        }
    };

    while let Some(entry) = read_dir.next_entry().await.map_err(|e| interop_core::error::EngineError::transport(e.to_string()))? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let filename = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        if !glob_matches(&config.glob, &filename) {
            continue;
        }
        {
            let mut seen = seen.lock().await;
            if !seen.remember_if_new(&filename) {
                continue;
            }
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) => {
                error!(file = %path.display(), error = %e, "failed reading ingest file");
                continue;
            }
        };

        // Parse the MSH so message_type is set before the envelope reaches validation/routing,
        // same as the MLLP listener does on ingest. A parse failure still publishes the raw
        // bytes; validation downstream will reject it with a proper error.
        let (message_type, content) = match interop_hl7::parse_message(&bytes) {
            Ok(parsed) => (
                parsed.message_type().unwrap_or_default().to_string(),
                BodyContent::Hl7(interop_hl7::flatten(&parsed)),
            ),
            Err(_) => ("unknown".to_string(), BodyContent::Raw),
        };
        let header = Header::new(message_type, "application/hl7-v2+er7", format!("file://{}", path.display()));
        let mut body = Body::from_raw("application/hl7-v2+er7", bytes);
        body.content = content;
        let envelope = Envelope::new(header, body);

        let destination_dir = match ingest_queue.publish(envelope).await {
            Ok(()) => &config.processed_dir,
            Err(e) => {
                error!(file = %path.display(), error = %e, "publish failed, routing to error dir");
                &config.error_dir
            }
        };
        tokio::fs::create_dir_all(destination_dir).await.ok();
        let destination = unique_destination(destination_dir, &filename);
        if let Err(e) = tokio::fs::rename(&path, &destination).await {
            error!(file = %path.display(), error = %e, "failed moving ingested file");
        } else {
            debug!(from = %path.display(), to = %destination.display(), "moved ingested file");
        }
    }
    Ok(())
}

/// Runs the poll loop until `shutdown` fires.
pub async fn run(
    config: FileWatcherConfig,
    ingest_queue: Arc<dyn Queue<Envelope>>,
    mut shutdown: mpsc::Receiver<()>,
) {
    let seen = Mutex::new(SeenRegistry::new(config.dedup_window));
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(config.poll_interval) => {
                if let Err(e) = poll_once(&config, &ingest_queue, &seen).await {
                    error!(error = %e, "file watcher poll failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interop_core::queue::{InMemoryQueue, Queue, QueueManager};

    #[tokio::test]
    async fn ingests_matching_file_and_moves_to_processed() {
        let tmp = tempfile::tempdir().unwrap();
        let watch = tmp.path().join("in");
        let processed = tmp.path().join("processed");
        let errors = tmp.path().join("error");
        tokio::fs::create_dir_all(&watch).await.unwrap();

        tokio::fs::write(watch.join("sample.hl7"), b"MSH|^~\\&|A|B|C|D||ADT^A01|1|P|2.3\r").await.unwrap();
        tokio::fs::write(watch.join("ignore.txt"), b"not hl7").await.unwrap();

        let config = FileWatcherConfig::new(watch.clone(), processed.clone(), errors.clone());
        let queues = QueueManager::<Envelope>::new(Default::default());
        let ingest = queues.queue("raw_messages").await;
        let seen = Mutex::new(SeenRegistry::new(config.dedup_window));

        poll_once(&config, &ingest, &seen).await.unwrap();

        assert_eq!(ingest.len().await, 1);
        assert!(processed.join("sample.hl7").exists());
        assert!(watch.join("ignore.txt").exists());
        assert!(!watch.join("sample.hl7").exists());
    }

    #[tokio::test]
    async fn failed_publish_moves_file_to_error_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let watch = tmp.path().join("in");
        let processed = tmp.path().join("processed");
        let errors = tmp.path().join("error");
        tokio::fs::create_dir_all(&watch).await.unwrap();
        tokio::fs::write(watch.join("a.hl7"), b"MSH|^~\\&\r").await.unwrap();

        let config = FileWatcherConfig::new(watch.clone(), processed.clone(), errors.clone());
        let full: Arc<dyn Queue<Envelope>> = Arc::new(InMemoryQueue::new(
            Some(0),
            interop_core::queue::BackpressurePolicy::Reject,
            Duration::from_secs(30),
        ));
        let seen = Mutex::new(SeenRegistry::new(config.dedup_window));

        poll_once(&config, &full, &seen).await.unwrap();

        assert!(errors.join("a.hl7").exists());
    }

    #[test]
    fn dedup_window_suppresses_reprocessing_within_window() {
        let mut registry = SeenRegistry::new(Duration::from_secs(60));
        assert!(registry.remember_if_new("a.hl7"));
        assert!(!registry.remember_if_new("a.hl7"));
    }
}

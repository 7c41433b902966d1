//! Directory watcher for conversation files.
//!
//! Watches the monitored root recursively and emits [`WatchEvent`]s for files
//! laid out as:
//!
//! ```text
//! <root>/
//! ├── {project}/
//! │   ├── {conversation}.jsonl          ← watched (depth 2)
//! │   └── {conversation}/
//! │       └── subagents/agent-1.jsonl   ← ignored (depth 4)
//! ```
//!
//! Raw notifications are debounced by `notify-debouncer-mini`, then a path is
//! only reported once its size has stopped changing for the stability window.
//! Whether a change is a creation, modification or deletion is decided by
//! looking at the file, since the debouncer collapses event kinds.

use crate::config::WatcherConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use notify::{PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer_opt, DebounceEventResult, Debouncer};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventKind {
    Created,
    Modified,
    Deleted,
    Error,
}

impl WatchEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchEventKind::Created => "created",
            WatchEventKind::Modified => "modified",
            WatchEventKind::Deleted => "deleted",
            WatchEventKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
    /// Set for `Error` events
    pub error: Option<String>,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, path: PathBuf) -> Self {
        Self {
            kind,
            path,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn error(path: PathBuf, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(WatchEventKind::Error, path)
        }
    }
}

/// Watcher counters.
#[derive(Debug, Default)]
pub struct WatcherStats {
    pub raw_events: AtomicU64,
    pub emitted: AtomicU64,
    pub dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherCounters {
    pub raw_events: u64,
    pub emitted: u64,
    pub dropped: u64,
}

impl WatcherStats {
    pub fn snapshot(&self) -> WatcherCounters {
        WatcherCounters {
            raw_events: self.raw_events.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

// ============================================
// Discovery
// ============================================

/// Whether `path` is `<root>/<project>/<conversation>.<extension>`.
pub fn is_conversation_file(root: &Path, path: &Path, extension: &str) -> bool {
    if path.extension().and_then(|e| e.to_str()) != Some(extension) {
        return false;
    }
    path.strip_prefix(root)
        .map(|rel| rel.components().count() == 2)
        .unwrap_or(false)
}

/// Existing conversation files under `root`, sorted by path.
pub fn discover(root: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let pattern = root.join("*").join(format!("*.{}", extension));
    let pattern = pattern.to_string_lossy();
    let entries = glob::glob(&pattern)
        .map_err(|e| Error::Config(format!("invalid watch pattern {}: {}", pattern, e)))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable path during discovery");
                None
            }
        })
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}

// ============================================
// Watching
// ============================================

// Held for its Drop, which stops the OS watch.
#[allow(dead_code)]
enum Backend {
    Native(Debouncer<RecommendedWatcher>),
    Polling(Debouncer<PollWatcher>),
}

enum RawEvent {
    Changed(PathBuf),
    Failed(Vec<PathBuf>, String),
}

/// A running watch. Dropping it stops notifications; [`DirectoryWatcher::stop`]
/// also waits for the stability task.
pub struct DirectoryWatcher {
    root: PathBuf,
    backend: Option<Backend>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    stats: Arc<WatcherStats>,
    polling: bool,
}

impl DirectoryWatcher {
    /// Start watching the configured root; existing files are reported as
    /// `created` first.
    ///
    /// Fails when the root does not exist or cannot be watched at all.
    pub fn watch(config: &WatcherConfig, tx: mpsc::Sender<WatchEvent>) -> Result<Self> {
        let root = config.resolved_root();
        if !root.is_dir() {
            return Err(Error::Watch(
                notify::Error::path_not_found().add_path(root.clone()),
            ));
        }
        let root = std::fs::canonicalize(&root).unwrap_or(root);

        let stats = Arc::new(WatcherStats::default());
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let handler = Handler {
            raw_tx,
            stats: stats.clone(),
        };
        let debounce = Duration::from_millis(config.debounce_ms.max(1));

        let backend = if config.force_polling {
            Backend::Polling(polling_debouncer(&root, config, debounce, handler)?)
        } else {
            match native_debouncer(&root, debounce, handler.clone()) {
                Ok(debouncer) => Backend::Native(debouncer),
                Err(e) => {
                    tracing::warn!(
                        root = %root.display(),
                        error = %e,
                        "Native watcher unavailable, falling back to polling"
                    );
                    Backend::Polling(polling_debouncer(&root, config, debounce, handler)?)
                }
            }
        };
        let polling = matches!(backend, Backend::Polling(_));

        let initial = discover(&root, &config.extension)?;
        tracing::info!(
            root = %root.display(),
            polling,
            existing = initial.len(),
            "Watching for conversation changes"
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let stability = StabilityTracker {
            root: root.clone(),
            extension: config.extension.clone(),
            threshold: Duration::from_millis(config.stability_threshold_ms),
            known: HashSet::new(),
            pending: HashMap::new(),
            tx,
            stats: stats.clone(),
        };
        let task = tokio::spawn(stability.run(raw_rx, initial, shutdown_rx));

        Ok(Self {
            root,
            backend: Some(backend),
            shutdown,
            task: Some(task),
            stats,
            polling,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn stats(&self) -> WatcherCounters {
        self.stats.snapshot()
    }

    /// Release the OS watch and wait for the stability task to finish.
    pub async fn stop(mut self) {
        self.backend.take();
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        tracing::debug!(root = %self.root.display(), "Watcher stopped");
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[derive(Clone)]
struct Handler {
    raw_tx: mpsc::UnboundedSender<RawEvent>,
    stats: Arc<WatcherStats>,
}

impl notify_debouncer_mini::DebounceEventHandler for Handler {
    fn handle_event(&mut self, result: DebounceEventResult) {
        match result {
            Ok(events) => {
                for event in events {
                    self.stats.raw_events.fetch_add(1, Ordering::Relaxed);
                    let _ = self.raw_tx.send(RawEvent::Changed(event.path));
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "File watcher error");
                let _ = self
                    .raw_tx
                    .send(RawEvent::Failed(e.paths.clone(), e.to_string()));
            }
        }
    }
}

fn native_debouncer(
    root: &Path,
    debounce: Duration,
    handler: Handler,
) -> Result<Debouncer<RecommendedWatcher>> {
    let config = notify_debouncer_mini::Config::default().with_timeout(debounce);
    let mut debouncer = new_debouncer_opt::<_, RecommendedWatcher>(config, handler)?;
    debouncer.watcher().watch(root, RecursiveMode::Recursive)?;
    Ok(debouncer)
}

fn polling_debouncer(
    root: &Path,
    config: &WatcherConfig,
    debounce: Duration,
    handler: Handler,
) -> Result<Debouncer<PollWatcher>> {
    let notify_config =
        notify::Config::default().with_poll_interval(Duration::from_millis(config.poll_interval_ms));
    let debouncer_config = notify_debouncer_mini::Config::default()
        .with_timeout(debounce)
        .with_notify_config(notify_config);
    let mut debouncer = new_debouncer_opt::<_, PollWatcher>(debouncer_config, handler)?;
    debouncer.watcher().watch(root, RecursiveMode::Recursive)?;
    Ok(debouncer)
}

// ============================================
// Stability window
// ============================================

struct PendingPath {
    size: Option<u64>,
    since: Instant,
}

struct StabilityTracker {
    root: PathBuf,
    extension: String,
    threshold: Duration,
    /// Paths reported as existing so far
    known: HashSet<PathBuf>,
    pending: HashMap<PathBuf, PendingPath>,
    tx: mpsc::Sender<WatchEvent>,
    stats: Arc<WatcherStats>,
}

impl StabilityTracker {
    async fn run(
        mut self,
        mut raw_rx: mpsc::UnboundedReceiver<RawEvent>,
        initial: Vec<PathBuf>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        for path in initial {
            self.known.insert(path.clone());
            if self
                .tx
                .send(WatchEvent::new(WatchEventKind::Created, path))
                .await
                .is_err()
            {
                return;
            }
            self.stats.emitted.fetch_add(1, Ordering::Relaxed);
        }

        let tick = (self.threshold / 2).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                raw = raw_rx.recv() => match raw {
                    Some(RawEvent::Changed(path)) => self.observe(path),
                    Some(RawEvent::Failed(paths, message)) => {
                        for path in paths {
                            if is_conversation_file(&self.root, &path, &self.extension) {
                                self.emit(WatchEvent::error(path, message.clone()));
                            }
                        }
                    }
                    None => break,
                },
                _ = ticker.tick(), if !self.pending.is_empty() => self.check_pending(),
            }
        }
    }

    fn observe(&mut self, path: PathBuf) {
        if !is_conversation_file(&self.root, &path, &self.extension) {
            return;
        }
        self.pending.entry(path).or_insert(PendingPath {
            size: None,
            since: Instant::now(),
        });
    }

    fn check_pending(&mut self) {
        let now = Instant::now();
        let mut settled = Vec::new();

        for (path, pending) in self.pending.iter_mut() {
            match std::fs::metadata(path) {
                Ok(meta) => {
                    let size = meta.len();
                    if pending.size != Some(size) {
                        pending.size = Some(size);
                        pending.since = now;
                    } else if now.duration_since(pending.since) >= self.threshold {
                        settled.push((path.clone(), None));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    settled.push((path.clone(), None));
                }
                Err(e) => settled.push((path.clone(), Some(e.to_string()))),
            }
        }

        for (path, failure) in settled {
            self.pending.remove(&path);
            let event = match failure {
                Some(message) => WatchEvent::error(path, message),
                None if path.exists() => {
                    let kind = if self.known.insert(path.clone()) {
                        WatchEventKind::Created
                    } else {
                        WatchEventKind::Modified
                    };
                    WatchEvent::new(kind, path)
                }
                None => {
                    if !self.known.remove(&path) {
                        continue;
                    }
                    WatchEvent::new(WatchEventKind::Deleted, path)
                }
            };
            self.emit(event);
        }
    }

    fn emit(&self, event: WatchEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                let count = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if count == 1 || count % 100 == 0 {
                    tracing::warn!(
                        dropped_total = count,
                        path = %event.path.display(),
                        "Watch queue full, event dropped"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(root: &Path) -> WatcherConfig {
        WatcherConfig {
            root: root.to_path_buf(),
            debounce_ms: 20,
            stability_threshold_ms: 20,
            force_polling: true,
            poll_interval_ms: 25,
            extension: "jsonl".to_string(),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<WatchEvent>) -> WatchEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for watch event")
            .expect("watch channel closed")
    }

    /// Skips the extra `modified` events a write can produce.
    async fn next_of_kind(rx: &mut mpsc::Receiver<WatchEvent>, kind: WatchEventKind) -> WatchEvent {
        loop {
            let event = next_event(rx).await;
            if event.kind == kind {
                return event;
            }
            assert_eq!(event.kind, WatchEventKind::Modified, "unexpected {:?}", event);
        }
    }

    #[test]
    fn test_depth_filter() {
        let root = Path::new("/r");
        assert!(is_conversation_file(root, Path::new("/r/proj/conv.jsonl"), "jsonl"));
        assert!(!is_conversation_file(root, Path::new("/r/conv.jsonl"), "jsonl"));
        assert!(!is_conversation_file(
            root,
            Path::new("/r/proj/conv/subagents/a.jsonl"),
            "jsonl"
        ));
        assert!(!is_conversation_file(root, Path::new("/r/proj/notes.txt"), "jsonl"));
        assert!(!is_conversation_file(root, Path::new("/elsewhere/p/c.jsonl"), "jsonl"));
    }

    #[test]
    fn test_discover() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("b/nested")).unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/one.jsonl"), "").unwrap();
        std::fs::write(dir.path().join("b/two.jsonl"), "").unwrap();
        std::fs::write(dir.path().join("b/nested/deep.jsonl"), "").unwrap();
        std::fs::write(dir.path().join("top.jsonl"), "").unwrap();
        std::fs::write(dir.path().join("a/readme.md"), "").unwrap();

        let files = discover(dir.path(), "jsonl").unwrap();
        assert_eq!(
            files,
            vec![dir.path().join("a/one.jsonl"), dir.path().join("b/two.jsonl")]
        );
    }

    #[tokio::test]
    async fn test_missing_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        assert!(DirectoryWatcher::watch(&config(&dir.path().join("missing")), tx).is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let dir = TempDir::new().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        std::fs::create_dir_all(root.join("proj")).unwrap();
        std::fs::write(root.join("proj/existing.jsonl"), "{}\n").unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let watcher = DirectoryWatcher::watch(&config(&root), tx).unwrap();
        assert!(watcher.is_polling());

        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, WatchEventKind::Created);
        assert_eq!(event.path, root.join("proj/existing.jsonl"));

        let path = root.join("proj/new.jsonl");
        std::fs::write(&path, "{}\n").unwrap();
        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, WatchEventKind::Created);
        assert_eq!(event.path, path);

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&path, "{}\n{}\n").unwrap();
        let event = next_of_kind(&mut rx, WatchEventKind::Modified).await;
        assert_eq!(event.path, path);

        std::fs::remove_file(&path).unwrap();
        let event = next_of_kind(&mut rx, WatchEventKind::Deleted).await;
        assert_eq!(event.path, path);

        assert!(watcher.stats().emitted >= 4);
        watcher.stop().await;
    }
}

//! Pipeline coordinator
//!
//! Turns watcher events into per-file work:
//!
//! ```text
//! WatchEvent ──► Coordinator ──► worker (read → parse → thread)
//!                    ▲               │
//!                    │               ├──► StoreHandle::commit
//!                    └── Completion ◄┴──► FanoutSink::publish
//! ```
//!
//! Each file is processed by at most one worker at a time; distinct files run
//! concurrently up to `worker_pool_size`. Changes that arrive while a file is
//! active collapse into a single rerun.

mod state;
mod worker;

pub use state::{FilePhase, FileRegistry, TrackedFile};

use crate::analysis::{self, AnalysisCache};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ingest::{ConversationIngestor, Parser};
use crate::sink::FanoutSink;
use crate::store::StoreHandle;
use crate::threading::{ConversationThreader, Threader};
use crate::types::{conversation_identity, ConversationFile, FileStatus, ParseError, Thread};
use crate::watcher::{WatchEvent, WatchEventKind};
use serde::Serialize;
use state::{FileSlot, FileState};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use worker::{Completion, Job, JobKind, Outcome, WorkerContext};

// ============================================
// Statistics
// ============================================

/// Live pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub files_tracked: AtomicU64,
    pub batches: AtomicU64,
    pub messages: AtomicU64,
    pub parse_errors: AtomicU64,
    pub timeouts: AtomicU64,
    pub errors: AtomicU64,
    pub finalized: AtomicU64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineCounters {
        PipelineCounters {
            files_tracked: self.files_tracked.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            finalized: self.finalized.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineCounters {
    pub files_tracked: u64,
    pub batches: u64,
    pub messages: u64,
    pub parse_errors: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub finalized: u64,
}

// ============================================
// Coordinator
// ============================================

pub struct Coordinator {
    ctx: Arc<WorkerContext>,
    parser: Arc<Parser>,
    threader: Arc<Threader>,
    analyzer_task: Option<JoinHandle<()>>,
    states: HashMap<PathBuf, FileState>,
    /// Files whose checkpoint could not be loaded yet, with attempt counts
    unloaded: HashMap<PathBuf, u32>,
    in_flight: usize,
    draining: bool,
    done_tx: mpsc::UnboundedSender<Completion>,
    done_rx: mpsc::UnboundedReceiver<Completion>,
    retry_tx: mpsc::UnboundedSender<PathBuf>,
    retry_rx: mpsc::UnboundedReceiver<PathBuf>,
}

impl Coordinator {
    /// Build a coordinator. `cache` moves into the analyzer task, which
    /// starts here when analysis is enabled, so this must run inside a
    /// tokio runtime.
    pub fn new(
        config: &Config,
        store: StoreHandle,
        sink: FanoutSink,
        cache: AnalysisCache,
    ) -> Self {
        let (analyzer, analyzer_task) = if config.analysis.enabled {
            let (handle, task) =
                analysis::spawn(cache, sink.clone(), config.analysis.queue_capacity);
            (Some(handle), Some(task))
        } else {
            (None, None)
        };

        let ctx = WorkerContext {
            config: config.pipeline.clone(),
            store,
            sink,
            analyzer,
            registry: FileRegistry::new(),
            stats: Arc::new(PipelineStats::default()),
            permits: Arc::new(Semaphore::new(config.pipeline.worker_pool_size.max(1))),
        };
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();

        Self {
            ctx: Arc::new(ctx),
            parser: Arc::new(Parser::new()),
            threader: Arc::new(Threader::new(config.threading.clone())),
            analyzer_task,
            states: HashMap::new(),
            unloaded: HashMap::new(),
            in_flight: 0,
            draining: false,
            done_tx,
            done_rx,
            retry_tx,
            retry_rx,
        }
    }

    /// Replace the threader built from the configuration, e.g. to add
    /// boundary rules. Call before [`Coordinator::run`].
    pub fn with_threader(mut self, threader: Threader) -> Self {
        self.threader = Arc::new(threader);
        self
    }

    pub fn registry(&self) -> FileRegistry {
        self.ctx.registry.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.ctx.stats.clone()
    }

    /// Process events until shutdown is signalled or the event channel
    /// closes, then let in-flight batches finish and commit.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PipelineCounters> {
        tracing::info!(
            workers = self.ctx.config.worker_pool_size,
            analysis = self.ctx.analyzer.is_some(),
            "Pipeline started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => break,
                },
                Some(done) = self.done_rx.recv() => self.on_completion(done).await,
                Some(path) = self.retry_rx.recv() => self.on_retry(path).await,
            }
        }

        self.draining = true;
        if self.in_flight > 0 {
            tracing::info!(in_flight = self.in_flight, "Draining in-flight batches");
        }
        while self.in_flight > 0 {
            match self.done_rx.recv().await {
                Some(done) => self.on_completion(done).await,
                None => break,
            }
        }

        let counters = self.ctx.stats.snapshot();
        let analyzer_task = self.analyzer_task.take();
        drop(self);
        if let Some(task) = analyzer_task {
            task.await
                .map_err(|e| Error::Pipeline(format!("analyzer task failed: {}", e)))?;
        }

        tracing::info!(
            batches = counters.batches,
            messages = counters.messages,
            errors = counters.errors,
            "Pipeline stopped"
        );
        Ok(counters)
    }

    async fn on_event(&mut self, event: WatchEvent) {
        tracing::trace!(kind = event.kind.as_str(), path = %event.path.display(), "Watch event");
        match event.kind {
            WatchEventKind::Created | WatchEventKind::Modified => {
                if self.ensure_state(&event.path).await {
                    self.schedule(&event.path);
                }
            }
            WatchEventKind::Deleted => {
                if self.unloaded.remove(&event.path).is_some() {
                    self.ctx.registry.remove(&event.path);
                }
                let Some(state) = self.states.get_mut(&event.path) else {
                    return;
                };
                state.remove_pending = true;
                self.ctx.registry.set_phase(&event.path, FilePhase::Removed);
                if !state.is_active() {
                    self.dispatch(&event.path, JobKind::Finalize);
                }
            }
            WatchEventKind::Error => {
                let message = event.error.unwrap_or_else(|| "watch error".to_string());
                tracing::warn!(path = %event.path.display(), error = %message, "Watcher reported an error");
                if self.states.contains_key(&event.path) {
                    self.fail(&event.path, message).await;
                }
            }
        }
    }

    /// Load or create the per-file state. False when the path is not a
    /// conversation file or its checkpoint cannot be read; the latter is
    /// retried on the backoff timer.
    async fn ensure_state(&mut self, path: &Path) -> bool {
        if self.states.contains_key(path) {
            return true;
        }
        let Some(ingestor) = ConversationIngestor::new(path, self.parser.clone()) else {
            tracing::debug!(path = %path.display(), "Not a conversation file");
            return false;
        };

        let loaded = self.ctx.store.load_checkpoint(path).await;
        let file = match loaded {
            Ok(Some(file)) => file,
            Ok(None) => match ConversationFile::discovered(path) {
                Some(file) => file,
                None => return false,
            },
            Err(e) => {
                self.defer_load(path, e.to_string());
                return false;
            }
        };
        if self.unloaded.remove(path).is_some() {
            tracing::info!(path = %path.display(), "Checkpoint loaded after retry");
        }

        if file.checkpoint.offset > 0 {
            tracing::debug!(
                path = %path.display(),
                offset = file.checkpoint.offset,
                generation = file.checkpoint.generation,
                "Resuming from checkpoint"
            );
        }

        self.ctx.registry.insert(file.clone());
        self.states.insert(
            path.to_path_buf(),
            FileState::new(FileSlot {
                ingestor,
                threader: ConversationThreader::new(self.threader.clone()),
                file,
                pending: None,
            }),
        );
        self.ctx
            .stats
            .files_tracked
            .store(self.states.len() as u64, Ordering::Relaxed);
        true
    }

    /// Run the file now, or remember to rerun it once the active worker returns.
    fn schedule(&mut self, path: &Path) {
        let Some(state) = self.states.get_mut(path) else {
            return;
        };
        state.retry_at = None;
        if state.is_active() {
            state.rerun = true;
            return;
        }
        let kind = if state.remove_pending {
            JobKind::Finalize
        } else {
            JobKind::Read
        };
        self.dispatch(path, kind);
    }

    async fn on_retry(&mut self, path: PathBuf) {
        if !self.states.contains_key(&path) {
            if self.unloaded.contains_key(&path) && self.ensure_state(&path).await {
                self.schedule(&path);
            }
            return;
        }
        let due = self
            .states
            .get(&path)
            .and_then(|state| state.retry_at)
            .is_some_and(|at| at <= Instant::now());
        if due {
            tracing::debug!(path = %path.display(), "Retrying after backoff");
            self.schedule(&path);
        }
    }

    fn dispatch(&mut self, path: &Path, kind: JobKind) {
        if self.draining {
            return;
        }
        let Some(state) = self.states.get_mut(path) else {
            return;
        };
        let Some(slot) = state.slot.take() else {
            return;
        };
        state.rerun = false;
        self.in_flight += 1;

        let job = Job {
            path: path.to_path_buf(),
            kind,
            slot,
        };
        let ctx = self.ctx.clone();
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let completion = worker::run(ctx, job).await;
            let _ = done.send(completion);
        });
    }

    async fn on_completion(&mut self, done: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let path = done.path;

        let requeue = match done.outcome {
            Outcome::Finalized => {
                self.states.remove(&path);
                self.ctx.registry.remove(&path);
                self.ctx
                    .stats
                    .files_tracked
                    .store(self.states.len() as u64, Ordering::Relaxed);
                return;
            }
            Outcome::Lost(message) => {
                // The next change rebuilds the state from the last checkpoint.
                let removed = self
                    .states
                    .remove(&path)
                    .is_some_and(|state| state.remove_pending);
                self.ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
                if removed {
                    self.ctx.registry.remove(&path);
                } else {
                    self.mark_error(&path, message).await;
                }
                return;
            }
            Outcome::Committed { capped, timed_out } => {
                let Some(state) = self.states.get_mut(&path) else {
                    return;
                };
                state.slot = done.slot;
                state.attempts = 0;
                state.retry_at = None;
                if !state.remove_pending {
                    self.ctx.registry.set_phase(&path, FilePhase::Idle);
                }
                capped || timed_out || state.rerun
            }
            Outcome::Failed(message) => {
                let Some(state) = self.states.get_mut(&path) else {
                    return;
                };
                state.slot = done.slot;
                let rerun = state.rerun;
                self.fail(&path, message).await;
                rerun
            }
        };

        let remove_pending = self
            .states
            .get(&path)
            .is_some_and(|state| state.remove_pending);
        if remove_pending {
            self.dispatch(&path, JobKind::Finalize);
        } else if requeue {
            self.dispatch(&path, JobKind::Read);
        }
    }

    /// Record a file failure and arm the backoff timer.
    async fn fail(&mut self, path: &Path, message: String) {
        self.ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
        let Some(state) = self.states.get_mut(path) else {
            return;
        };
        state.attempts += 1;
        let attempts = state.attempts;
        let delay = self.ctx.config.retry_delay(attempts);
        state.retry_at = Some(Instant::now() + delay);

        tracing::warn!(
            path = %path.display(),
            attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %message,
            "File processing failed"
        );
        self.mark_error(path, message).await;

        let retry = self.retry_tx.clone();
        let path = path.to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = retry.send(path);
        });
    }

    /// The file is known but its checkpoint is unreadable: show it as
    /// errored and try the load again after a backoff.
    fn defer_load(&mut self, path: &Path, message: String) {
        self.ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
        let attempts = self.unloaded.entry(path.to_path_buf()).or_insert(0);
        *attempts += 1;
        let attempts = *attempts;
        let delay = self.ctx.config.retry_delay(attempts);

        tracing::error!(
            path = %path.display(),
            attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %message,
            "Failed to load checkpoint"
        );
        if self.ctx.registry.get(path).is_none() {
            if let Some(file) = ConversationFile::discovered(path) {
                self.ctx.registry.insert(file);
            }
        }
        self.ctx.registry.set_phase(path, FilePhase::Error);
        self.ctx
            .registry
            .update(path, |f| f.last_error = Some(message));

        let retry = self.retry_tx.clone();
        let path = path.to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = retry.send(path);
        });
    }

    async fn mark_error(&self, path: &Path, message: String) {
        self.ctx.registry.set_phase(path, FilePhase::Error);
        self.ctx
            .registry
            .update(path, |f| f.last_error = Some(message.clone()));
        if let Err(e) = self
            .ctx
            .store
            .set_status(path, FileStatus::Error, Some(message))
            .await
        {
            tracing::error!(path = %path.display(), error = %e, "Failed to record file error");
        }
    }
}

// ============================================
// One-shot scan
// ============================================

/// Result of reading one file start to finish without the daemon.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub path: PathBuf,
    pub project_id: String,
    pub conversation_id: String,
    pub messages: usize,
    pub tool_calls: usize,
    pub pending_tool_calls: usize,
    pub orphans: usize,
    pub threads: Vec<Thread>,
    pub parse_errors: Vec<ParseError>,
}

/// Parse and thread a whole file in memory, with the final merge pass.
pub fn scan_file(
    path: &Path,
    parser: Arc<Parser>,
    threader: Arc<Threader>,
    max_lines: usize,
) -> Result<ScanReport> {
    let (project_id, conversation_id) = conversation_identity(path).ok_or_else(|| Error::Parse {
        path: path.display().to_string(),
        message: "path is not <root>/<project>/<conversation>.jsonl".to_string(),
    })?;
    let mut ingestor = ConversationIngestor::new(path, parser).ok_or_else(|| Error::Parse {
        path: path.display().to_string(),
        message: "cannot derive conversation identity".to_string(),
    })?;
    let mut conversation = ConversationThreader::new(threader);

    let mut report = ScanReport {
        path: path.to_path_buf(),
        project_id,
        conversation_id,
        messages: 0,
        tool_calls: 0,
        pending_tool_calls: 0,
        orphans: 0,
        threads: Vec::new(),
        parse_errors: Vec::new(),
    };

    let mut checkpoint = Default::default();
    loop {
        let batch = ingestor.ingest(checkpoint, max_lines.max(1))?;
        checkpoint = batch.checkpoint;
        report.messages += batch.messages.len();
        report.orphans += batch.orphans.len();
        report.parse_errors.extend(batch.parse_errors);
        for message in batch.messages {
            report.tool_calls += message.tool_calls.len();
            conversation.push(Arc::new(message));
        }
        if !batch.capped {
            break;
        }
    }

    report.pending_tool_calls = ingestor.tracker().pending_count();
    report.threads = conversation.finalize();
    Ok(report)
}

//! One unit of work on one file: read, parse, thread, commit, publish.

use super::state::{FilePhase, FileRegistry, FileSlot, PendingBatch};
use super::PipelineStats;
use crate::analysis::{AnalysisRequest, AnalyzerHandle};
use crate::config::PipelineConfig;
use crate::db::Batch;
use crate::error::{Error, Result};
use crate::ingest::IngestBatch;
use crate::sink::{FanoutSink, SinkEvent};
use crate::store::StoreHandle;
use crate::types::{FileStatus, Message, Thread};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Shared dependencies of every worker.
pub(crate) struct WorkerContext {
    pub config: PipelineConfig,
    pub store: StoreHandle,
    pub sink: FanoutSink,
    pub analyzer: Option<AnalyzerHandle>,
    pub registry: FileRegistry,
    pub stats: Arc<PipelineStats>,
    pub permits: Arc<Semaphore>,
}

pub(crate) enum JobKind {
    Read,
    Finalize,
}

pub(crate) struct Job {
    pub path: PathBuf,
    pub kind: JobKind,
    pub slot: FileSlot,
}

pub(crate) enum Outcome {
    Committed {
        /// More lines are already waiting
        capped: bool,
        /// The batch overran `file_timeout_ms`
        timed_out: bool,
    },
    Failed(String),
    /// The reader task died and took the per-file state with it
    Lost(String),
    Finalized,
}

pub(crate) struct Completion {
    pub path: PathBuf,
    pub slot: Option<FileSlot>,
    pub outcome: Outcome,
}

pub(crate) async fn run(ctx: Arc<WorkerContext>, job: Job) -> Completion {
    let path = job.path;
    match job.kind {
        JobKind::Read => {
            let (slot, outcome) = read(ctx, job.slot).await;
            Completion {
                path,
                slot,
                outcome,
            }
        }
        JobKind::Finalize => match finalize(&ctx, job.slot).await {
            Ok(()) => Completion {
                path,
                slot: None,
                outcome: Outcome::Finalized,
            },
            Err((slot, e)) => Completion {
                path,
                slot: Some(slot),
                outcome: Outcome::Failed(e.to_string()),
            },
        },
    }
}

async fn read(ctx: Arc<WorkerContext>, mut slot: FileSlot) -> (Option<FileSlot>, Outcome) {
    let path = slot.file.path.clone();

    // A batch that failed to commit earlier goes first.
    if let Some(pending) = slot.pending.take() {
        if let Err(e) = commit_and_publish(&ctx, &mut slot, pending).await {
            return (Some(slot), Outcome::Failed(e.to_string()));
        }
    }

    let permit = match ctx.permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return (Some(slot), Outcome::Failed("worker pool closed".to_string())),
    };

    ctx.registry.set_phase(&path, FilePhase::Reading);
    let from = slot.file.checkpoint;
    let max_lines = ctx.config.max_batch_lines;
    // Reading and threading both run here, under one timeout.
    let blocking_ctx = ctx.clone();
    let mut handle = tokio::task::spawn_blocking(move || {
        let result = slot.ingestor.ingest(from, max_lines).map(|batch| {
            let capped = batch.capped;
            (assemble(&blocking_ctx, &mut slot, batch), capped)
        });
        (slot, result)
    });

    let mut timed_out = false;
    let joined = match tokio::time::timeout(ctx.config.file_timeout(), &mut handle).await {
        Ok(joined) => joined,
        Err(_) => {
            timed_out = true;
            ctx.stats.timeouts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                path = %path.display(),
                timeout_ms = ctx.config.file_timeout_ms,
                "File batch timed out, releasing worker"
            );
            drop(permit);
            handle.await
        }
    };

    let (mut slot, result) = match joined {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Reader task failed");
            return (None, Outcome::Lost(e.to_string()));
        }
    };

    let (pending, capped) = match result {
        Ok(assembled) => assembled,
        Err(e) => return (Some(slot), Outcome::Failed(e.to_string())),
    };

    if let Err(e) = commit_and_publish(&ctx, &mut slot, pending).await {
        return (Some(slot), Outcome::Failed(e.to_string()));
    }

    (Some(slot), Outcome::Committed { capped, timed_out })
}

/// Thread the batch and build everything that must be committed and published.
fn assemble(ctx: &WorkerContext, slot: &mut FileSlot, batch: IngestBatch) -> PendingBatch {
    let path = slot.file.path.clone();
    let project_id = slot.file.project_id.clone();
    let conversation_id = slot.file.conversation_id.clone();

    ctx.registry.set_phase(&path, FilePhase::Parsing);
    let mut events = Vec::new();
    let mut touched: Vec<Thread> = Vec::new();
    if batch.truncated {
        events.push(SinkEvent::FileTruncated {
            path: path.clone(),
            project_id: project_id.clone(),
            conversation_id: conversation_id.clone(),
        });
        // Old-generation ids must not leak into threads of the new contents.
        if let Some(closed) = slot.threader.reset() {
            touched.push(closed);
        }
    }

    ctx.registry.set_phase(&path, FilePhase::Threading);
    let mut thread_messages: HashMap<String, Vec<Arc<Message>>> = HashMap::new();
    for message in &batch.messages {
        events.push(SinkEvent::MessageAppended {
            conversation_id: conversation_id.clone(),
            project_id: project_id.clone(),
            message: message.clone(),
        });

        let update = slot.threader.push(Arc::new(message.clone()));
        if let Some(closed) = update.closed {
            thread_messages.insert(closed.id.clone(), update.closed_messages);
            upsert_thread(&mut touched, closed);
        }
        upsert_thread(&mut touched, update.thread);
    }
    if !batch.messages.is_empty() {
        if let Some(open) = slot.threader.open_thread() {
            thread_messages.insert(open.id.clone(), slot.threader.open_messages().to_vec());
        }
    }

    for call in &batch.tool_updates {
        events.push(SinkEvent::ToolCallUpdated {
            conversation_id: conversation_id.clone(),
            project_id: project_id.clone(),
            tool_call: call.clone(),
        });
    }

    for thread in &touched {
        events.push(SinkEvent::ThreadUpdated {
            conversation_id: conversation_id.clone(),
            project_id: project_id.clone(),
            thread: thread.clone(),
            context_analysis: None,
        });
    }

    if !batch.parse_errors.is_empty() {
        events.push(SinkEvent::FileError {
            path: path.clone(),
            project_id: project_id.clone(),
            conversation_id: conversation_id.clone(),
            parse_errors: batch.parse_errors.clone(),
        });
    }

    let analysis = touched
        .iter()
        .filter_map(|thread| {
            Some(AnalysisRequest {
                project_id: project_id.clone(),
                conversation_id: conversation_id.clone(),
                thread: thread.clone(),
                messages: thread_messages.remove(&thread.id)?,
            })
        })
        .collect();

    ctx.stats
        .messages
        .fetch_add(batch.messages.len() as u64, Ordering::Relaxed);
    ctx.stats
        .parse_errors
        .fetch_add(batch.error_count() as u64, Ordering::Relaxed);

    let mut file = slot.file.clone();
    file.checkpoint = batch.checkpoint;
    file.modified_at = batch.modified_at.or(file.modified_at);
    file.status = FileStatus::Idle;
    file.last_error = None;

    PendingBatch {
        batch: Batch {
            file,
            messages: batch.messages,
            tool_calls: batch.tool_updates,
            threads: touched,
            retired_threads: Vec::new(),
        },
        events,
        analysis,
    }
}

fn upsert_thread(threads: &mut Vec<Thread>, thread: Thread) {
    match threads.iter_mut().find(|t| t.id == thread.id) {
        Some(existing) => *existing = thread,
        None => threads.push(thread),
    }
}

/// Commit first; publish only what is durable.
async fn commit_and_publish(
    ctx: &WorkerContext,
    slot: &mut FileSlot,
    pending: PendingBatch,
) -> Result<()> {
    if let Err(e) = ctx.store.commit(pending.batch.clone()).await {
        slot.pending = Some(pending);
        return Err(e);
    }

    let PendingBatch {
        batch,
        events,
        analysis,
    } = pending;
    slot.file = batch.file;
    ctx.registry.update(&slot.file.path, |f| {
        f.checkpoint = slot.file.checkpoint;
        f.modified_at = slot.file.modified_at;
        f.last_error = None;
    });

    if let Some(analyzer) = &ctx.analyzer {
        for request in &analysis {
            analyzer.track(&request.thread.id, request.thread.message_ids.len());
        }
    }
    for event in events {
        ctx.sink.publish(event);
    }
    if let Some(analyzer) = &ctx.analyzer {
        for request in analysis {
            analyzer.submit(request);
        }
    }

    ctx.stats.batches.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(
        path = %slot.file.path.display(),
        offset = slot.file.checkpoint.offset,
        line = slot.file.checkpoint.line,
        messages = batch.messages.len(),
        "Batch committed"
    );
    Ok(())
}

/// Close the conversation: final thread set, merge pass, publish, drop state.
async fn finalize(
    ctx: &WorkerContext,
    mut slot: FileSlot,
) -> std::result::Result<(), (FileSlot, Error)> {
    if let Some(pending) = slot.pending.take() {
        if let Err(e) = commit_and_publish(ctx, &mut slot, pending).await {
            return Err((slot, e));
        }
    }

    let before: Vec<String> = slot.threader.threads().into_iter().map(|t| t.id).collect();
    let threads = slot.threader.finalize();
    let retired_threads = before
        .into_iter()
        .filter(|id| !threads.iter().any(|t| &t.id == id))
        .collect();
    let batch = Batch {
        file: slot.file.clone(),
        messages: Vec::new(),
        tool_calls: Vec::new(),
        threads: threads.clone(),
        retired_threads,
    };
    if let Err(e) = ctx.store.commit(batch).await {
        return Err((slot, e));
    }
    if let Err(e) = ctx.store.remove_file(&slot.file.path).await {
        return Err((slot, e));
    }

    tracing::info!(
        path = %slot.file.path.display(),
        threads = threads.len(),
        "Conversation finalized"
    );
    ctx.sink.publish(SinkEvent::ConversationFinalized {
        conversation_id: slot.file.conversation_id.clone(),
        project_id: slot.file.project_id.clone(),
        threads,
    });
    ctx.stats.finalized.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

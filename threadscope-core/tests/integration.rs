//! Integration tests for threadscope ingestion, threading, storage and fan-out
//!
//! Fixture files live in `tests/fixtures/conversations/<project>/`.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use threadscope_core::analysis::AnalysisCache;
use threadscope_core::config::{SinkConfig, ThreadingConfig};
use threadscope_core::db::{Batch, Database};
use threadscope_core::ingest::{ConversationIngestor, Parser};
use threadscope_core::pipeline::{scan_file, Coordinator, FileRegistry};
use threadscope_core::sink::ws::{self, ServerState};
use threadscope_core::sink::{FanoutSink, SinkEvent};
use threadscope_core::store::StoreHandle;
use threadscope_core::threading::Threader;
use threadscope_core::watcher::DirectoryWatcher;
use threadscope_core::{BoundaryReason, Checkpoint, Config, ConversationFile, Severity};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Get the path to a fixture file
fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/conversations")
        .join(name)
}

fn parser() -> Arc<Parser> {
    Arc::new(Parser::new())
}

fn threader() -> Arc<Threader> {
    Arc::new(Threader::new(ThreadingConfig::default()))
}

/// A conversation file under a fresh root.
fn conversation(dir: &TempDir, content: &str) -> PathBuf {
    let project = dir.path().join("proj");
    std::fs::create_dir_all(&project).unwrap();
    let path = project.join("conv.jsonl");
    std::fs::write(&path, content).unwrap();
    path
}

fn chat_line(role: &str, minute: u32, text: &str) -> String {
    format!(
        "{{\"role\":\"{}\",\"content\":\"{}\",\"timestamp\":\"2025-03-01T10:{:02}:00Z\"}}\n",
        role, text, minute
    )
}

// ============================================
// Parsing
// ============================================

#[test]
fn test_scan_mixed_fixture() {
    let report = scan_file(&fixture_path("webapp/mixed.jsonl"), parser(), threader(), 100)
        .expect("scan should succeed");

    assert_eq!(report.project_id, "webapp");
    assert_eq!(report.conversation_id, "mixed");
    assert_eq!(report.messages, 6);
    assert_eq!(report.tool_calls, 1);
    assert_eq!(report.pending_tool_calls, 0);
    assert_eq!(report.orphans, 1);

    let errors: Vec<_> = report
        .parse_errors
        .iter()
        .filter(|e| e.severity == Severity::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].line_number, 6);
    assert!(report
        .parse_errors
        .iter()
        .any(|e| e.severity == Severity::Warning && e.description.contains("orphan")));

    // The topic switch after a long pause starts a second thread.
    assert_eq!(report.threads.len(), 2);
    assert_eq!(report.threads[0].message_ids.len(), 4);
    assert_eq!(report.threads[1].message_ids.len(), 2);
    assert!(report.threads.iter().all(|t| t.closed));
}

#[test]
fn test_malformed_line_between_messages() {
    let dir = TempDir::new().unwrap();
    let path = conversation(
        &dir,
        "{\"role\":\"user\",\"content\":\"hi\"}\nnot json\n{\"role\":\"assistant\",\"content\":\"hello\"}\n",
    );

    let report = scan_file(&path, parser(), threader(), 100).unwrap();
    assert_eq!(report.messages, 2);
    assert_eq!(report.parse_errors.len(), 1);
    assert_eq!(report.parse_errors[0].severity, Severity::Error);
    assert_eq!(report.parse_errors[0].line_number, 2);
}

#[test]
fn test_orphan_result_is_retained() {
    let dir = TempDir::new().unwrap();
    let path = conversation(&dir, "{\"tool_call_id\":\"nobody\",\"output\":\"x\"}\n");

    let mut ingestor = ConversationIngestor::new(&path, parser()).unwrap();
    let batch = ingestor.ingest(Checkpoint::default(), usize::MAX).unwrap();
    assert!(batch.messages.is_empty());
    assert_eq!(batch.orphans.len(), 1);
    assert_eq!(batch.orphans[0].correlation_id, "nobody");
    assert_eq!(batch.parse_errors[0].severity, Severity::Warning);
    assert_eq!(ingestor.tracker().orphans().len(), 1);
}

// ============================================
// Resume and idempotency
// ============================================

#[test]
fn test_resume_from_every_line_boundary() {
    let path = fixture_path("webapp/mixed.jsonl");

    // Walk the file one line at a time, remembering each checkpoint.
    let mut ingestor = ConversationIngestor::new(&path, parser()).unwrap();
    let mut checkpoints = vec![Checkpoint::default()];
    let mut seen_before = vec![0usize];
    let mut all_ids = Vec::new();
    let mut checkpoint = Checkpoint::default();
    loop {
        let batch = ingestor.ingest(checkpoint, 1).unwrap();
        if batch.lines_read == 0 {
            break;
        }
        all_ids.extend(batch.messages.iter().map(|m| m.id.clone()));
        checkpoint = batch.checkpoint;
        checkpoints.push(checkpoint);
        seen_before.push(all_ids.len());
    }
    assert_eq!(checkpoints.len(), 10);
    assert_eq!(all_ids.len(), 6);

    // A fresh reader resuming anywhere yields exactly the remaining records.
    for (checkpoint, before) in checkpoints.iter().zip(&seen_before) {
        let mut resumed = ConversationIngestor::new(&path, parser()).unwrap();
        let batch = resumed.ingest(*checkpoint, usize::MAX).unwrap();
        let ids: Vec<String> = batch.messages.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, all_ids[*before..].to_vec(), "resume at {:?}", checkpoint);
    }
}

#[test]
fn test_recommitting_a_batch_adds_nothing() {
    let path = fixture_path("webapp/mixed.jsonl");
    let db = Database::open_in_memory().unwrap();
    db.migrate().unwrap();

    let mut ingestor = ConversationIngestor::new(&path, parser()).unwrap();
    let mut file = ConversationFile::discovered(&path).unwrap();
    let mut checkpoint = Checkpoint::default();
    loop {
        let batch = ingestor.ingest(checkpoint, 3).unwrap();
        if batch.lines_read == 0 {
            break;
        }
        checkpoint = batch.checkpoint;
        file.checkpoint = checkpoint;
        let record = Batch {
            file: file.clone(),
            messages: batch.messages,
            tool_calls: batch.tool_updates,
            threads: Vec::new(),
            retired_threads: vec![],
        };
        // A crash between commit and acknowledgement replays the same batch.
        db.commit_batch(&record).unwrap();
        db.commit_batch(&record).unwrap();
    }

    assert_eq!(db.count_messages("mixed").unwrap(), 6);
    let stored = db.load_checkpoint(&path).unwrap().unwrap();
    assert_eq!(stored.checkpoint, checkpoint);
    let call = db.get_tool_call("t1").unwrap().expect("tool call stored");
    assert_eq!(call.status.as_str(), "success");
}

#[test]
fn test_no_duplicates_under_bursty_appends() {
    let dir = TempDir::new().unwrap();
    let path = conversation(&dir, "");
    let body: String = (0..20)
        .map(|i| chat_line(if i % 2 == 0 { "user" } else { "assistant" }, i, "step"))
        .collect();

    // Bursts split lines at arbitrary byte positions.
    let mut ingestor = ConversationIngestor::new(&path, parser()).unwrap();
    let mut checkpoint = Checkpoint::default();
    let mut ids = Vec::new();
    let bytes = body.as_bytes();
    for chunk in bytes.chunks(37) {
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(chunk).unwrap();
        drop(file);

        let batch = ingestor.ingest(checkpoint, usize::MAX).unwrap();
        checkpoint = batch.checkpoint;
        ids.extend(batch.messages.into_iter().map(|m| m.id));
    }

    assert_eq!(ids.len(), 20);
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 20);
    assert_eq!(checkpoint.offset, bytes.len() as u64);
}

#[test]
fn test_truncation_restarts_from_zero() {
    let dir = TempDir::new().unwrap();
    let path = conversation(
        &dir,
        &[chat_line("user", 0, "first"), chat_line("assistant", 1, "second")].concat(),
    );

    let mut ingestor = ConversationIngestor::new(&path, parser()).unwrap();
    let first = ingestor.ingest(Checkpoint::default(), usize::MAX).unwrap();
    assert_eq!(first.messages.len(), 2);

    std::fs::write(&path, chat_line("user", 5, "rewritten")).unwrap();
    let second = ingestor.ingest(first.checkpoint, usize::MAX).unwrap();
    assert!(second.truncated);
    assert_eq!(second.messages.len(), 1);
    assert_eq!(second.checkpoint.generation, first.checkpoint.generation + 1);
    assert_ne!(second.messages[0].id, first.messages[0].id);

    // The reset is reported once.
    let third = ingestor.ingest(second.checkpoint, usize::MAX).unwrap();
    assert!(!third.truncated);
    assert!(third.messages.is_empty());
}

// ============================================
// Threading
// ============================================

#[test]
fn test_threading_is_deterministic() {
    let path = fixture_path("webapp/mixed.jsonl");
    let a = scan_file(&path, parser(), threader(), 2).unwrap();
    let b = scan_file(&path, parser(), threader(), 100).unwrap();
    assert_eq!(a.threads, b.threads);
}

#[test]
fn test_baseline_gap_splits_threads() {
    let dir = TempDir::new().unwrap();
    let content = [
        chat_line("user", 0, "start"),
        chat_line("assistant", 5, "ok"),
        "{\"role\":\"user\",\"content\":\"back\",\"timestamp\":\"2025-03-01T11:30:00Z\"}\n"
            .to_string(),
    ]
    .concat();
    let path = conversation(&dir, &content);

    let report = scan_file(&path, parser(), threader(), 100).unwrap();
    assert_eq!(report.threads.len(), 2);
    assert_eq!(report.threads[0].message_ids.len(), 2);
    assert_eq!(report.threads[1].boundary, BoundaryReason::TimeGap);
}

#[test]
fn test_topic_language_splits_threads() {
    let dir = TempDir::new().unwrap();
    let content = [
        chat_line("user", 0, "fix the login bug"),
        chat_line("user", 20, "different question: how do I deploy?"),
    ]
    .concat();
    let path = conversation(&dir, &content);

    let report = scan_file(&path, parser(), threader(), 100).unwrap();
    assert_eq!(report.threads.len(), 2);
    assert_eq!(report.threads[1].boundary, BoundaryReason::TopicChange);
}

// ============================================
// Fan-out over WebSocket
// ============================================

fn truncated_event(conversation: &str) -> SinkEvent {
    SinkEvent::FileTruncated {
        path: PathBuf::from(format!("/r/proj/{}.jsonl", conversation)),
        project_id: "proj".to_string(),
        conversation_id: conversation.to_string(),
    }
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_reconnect_with_since_replays_missed_events() {
    let sink = FanoutSink::new(&SinkConfig::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let server = tokio::spawn(ws::serve(
        listener,
        ServerState {
            sink: sink.clone(),
            files: FileRegistry::new(),
        },
        async move {
            let _ = stop_rx.wait_for(|stop| *stop).await;
        },
    ));
    let url = format!("ws://{}/ws", addr);

    for _ in 0..3 {
        sink.publish(truncated_event("c1"));
    }

    let (mut client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let subscribe = json!({"type": "subscribe", "scope": {"kind": "all"}, "since": 0});
    client
        .send(WsMessage::Text(subscribe.to_string().into()))
        .await
        .unwrap();

    let frame = next_json(&mut client).await;
    assert_eq!(frame["type"], "subscribed");
    assert_eq!(frame["replayed"], 3);
    assert_eq!(frame["complete"], true);
    let mut last_seq = 0;
    for expected in 1..=3 {
        let event = next_json(&mut client).await;
        assert_eq!(event["type"], "file.truncated");
        assert_eq!(event["seq"], expected);
        last_seq = event["seq"].as_u64().unwrap();
    }
    client.close(None).await.unwrap();

    // Missed while disconnected; one belongs to another conversation.
    sink.publish(truncated_event("c1"));
    sink.publish(truncated_event("c2"));

    let (mut client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let subscribe = json!({
        "type": "subscribe",
        "scope": {"kind": "conversation", "conversationId": "c1"},
        "since": last_seq - 1
    });
    client
        .send(WsMessage::Text(subscribe.to_string().into()))
        .await
        .unwrap();

    let frame = next_json(&mut client).await;
    assert_eq!(frame["replayed"], 2);
    // At-least-once: the last seen event may come again.
    assert_eq!(next_json(&mut client).await["seq"], 3);
    assert_eq!(next_json(&mut client).await["seq"], 4);

    client
        .send(WsMessage::Text(json!({"type": "ping"}).to_string().into()))
        .await
        .unwrap();
    let pong = next_json(&mut client).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["head"], 5);

    client.close(None).await.unwrap();
    stop_tx.send(true).unwrap();
    server.await.unwrap().unwrap();
}

// ============================================
// End to end
// ============================================

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn polling_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.watcher.root = root.to_path_buf();
    config.watcher.force_polling = true;
    config.watcher.poll_interval_ms = 50;
    config.watcher.debounce_ms = 50;
    config.watcher.stability_threshold_ms = 50;
    config
}

#[tokio::test]
async fn test_watch_pipeline_persists_and_publishes() {
    threadscope_core::logging::init_test();
    let dir = TempDir::new().unwrap();
    let path = conversation(&dir, &chat_line("user", 0, "hello there"));
    let config = polling_config(dir.path());

    let db = Database::open(&dir.path().join("state/threadscope.db")).unwrap();
    db.migrate().unwrap();
    let (store, writer) = StoreHandle::spawn(db);
    let sink = FanoutSink::new(&config.sink);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(64);

    let watcher = DirectoryWatcher::watch(&config.watcher, events_tx).unwrap();
    let coordinator = Coordinator::new(
        &config,
        store.clone(),
        sink.clone(),
        AnalysisCache::from_config(&config.analysis),
    );
    let pipeline = tokio::spawn(coordinator.run(events_rx, shutdown_rx));

    let db_view = store.clone();
    wait_until("initial message", || {
        db_view.database().count_messages("conv").unwrap_or(0) == 1
    })
    .await;

    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(chat_line("assistant", 1, "hi").as_bytes()).unwrap();
    file.write_all(chat_line("user", 2, "thanks").as_bytes()).unwrap();
    drop(file);

    wait_until("appended messages", || {
        db_view.database().count_messages("conv").unwrap_or(0) == 3
    })
    .await;

    let appended = sink
        .replay_since(0)
        .iter()
        .filter(|e| e.event.event_type() == "message.appended")
        .count();
    assert_eq!(appended, 3);

    shutdown_tx.send(true).unwrap();
    watcher.stop().await;
    let counters = pipeline.await.unwrap().unwrap();
    assert_eq!(counters.messages, 3);
    store.shutdown().await.unwrap();
    writer.await.unwrap();

    // A restart resumes at the stored checkpoint and adds nothing.
    let db = Database::open(&dir.path().join("state/threadscope.db")).unwrap();
    db.migrate().unwrap();
    let stored = db.load_checkpoint(&path).unwrap().unwrap();
    assert_eq!(stored.checkpoint.offset, std::fs::metadata(&path).unwrap().len());
    assert_eq!(db.message_ids("conv").unwrap().len(), 3);
}

//! Context analysis for threads.
//!
//! Analysis is derived data: it never feeds back into threading and can be
//! recomputed at any time. [`analyze`] is the pure computation; [`spawn`]
//! runs it on a detached task fed by a bounded queue and publishes the
//! result as a `thread.updated` event.
//!
//! A result is only published while its snapshot is still the newest one
//! the pipeline has seen for the thread. Otherwise a slow analysis would
//! follow a newer `thread.updated` with an older thread.

mod cache;

pub use cache::AnalysisCache;

use crate::sink::{FanoutSink, SinkEvent};
use crate::text;
use crate::types::{
    ComplexityTrend, ContextAnalysis, EngagementMetrics, LatencyStats, Message, Role, Thread,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TOP_KEYWORDS: usize = 8;
const TREND_THRESHOLD: f64 = 0.05;
const MIN_TREND_SAMPLES: usize = 3;

/// Compute keywords, complexity trend and engagement for a thread.
pub fn analyze(_thread: &Thread, messages: &[Arc<Message>]) -> ContextAnalysis {
    ContextAnalysis {
        keywords: top_keywords(messages, TOP_KEYWORDS),
        complexity: complexity_trend(messages),
        engagement: engagement(messages),
    }
}

/// Most frequent salient terms; equal counts sort alphabetically.
pub fn top_keywords(messages: &[Arc<Message>], limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for message in messages {
        for term in text::salient_terms(&message.content) {
            *counts.entry(term).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(limit).map(|(term, _)| term).collect()
}

/// Per-message complexity in [0, 1].
fn complexity_score(content: &str) -> Option<f64> {
    if text::words(content).next().is_none() {
        return None;
    }
    let sentence = (text::average_sentence_length(content) / 25.0).min(1.0);
    Some(0.5 * sentence + 0.5 * text::technical_density(content))
}

pub fn complexity_trend(messages: &[Arc<Message>]) -> ComplexityTrend {
    let scores: Vec<f64> = messages
        .iter()
        .filter_map(|m| complexity_score(&m.content))
        .collect();
    if scores.len() < MIN_TREND_SAMPLES {
        return ComplexityTrend::Stable;
    }

    let n = scores.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = scores.iter().sum::<f64>() / n;
    if mean_y <= 0.0 {
        return ComplexityTrend::Stable;
    }

    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in scores.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    let slope = num / den / mean_y;

    if slope > TREND_THRESHOLD {
        ComplexityTrend::Increasing
    } else if slope < -TREND_THRESHOLD {
        ComplexityTrend::Decreasing
    } else {
        ComplexityTrend::Stable
    }
}

pub fn engagement(messages: &[Arc<Message>]) -> EngagementMetrics {
    let user_messages = messages.iter().filter(|m| m.role == Role::User).count();
    let assistant_messages = messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .count();

    let latencies: Vec<i64> = messages
        .windows(2)
        .filter(|pair| pair[0].role != pair[1].role)
        .map(|pair| (pair[1].timestamp - pair[0].timestamp).num_milliseconds().max(0))
        .collect();

    EngagementMetrics {
        user_messages,
        assistant_messages,
        user_assistant_ratio: (assistant_messages > 0)
            .then(|| user_messages as f64 / assistant_messages as f64),
        response_latency: latency_stats(latencies),
    }
}

fn latency_stats(mut samples: Vec<i64>) -> LatencyStats {
    if samples.is_empty() {
        return LatencyStats::default();
    }
    samples.sort_unstable();
    let count = samples.len();
    let mean = samples.iter().sum::<i64>() as f64 / count as f64;
    let median = if count % 2 == 0 {
        (samples[count / 2 - 1] + samples[count / 2]) as f64 / 2.0
    } else {
        samples[count / 2] as f64
    };
    // nearest rank
    let p90_rank = ((0.9 * count as f64).ceil() as usize).clamp(1, count);

    LatencyStats {
        count,
        min_ms: samples.first().copied(),
        max_ms: samples.last().copied(),
        mean_ms: Some(mean),
        median_ms: Some(median),
        p90_ms: Some(samples[p90_rank - 1] as f64),
    }
}

// ============================================
// Detached analyzer task
// ============================================

/// One thread snapshot to analyze.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub project_id: String,
    pub conversation_id: String,
    pub thread: Thread,
    pub messages: Vec<Arc<Message>>,
}

/// Submission side of the analyzer queue.
#[derive(Clone)]
pub struct AnalyzerHandle {
    tx: mpsc::Sender<AnalysisRequest>,
    /// Newest message count seen per thread id
    latest: Arc<DashMap<String, usize>>,
    dropped: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
    superseded: Arc<AtomicU64>,
}

impl AnalyzerHandle {
    /// Record that a snapshot of `thread_id` with `message_count` messages
    /// is about to be published. Results for smaller snapshots are dropped.
    pub fn track(&self, thread_id: &str, message_count: usize) {
        self.latest
            .entry(thread_id.to_string())
            .and_modify(|n| *n = (*n).max(message_count))
            .or_insert(message_count);
    }

    /// Queue a request; a full queue drops it. Never waits.
    pub fn submit(&self, request: AnalysisRequest) -> bool {
        self.track(&request.thread.id, request.thread.message_ids.len());
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(request)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(thread_id = %request.thread.id, dropped, "Analysis queue full, request dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn superseded(&self) -> u64 {
        self.superseded.load(Ordering::Relaxed)
    }
}

/// Start the analyzer. The task ends once every handle is dropped.
pub fn spawn(
    cache: AnalysisCache,
    sink: FanoutSink,
    queue_capacity: usize,
) -> (AnalyzerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue_capacity.max(1));
    let handle = AnalyzerHandle {
        tx,
        latest: Arc::new(DashMap::new()),
        dropped: Arc::new(AtomicU64::new(0)),
        completed: Arc::new(AtomicU64::new(0)),
        superseded: Arc::new(AtomicU64::new(0)),
    };
    let task = tokio::spawn(run(
        rx,
        cache,
        sink,
        handle.latest.clone(),
        handle.completed.clone(),
        handle.superseded.clone(),
    ));
    (handle, task)
}

async fn run(
    mut rx: mpsc::Receiver<AnalysisRequest>,
    mut cache: AnalysisCache,
    sink: FanoutSink,
    latest: Arc<DashMap<String, usize>>,
    completed: Arc<AtomicU64>,
    superseded: Arc<AtomicU64>,
) {
    while let Some(first) = rx.recv().await {
        // Only the newest snapshot of each thread is worth analyzing.
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            match batch.iter_mut().find(|r| r.thread.id == next.thread.id) {
                Some(slot) => *slot = next,
                None => batch.push(next),
            }
        }

        for request in batch {
            let count = request.thread.message_ids.len();
            let analysis = match cache.get(&request.thread.id, count) {
                Some(cached) => cached,
                None => {
                    let fresh = analyze(&request.thread, &request.messages);
                    cache.insert(&request.thread.id, count, fresh.clone());
                    fresh
                }
            };

            // The entry stays locked across the check and the publish, so a
            // newer snapshot is either tracked first or published after us.
            let thread_id = request.thread.id.clone();
            match latest.entry(thread_id) {
                Entry::Occupied(newest) if *newest.get() > count => {
                    superseded.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(thread_id = %newest.key(), count, "Analysis superseded");
                    continue;
                }
                entry => {
                    sink.publish(SinkEvent::ThreadUpdated {
                        conversation_id: request.conversation_id,
                        project_id: request.project_id,
                        thread: request.thread,
                        context_analysis: Some(analysis),
                    });
                    // Queue order is submission order, so nothing older is left behind.
                    if let Entry::Occupied(newest) = entry {
                        newest.remove();
                    }
                }
            }
            completed.fetch_add(1, Ordering::Relaxed);
        }
    }
    tracing::debug!("Analyzer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;
    use crate::types::{BoundaryReason, SourceRef};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::path::PathBuf;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn msg(n: u64, role: Role, seconds: i64, content: &str) -> Arc<Message> {
        Arc::new(Message {
            id: format!("m{}", n),
            conversation_id: "conv".to_string(),
            project_id: "proj".to_string(),
            role,
            content: content.to_string(),
            timestamp: at(seconds),
            usage: None,
            tool_calls: vec![],
            source: SourceRef {
                path: PathBuf::from("/p/conv.jsonl"),
                byte_offset: n,
                line_number: n,
            },
            detector: "role_content".to_string(),
            raw: serde_json::Value::Null,
        })
    }

    fn thread(messages: &[Arc<Message>]) -> Thread {
        Thread {
            id: format!("conv:{}", messages[0].id),
            conversation_id: "conv".to_string(),
            message_ids: messages.iter().map(|m| m.id.clone()).collect(),
            started_at: messages[0].timestamp,
            ended_at: messages[messages.len() - 1].timestamp,
            topic: None,
            keywords: vec![],
            confidence: 1.0,
            boundary: BoundaryReason::FirstThread,
            closed: false,
        }
    }

    #[test]
    fn test_keywords_rank_by_frequency_then_alphabet() {
        let messages = vec![
            msg(1, Role::User, 0, "parser cache zebra"),
            msg(2, Role::Assistant, 1, "parser cache apple"),
        ];
        let keywords = top_keywords(&messages, 8);
        assert_eq!(keywords, vec!["cache", "parser", "apple", "zebra"]);
        assert_eq!(top_keywords(&messages, 1), vec!["cache"]);
    }

    #[test]
    fn test_complexity_trend() {
        let rising = vec![
            msg(1, Role::User, 0, "hi there"),
            msg(2, Role::User, 1, "please check the config file"),
            msg(3, Role::User, 2, "call parse_line() via Parser::new and check serde_json -> Value with tokio mpsc channels"),
        ];
        assert_eq!(complexity_trend(&rising), ComplexityTrend::Increasing);

        let falling: Vec<_> = rising.iter().rev().cloned().collect();
        assert_eq!(complexity_trend(&falling), ComplexityTrend::Decreasing);

        let flat = vec![
            msg(1, Role::User, 0, "same words here"),
            msg(2, Role::User, 1, "same words here"),
            msg(3, Role::User, 2, "same words here"),
        ];
        assert_eq!(complexity_trend(&flat), ComplexityTrend::Stable);
        assert_eq!(complexity_trend(&rising[..2]), ComplexityTrend::Stable);
    }

    #[test]
    fn test_engagement_latency() {
        let messages = vec![
            msg(1, Role::User, 0, "q"),
            msg(2, Role::Assistant, 2, "a"),
            msg(3, Role::Assistant, 3, "a"),
            msg(4, Role::User, 13, "q"),
            msg(5, Role::Assistant, 17, "a"),
        ];
        let metrics = engagement(&messages);
        assert_eq!(metrics.user_messages, 2);
        assert_eq!(metrics.assistant_messages, 3);
        assert!((metrics.user_assistant_ratio.unwrap() - 2.0 / 3.0).abs() < 1e-9);

        let latency = metrics.response_latency;
        assert_eq!(latency.count, 3);
        assert_eq!(latency.min_ms, Some(2000));
        assert_eq!(latency.max_ms, Some(10000));
        assert_eq!(latency.median_ms, Some(4000.0));
        assert_eq!(latency.p90_ms, Some(10000.0));
        assert!((latency.mean_ms.unwrap() - 16000.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_engagement_without_assistant() {
        let metrics = engagement(&[msg(1, Role::User, 0, "q")]);
        assert_eq!(metrics.user_assistant_ratio, None);
        assert_eq!(metrics.response_latency.count, 0);
        assert_eq!(metrics.response_latency.mean_ms, None);
    }

    #[tokio::test]
    async fn test_analyzer_publishes_thread_update() {
        let sink = FanoutSink::new(&SinkConfig::default());
        let cache = AnalysisCache::new(8, std::time::Duration::from_secs(60));
        let (handle, task) = spawn(cache, sink.clone(), 4);

        let messages = vec![msg(1, Role::User, 0, "parser bug"), msg(2, Role::Assistant, 1, "parser fix")];
        assert!(handle.submit(AnalysisRequest {
            project_id: "proj".to_string(),
            conversation_id: "conv".to_string(),
            thread: thread(&messages),
            messages,
        }));
        let completed = handle.completed.clone();
        drop(handle);
        task.await.unwrap();

        assert_eq!(completed.load(Ordering::Relaxed), 1);
        let replay = sink.replay_since(0);
        assert_eq!(replay.len(), 1);
        match &replay[0].event {
            SinkEvent::ThreadUpdated {
                context_analysis: Some(analysis),
                ..
            } => assert_eq!(analysis.keywords[0], "parser"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_superseded_snapshot_is_not_published() {
        let sink = FanoutSink::new(&SinkConfig::default());
        let cache = AnalysisCache::new(8, std::time::Duration::from_secs(60));
        let (handle, task) = spawn(cache, sink.clone(), 4);

        let messages = vec![
            msg(1, Role::User, 0, "parser bug"),
            msg(2, Role::Assistant, 1, "parser fix"),
            msg(3, Role::User, 2, "parser test"),
        ];
        // The three-message snapshot went out before the older request ran.
        handle.track(&thread(&messages).id, 3);
        assert!(handle.submit(AnalysisRequest {
            project_id: "proj".to_string(),
            conversation_id: "conv".to_string(),
            thread: thread(&messages[..2]),
            messages: messages[..2].to_vec(),
        }));

        let superseded = handle.superseded.clone();
        let completed = handle.completed.clone();
        drop(handle);
        task.await.unwrap();

        assert_eq!(superseded.load(Ordering::Relaxed), 1);
        assert_eq!(completed.load(Ordering::Relaxed), 0);
        assert!(sink.replay_since(0).is_empty());
    }
}

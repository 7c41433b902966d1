//! Conversation threading.
//!
//! Messages of one conversation arrive in parse order; [`Threader`] decides
//! for each whether it extends the open thread or closes it and opens a new
//! one. The decision is a pure function of the open thread and the message,
//! so the same sequence always yields the same boundaries, ids and
//! confidences.
//!
//! ## Boundary rules (first firing wins)
//!
//! 1. Adaptive time gap: the threshold follows the thread's average cadence
//! 2. Explicit topic-change language in a user message
//! 3. Tool-usage pattern break (Jaccard similarity against a trailing window)
//!
//! When rule 2 or 3 fails, the decision degrades to a fixed baseline gap.

mod merge;
pub mod rules;

pub use merge::merge_short_threads;
pub use rules::{BoundaryRule, RuleError, Signal, TimeGapRule, ToolPatternRule, TopicChangeRule};

use crate::config::ThreadingConfig;
use crate::text;
use crate::types::{BoundaryReason, Message, Thread};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

/// Keywords kept on a thread for labeling and merge decisions
const THREAD_KEYWORDS: usize = 5;

/// A thread that can still be extended, plus the running state the rules need.
#[derive(Debug, Clone)]
pub struct OpenThread {
    thread: Thread,
    last_timestamp: DateTime<Utc>,
    gap_sum_ms: i64,
    gap_count: u32,
    /// Tool names of the trailing messages, oldest first
    tool_window: VecDeque<Vec<String>>,
    window_size: usize,
    /// keyword → (occurrences, index of the last message using it)
    keyword_counts: HashMap<String, (usize, usize)>,
}

impl OpenThread {
    fn start(message: &Message, reason: BoundaryReason, window_size: usize) -> Self {
        let mut open = Self {
            thread: Thread {
                id: Thread::thread_id(&message.conversation_id, &message.id),
                conversation_id: message.conversation_id.clone(),
                message_ids: Vec::new(),
                started_at: message.timestamp,
                ended_at: message.timestamp,
                topic: None,
                keywords: Vec::new(),
                confidence: reason.initial_confidence(),
                boundary: reason,
                closed: false,
            },
            last_timestamp: message.timestamp,
            gap_sum_ms: 0,
            gap_count: 0,
            tool_window: VecDeque::new(),
            window_size: window_size.max(1),
            keyword_counts: HashMap::new(),
        };
        open.append(message);
        open
    }

    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    pub fn len(&self) -> usize {
        self.thread.message_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thread.message_ids.is_empty()
    }

    /// Mean gap between consecutive messages; `None` below two messages.
    pub fn average_gap_ms(&self) -> Option<f64> {
        (self.gap_count > 0).then(|| self.gap_sum_ms as f64 / self.gap_count as f64)
    }

    /// Gap from the last message to `message`; out-of-order timestamps count as 0.
    pub fn gap_to_ms(&self, message: &Message) -> i64 {
        (message.timestamp - self.last_timestamp)
            .num_milliseconds()
            .max(0)
    }

    /// Messages in the trailing window that used at least one tool.
    pub fn tool_using_in_window(&self) -> usize {
        self.tool_window.iter().filter(|t| !t.is_empty()).count()
    }

    /// Union of tool names across the trailing window.
    pub fn window_tools(&self) -> BTreeSet<&str> {
        self.tool_window
            .iter()
            .flat_map(|names| names.iter().map(String::as_str))
            .collect()
    }

    fn append(&mut self, message: &Message) {
        if !self.thread.message_ids.is_empty() {
            self.gap_sum_ms += self.gap_to_ms(message);
            self.gap_count += 1;
        }
        let index = self.thread.message_ids.len();
        self.thread.message_ids.push(message.id.clone());
        if message.timestamp > self.thread.ended_at {
            self.thread.ended_at = message.timestamp;
        }
        self.last_timestamp = message.timestamp;

        self.tool_window.push_back(
            message
                .tool_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
        );
        while self.tool_window.len() > self.window_size {
            self.tool_window.pop_front();
        }

        for term in text::salient_terms(&message.content) {
            let entry = self.keyword_counts.entry(term).or_insert((0, index));
            entry.0 += 1;
            entry.1 = index;
        }
        self.relabel();
    }

    /// Topic = most frequent keyword, the most recently used one on ties.
    fn relabel(&mut self) {
        let mut ranked: Vec<(&String, &(usize, usize))> = self.keyword_counts.iter().collect();
        ranked.sort_by(|a, b| {
            b.1 .0
                .cmp(&a.1 .0)
                .then(b.1 .1.cmp(&a.1 .1))
                .then(a.0.cmp(b.0))
        });
        self.thread.keywords = ranked
            .iter()
            .take(THREAD_KEYWORDS)
            .map(|(k, _)| (*k).clone())
            .collect();
        self.thread.topic = self.thread.keywords.first().cloned();
    }

    fn close(mut self) -> Thread {
        self.thread.closed = true;
        self.thread
    }
}

/// Result of [`Threader::extend_thread`].
#[derive(Debug, Clone)]
pub struct ThreadExtension {
    /// The open thread after the message was applied
    pub thread: OpenThread,
    /// The previous thread, when a boundary closed it
    pub closed: Option<Thread>,
    /// Why a thread was opened by this message
    pub boundary: Option<BoundaryReason>,
}

impl ThreadExtension {
    /// A boundary split an existing thread (the first thread does not count).
    pub fn boundary_fired(&self) -> bool {
        self.boundary.is_some() && self.closed.is_some()
    }
}

/// Stateless boundary engine.
pub struct Threader {
    config: ThreadingConfig,
    time_gap: TimeGapRule,
    rules: Vec<Box<dyn BoundaryRule>>,
}

impl Threader {
    pub fn new(config: ThreadingConfig) -> Self {
        let rules: Vec<Box<dyn BoundaryRule>> = vec![
            Box::new(TopicChangeRule::new()),
            Box::new(ToolPatternRule::new(&config)),
        ];
        Self::with_rules(config, rules)
    }

    /// Threader with custom rules evaluated after the time gap, in order.
    pub fn with_rules(config: ThreadingConfig, rules: Vec<Box<dyn BoundaryRule>>) -> Self {
        Self {
            time_gap: TimeGapRule::new(&config),
            config,
            rules,
        }
    }

    pub fn config(&self) -> &ThreadingConfig {
        &self.config
    }

    /// Apply one message to the conversation's open thread.
    pub fn extend_thread(&self, open: Option<OpenThread>, message: &Message) -> ThreadExtension {
        let Some(mut open) = open else {
            return self.open_new(None, message, BoundaryReason::FirstThread);
        };

        let gap = self.time_gap.evaluate(&open, message);
        if gap.fired {
            return self.open_new(Some(open), message, BoundaryReason::TimeGap);
        }

        let mut strength = gap.strength;
        for rule in &self.rules {
            match rule.evaluate(&open, message) {
                Ok(signal) if signal.fired => {
                    return self.open_new(Some(open), message, rule.reason());
                }
                Ok(signal) => strength = strength.max(signal.strength),
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %message.conversation_id,
                        message_id = %message.id,
                        rule = rule.reason().as_str(),
                        error = %e,
                        "Boundary rule failed, falling back to time gap"
                    );
                    let baseline = self.time_gap.evaluate_baseline(&open, message);
                    if baseline.fired {
                        return self.open_new(Some(open), message, BoundaryReason::Degraded);
                    }
                    strength = baseline.strength;
                    break;
                }
            }
        }

        open.append(message);
        let confidence = open.thread.confidence * 0.8 + 0.2 * (1.0 - strength.clamp(0.0, 1.0));
        open.thread.confidence = confidence.clamp(0.0, 1.0);

        ThreadExtension {
            thread: open,
            closed: None,
            boundary: None,
        }
    }

    fn open_new(
        &self,
        previous: Option<OpenThread>,
        message: &Message,
        reason: BoundaryReason,
    ) -> ThreadExtension {
        ThreadExtension {
            thread: OpenThread::start(message, reason, self.config.tool_window),
            closed: previous.map(OpenThread::close),
            boundary: Some(reason),
        }
    }

    /// Close the open thread at end of input.
    pub fn finalize(&self, open: Option<OpenThread>) -> Option<Thread> {
        open.map(OpenThread::close)
    }
}

// ============================================
// Per-conversation driver
// ============================================

/// What one pushed message changed.
#[derive(Debug, Clone)]
pub struct ThreadUpdate {
    /// Snapshot of the open thread after the message
    pub thread: Thread,
    pub closed: Option<Thread>,
    /// Messages of `closed`, oldest first
    pub closed_messages: Vec<Arc<Message>>,
    pub boundary: Option<BoundaryReason>,
}

/// Threading state of one conversation.
pub struct ConversationThreader {
    threader: Arc<Threader>,
    open: Option<OpenThread>,
    open_messages: Vec<Arc<Message>>,
    closed: Vec<Thread>,
}

impl ConversationThreader {
    pub fn new(threader: Arc<Threader>) -> Self {
        Self {
            threader,
            open: None,
            open_messages: Vec::new(),
            closed: Vec::new(),
        }
    }

    pub fn push(&mut self, message: Arc<Message>) -> ThreadUpdate {
        let extension = self.threader.extend_thread(self.open.take(), &message);

        let mut closed_messages = Vec::new();
        if let Some(closed) = &extension.closed {
            self.closed.push(closed.clone());
            closed_messages = std::mem::take(&mut self.open_messages);
        }
        self.open_messages.push(message);

        let update = ThreadUpdate {
            thread: extension.thread.thread().clone(),
            closed: extension.closed,
            closed_messages,
            boundary: extension.boundary,
        };
        self.open = Some(extension.thread);
        update
    }

    pub fn open_thread(&self) -> Option<&Thread> {
        self.open.as_ref().map(OpenThread::thread)
    }

    /// Messages of the open thread, oldest first.
    pub fn open_messages(&self) -> &[Arc<Message>] {
        &self.open_messages
    }

    pub fn closed_threads(&self) -> &[Thread] {
        &self.closed
    }

    /// Threads seen so far, closed ones first, then the open one.
    pub fn threads(&self) -> Vec<Thread> {
        let mut all = self.closed.clone();
        all.extend(self.open_thread().cloned());
        all
    }

    /// Forget everything after the file was rewritten. The open thread is
    /// closed as it stands, without a merge pass, and returned; threads of
    /// the earlier contents are never extended or merged again.
    pub fn reset(&mut self) -> Option<Thread> {
        self.closed.clear();
        self.open_messages.clear();
        self.threader.finalize(self.open.take())
    }

    /// Close the open thread, run the merge pass and reset.
    pub fn finalize(&mut self) -> Vec<Thread> {
        let mut threads = std::mem::take(&mut self.closed);
        threads.extend(self.threader.finalize(self.open.take()));
        self.open_messages.clear();
        merge_short_threads(threads, self.threader.config())
    }
}

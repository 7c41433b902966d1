//! Finalization pass that folds short threads back into their predecessor.

use crate::config::ThreadingConfig;
use crate::types::Thread;

const MERGED_KEYWORDS: usize = 8;

/// Merge each short thread that closely follows a similar one.
///
/// A thread merges into the previous (possibly already merged) thread when it
/// has fewer than `min_thread_messages` messages, starts within
/// `merge_gap_ms` of the previous end, and shares its topic.
pub fn merge_short_threads(threads: Vec<Thread>, config: &ThreadingConfig) -> Vec<Thread> {
    let mut merged: Vec<Thread> = Vec::with_capacity(threads.len());

    for thread in threads {
        match merged.last_mut() {
            Some(prev) if should_merge(prev, &thread, config) => absorb(prev, thread),
            _ => merged.push(thread),
        }
    }

    merged
}

fn should_merge(prev: &Thread, cur: &Thread, config: &ThreadingConfig) -> bool {
    if cur.len() >= config.min_thread_messages {
        return false;
    }
    let gap = (cur.started_at - prev.ended_at).num_milliseconds();
    if gap > config.merge_gap_ms {
        return false;
    }
    similar_topics(prev, cur)
}

fn similar_topics(a: &Thread, b: &Thread) -> bool {
    match (&a.topic, &b.topic) {
        (None, _) | (_, None) => true,
        (Some(x), Some(y)) if x == y => true,
        _ => a.keywords.iter().any(|k| b.keywords.contains(k)),
    }
}

fn absorb(prev: &mut Thread, cur: Thread) {
    prev.message_ids.extend(cur.message_ids);
    if cur.ended_at > prev.ended_at {
        prev.ended_at = cur.ended_at;
    }
    if prev.topic.is_none() {
        prev.topic = cur.topic;
    }
    for keyword in cur.keywords {
        if prev.keywords.len() >= MERGED_KEYWORDS {
            break;
        }
        if !prev.keywords.contains(&keyword) {
            prev.keywords.push(keyword);
        }
    }
    prev.confidence = prev.confidence.min(cur.confidence);
    prev.closed = prev.closed && cur.closed;
}

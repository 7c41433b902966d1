//! Correlation of tool results with the calls that requested them.

use crate::types::{ToolCall, ToolCallResult, ToolCallStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct PendingCall {
    call: ToolCall,
    called_at: DateTime<Utc>,
}

/// Per-file tracker of pending tool calls and orphaned results.
#[derive(Debug, Default)]
pub struct ToolCallTracker {
    pending: HashMap<String, PendingCall>,
    orphans: Vec<ToolCallResult>,
}

impl ToolCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the pending calls of a message issued at `called_at`.
    ///
    /// A call whose result already arrived as an orphan is resolved at once;
    /// the resolved snapshots are returned.
    pub fn register(&mut self, calls: &[ToolCall], called_at: DateTime<Utc>) -> Vec<ToolCall> {
        let mut resolved = Vec::new();
        for call in calls.iter().filter(|c| c.status == ToolCallStatus::Pending) {
            let pending = PendingCall {
                call: call.clone(),
                called_at,
            };
            match self
                .orphans
                .iter()
                .position(|o| o.correlation_id == call.id)
            {
                Some(index) => {
                    let orphan = self.orphans.remove(index);
                    resolved.push(complete(pending, &orphan));
                }
                None => {
                    self.pending.insert(call.id.clone(), pending);
                }
            }
        }
        resolved
    }

    /// Resolve a pending call with `result`.
    ///
    /// Returns `None` when no call matches; the result is then kept as an orphan.
    pub fn resolve(&mut self, result: ToolCallResult) -> Option<ToolCall> {
        match self.pending.remove(&result.correlation_id) {
            Some(pending) => Some(complete(pending, &result)),
            None => {
                self.orphans.push(result);
                None
            }
        }
    }

    pub fn orphans(&self) -> &[ToolCallResult] {
        &self.orphans
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Forget everything, e.g. after the file was truncated.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.orphans.clear();
    }
}

fn complete(pending: PendingCall, result: &ToolCallResult) -> ToolCall {
    let mut call = pending.call;
    call.status = if result.is_error {
        ToolCallStatus::Error
    } else {
        ToolCallStatus::Success
    };
    call.output = Some(result.output.clone());
    call.duration_ms = Some(
        (result.timestamp - pending.called_at)
            .num_milliseconds()
            .max(0),
    );
    call
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            message_id: "m1".to_string(),
            name: "Read".to_string(),
            input: json!({}),
            output: None,
            duration_ms: None,
            status: ToolCallStatus::Pending,
        }
    }

    fn result(id: &str, at: DateTime<Utc>, is_error: bool) -> ToolCallResult {
        ToolCallResult {
            correlation_id: id.to_string(),
            output: json!("done"),
            is_error,
            timestamp: at,
            line_number: 2,
        }
    }

    #[test]
    fn test_resolve_sets_status_output_and_duration() {
        let t0 = Utc::now();
        let mut tracker = ToolCallTracker::new();
        assert!(tracker.register(&[call("a"), call("b")], t0).is_empty());
        assert_eq!(tracker.pending_count(), 2);

        let resolved = tracker
            .resolve(result("a", t0 + Duration::milliseconds(1500), false))
            .unwrap();
        assert_eq!(resolved.status, ToolCallStatus::Success);
        assert_eq!(resolved.duration_ms, Some(1500));
        assert_eq!(resolved.output, Some(json!("done")));

        let failed = tracker.resolve(result("b", t0, true)).unwrap();
        assert_eq!(failed.status, ToolCallStatus::Error);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_unmatched_result_is_orphan() {
        let mut tracker = ToolCallTracker::new();
        assert!(tracker.resolve(result("ghost", Utc::now(), false)).is_none());
        assert_eq!(tracker.orphans().len(), 1);
        assert_eq!(tracker.orphans()[0].correlation_id, "ghost");
    }

    #[test]
    fn test_late_call_adopts_orphan() {
        let t0 = Utc::now();
        let mut tracker = ToolCallTracker::new();
        tracker.resolve(result("late", t0, false));

        let resolved = tracker.register(&[call("late")], t0 - Duration::seconds(1));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].status, ToolCallStatus::Success);
        assert!(tracker.orphans().is_empty());
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_completed_calls_are_not_tracked() {
        let mut done = call("x");
        done.status = ToolCallStatus::Success;
        let mut tracker = ToolCallTracker::new();
        tracker.register(&[done], Utc::now());
        assert_eq!(tracker.pending_count(), 0);
    }
}

use super::event::Envelope;
use std::collections::VecDeque;
use std::sync::Arc;

/// Bounded log of the most recent events, oldest first.
#[derive(Debug)]
pub struct ReplayLog {
    capacity: usize,
    events: VecDeque<Arc<Envelope>>,
}

impl ReplayLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn push(&mut self, envelope: Arc<Envelope>) {
        if self.capacity == 0 {
            return;
        }
        while self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(envelope);
    }

    /// Retained events with `seq > since`.
    pub fn since(&self, since: u64) -> impl Iterator<Item = &Arc<Envelope>> {
        // seqs are increasing, so skip the prefix by binary search
        let start = self.events.partition_point(|e| e.seq <= since);
        self.events.range(start..)
    }

    /// Whether every event after `since` is still retained.
    pub fn covers(&self, since: u64, head: u64) -> bool {
        match self.events.front() {
            Some(oldest) => oldest.seq <= since + 1,
            None => since >= head,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkEvent;
    use std::path::PathBuf;

    fn envelope(seq: u64) -> Arc<Envelope> {
        Arc::new(Envelope {
            seq,
            event: SinkEvent::FileTruncated {
                path: PathBuf::from("/r/p/c.jsonl"),
                project_id: "p".to_string(),
                conversation_id: "c".to_string(),
            },
        })
    }

    #[test]
    fn test_bounded_and_ordered() {
        let mut log = ReplayLog::new(3);
        for seq in 1..=5 {
            log.push(envelope(seq));
        }
        assert_eq!(log.len(), 3);
        let seqs: Vec<u64> = log.since(0).map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        let seqs: Vec<u64> = log.since(4).map(|e| e.seq).collect();
        assert_eq!(seqs, vec![5]);
    }

    #[test]
    fn test_covers() {
        let mut log = ReplayLog::new(3);
        assert!(log.covers(0, 0));
        for seq in 1..=5 {
            log.push(envelope(seq));
        }
        assert!(log.covers(2, 5));
        assert!(!log.covers(1, 5));
        assert!(log.covers(5, 5));
    }
}

use crate::config::AnalysisConfig;
use crate::types::ContextAnalysis;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

type CacheKey = (String, usize);

#[derive(Debug, Clone)]
struct CacheEntry {
    inserted_at: Instant,
    analysis: ContextAnalysis,
}

/// Bounded TTL cache of analyses keyed by (thread id, message count).
///
/// The cache is a plain owned value; whoever runs the analyzer holds it.
/// Eviction is oldest-inserted first.
#[derive(Debug)]
pub struct AnalysisCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<CacheKey, CacheEntry>,
    order: VecDeque<CacheKey>,
    hits: u64,
    misses: u64,
}

impl AnalysisCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            order: VecDeque::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(
            config.cache_capacity,
            Duration::from_secs(config.cache_ttl_secs),
        )
    }

    pub fn get(&mut self, thread_id: &str, message_count: usize) -> Option<ContextAnalysis> {
        let key = (thread_id.to_string(), message_count);
        let fresh = match self.entries.get(&key) {
            Some(entry) => entry.inserted_at.elapsed() < self.ttl,
            None => {
                self.misses += 1;
                return None;
            }
        };

        if fresh {
            self.hits += 1;
            self.entries.get(&key).map(|e| e.analysis.clone())
        } else {
            self.entries.remove(&key);
            self.order.retain(|k| k != &key);
            self.misses += 1;
            None
        }
    }

    pub fn insert(&mut self, thread_id: &str, message_count: usize, analysis: ContextAnalysis) {
        let key = (thread_id.to_string(), message_count);
        let entry = CacheEntry {
            inserted_at: Instant::now(),
            analysis,
        };
        if self.entries.insert(key.clone(), entry).is_some() {
            self.order.retain(|k| k != &key);
        }
        self.order.push_back(key);

        self.purge_expired();
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn purge_expired(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        let entries = &self.entries;
        self.order.retain(|k| entries.contains_key(k));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

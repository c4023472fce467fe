use core::time::Duration;
use std::collections::HashMap;
use std::time::Instant;

use mesh_primitives::MessageId;

/// Soft cap on tracked ids; LRU pressure evicts beyond it.
const SOFT_CAP: usize = 1000;

#[derive(Clone, Copy, Debug, Default)]
pub struct DupStats {
    pub tracked: u64,
    pub evicted: u64,
    pub swept: u64,
}

/// Size- and age-bounded set of recently seen message ids.
///
/// `track` refreshes an already-present id (LRU bump); a single coalesced
/// sweep, scheduled by the owner off [`Dup::sweep_deadline`], drops
/// everything older than `max_age`.
#[derive(Debug)]
pub struct Dup {
    max_age: Duration,
    seen: HashMap<MessageId, Instant>,
    sweep_at: Option<Instant>,
    stats: DupStats,
}

impl Dup {
    #[must_use]
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            seen: HashMap::new(),
            sweep_at: None,
            stats: DupStats::default(),
        }
    }

    /// Record (or refresh) an id.
    pub fn track(&mut self, id: MessageId) {
        let now = Instant::now();
        let _ = self.seen.insert(id, now);
        self.stats.tracked += 1;

        if self.sweep_at.is_none() {
            self.sweep_at = Some(now + self.max_age);
        }

        if self.seen.len() > SOFT_CAP {
            // LRU pressure: drop the stalest entry.
            if let Some(oldest) = self
                .seen
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(id, _)| id.clone())
            {
                let _ = self.seen.remove(&oldest);
                self.stats.evicted += 1;
            }
        }
    }

    /// Whether the id was seen recently. A hit refreshes it.
    pub fn check(&mut self, id: &MessageId) -> bool {
        match self.seen.get_mut(id) {
            Some(at) => {
                *at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// When the next sweep is due, if anything is tracked.
    #[must_use]
    pub fn sweep_deadline(&self) -> Option<Instant> {
        self.sweep_at
    }

    /// Drop entries older than `max_age` and re-arm the sweep timer while
    /// anything remains.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        let max_age = self.max_age;
        let before = self.seen.len();
        self.seen
            .retain(|_, at| now.saturating_duration_since(*at) <= max_age);
        self.stats.swept += (before - self.seen.len()) as u64;

        self.sweep_at = if self.seen.is_empty() {
            None
        } else {
            Some(now + self.max_age)
        };
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> DupStats {
        self.stats
    }
}

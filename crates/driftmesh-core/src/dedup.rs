//! Packet deduplication for the transport manager
//!
//! An exact map from packet id to first-seen time on the monotonic clock.
//! A packet id observed within the window is never delivered or relayed
//! again; once its entry ages out, the same id counts as a new packet.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::types::PacketId;

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Counters for deduplication behaviour
#[derive(Debug, Clone, Copy, Default)]
pub struct DedupStats {
    /// Total ids checked
    pub packets_checked: u64,
    /// Ids rejected as duplicates
    pub duplicates_detected: u64,
    /// Entries removed by pruning
    pub entries_pruned: u64,
}

impl DedupStats {
    /// Fraction of checked packets that were duplicates
    pub fn duplicate_rate(&self) -> f64 {
        if self.packets_checked == 0 {
            0.0
        } else {
            self.duplicates_detected as f64 / self.packets_checked as f64
        }
    }
}

// ----------------------------------------------------------------------------
// Dedup Cache
// ----------------------------------------------------------------------------

/// Sliding-window duplicate detector keyed by packet fingerprint
#[derive(Debug)]
pub struct DedupCache {
    seen: HashMap<PacketId, Instant>,
    window: Duration,
    stats: DedupStats,
}

impl DedupCache {
    /// Create a cache with the given retention window
    pub fn new(window: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            window,
            stats: DedupStats::default(),
        }
    }

    /// Check an id and stamp it as seen
    ///
    /// Returns `true` when the id was already observed inside the window.
    /// A fresh observation (or one whose entry has aged out) restarts the
    /// window for that id.
    pub fn check_and_stamp(&mut self, id: PacketId) -> bool {
        self.check_and_stamp_at(id, Instant::now())
    }

    /// Clock-injected variant used by tests
    pub fn check_and_stamp_at(&mut self, id: PacketId, now: Instant) -> bool {
        self.stats.packets_checked += 1;
        match self.seen.get(&id) {
            Some(&first_seen) if now.duration_since(first_seen) < self.window => {
                self.stats.duplicates_detected += 1;
                true
            }
            _ => {
                self.seen.insert(id, now);
                false
            }
        }
    }

    /// Check without stamping
    pub fn contains(&self, id: &PacketId) -> bool {
        match self.seen.get(id) {
            Some(&first_seen) => Instant::now().duration_since(first_seen) < self.window,
            None => false,
        }
    }

    /// Remove entries older than the window
    pub fn prune(&mut self) -> usize {
        self.prune_at(Instant::now())
    }

    /// Clock-injected variant used by tests
    pub fn prune_at(&mut self, now: Instant) -> usize {
        let window = self.window;
        let before = self.seen.len();
        self.seen
            .retain(|_, first_seen| now.duration_since(*first_seen) < window);
        let removed = before - self.seen.len();
        self.stats.entries_pruned += removed as u64;
        removed
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Behaviour counters
    pub fn stats(&self) -> DedupStats {
        self.stats
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

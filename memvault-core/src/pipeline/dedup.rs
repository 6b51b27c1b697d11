//! Per-user sliding-window deduplication of exact utterances.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::types::{MemoryId, UserAddress};

struct SeenEntry {
    memory_id: MemoryId,
    seen_ms: i64,
}

/// Content-hash dedup table with a sliding window per user.
pub struct DedupTable {
    clock: SharedClock,
    window: Duration,
    users: Mutex<HashMap<UserAddress, HashMap<String, SeenEntry>>>,
}

impl DedupTable {
    #[must_use]
    pub fn new(clock: SharedClock, window: Duration) -> Self {
        Self {
            clock,
            window,
            users: Mutex::new(HashMap::new()),
        }
    }

    /// The memory an identical utterance coalesces into, if it was seen
    /// within the window. Expired entries are pruned on probe.
    #[must_use]
    pub fn probe(&self, user: &UserAddress, content_hash: &str) -> Option<MemoryId> {
        let now = self.clock.now_ms();
        let window_ms = self.window.as_millis() as i64;
        let mut users = self.users.lock();
        let table = users.get_mut(user)?;
        table.retain(|_, entry| now - entry.seen_ms < window_ms);
        table.get(content_hash).map(|entry| entry.memory_id)
    }

    /// Record an accepted utterance for the window.
    pub fn record(&self, user: &UserAddress, content_hash: String, memory_id: MemoryId) {
        let now = self.clock.now_ms();
        self.users
            .lock()
            .entry(user.clone())
            .or_default()
            .insert(
                content_hash,
                SeenEntry {
                    memory_id,
                    seen_ms: now,
                },
            );
    }

    /// Entries currently tracked (stats surface).
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.users.lock().values().map(HashMap::len).sum()
    }
}

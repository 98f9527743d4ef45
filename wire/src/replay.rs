#[cfg(test)]
mod replay_test;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::header::PacketKind;

pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(30);

/// Entry cap: past this the cache sweeps eagerly and, if still full, evicts
/// the oldest entries so a flood cannot balloon memory.
const MAX_ENTRIES: usize = 1 << 16;

type ReplayKey = (u64, u32, u16, u8);

/// ReplayCache remembers recently accepted datagrams so a second copy inside
/// the retention window is rejected. Keys age out on a monotonic clock;
/// outside the window the same datagram is acceptable again.
///
/// Each receiving engine owns exactly one cache; it is never shared.
pub struct ReplayCache {
    window: Duration,
    entries: HashMap<ReplayKey, Instant>,
    last_sweep: Instant,
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_WINDOW)
    }
}

impl ReplayCache {
    pub fn new(window: Duration) -> Self {
        ReplayCache {
            window,
            entries: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records the datagram identity and reports whether it is fresh.
    /// Returns false on a duplicate inside the window.
    pub fn observe(
        &mut self,
        request_id: u64,
        timestamp: u32,
        sequence: u16,
        kind: PacketKind,
    ) -> bool {
        let now = Instant::now();
        self.maybe_sweep(now);

        let key = (request_id, timestamp, sequence, kind.0);
        match self.entries.get(&key) {
            Some(seen) if now.duration_since(*seen) <= self.window => false,
            _ => {
                self.entries.insert(key, now);
                true
            }
        }
    }

    fn maybe_sweep(&mut self, now: Instant) {
        if self.entries.len() < MAX_ENTRIES && now.duration_since(self.last_sweep) < self.window {
            return;
        }
        let window = self.window;
        self.entries.retain(|_, seen| now.duration_since(*seen) <= window);
        self.last_sweep = now;

        // Still over the cap after aging out: drop oldest first.
        if self.entries.len() >= MAX_ENTRIES {
            let mut by_age: Vec<(ReplayKey, Instant)> =
                self.entries.iter().map(|(k, v)| (*k, *v)).collect();
            by_age.sort_by_key(|(_, seen)| *seen);
            for (key, _) in by_age.iter().take(self.entries.len() - MAX_ENTRIES / 2) {
                self.entries.remove(key);
            }
        }
    }
}

//! Rate computation over monotonic counters.

use std::collections::HashMap;
use std::time::Instant;

/// Remembers the previous value of each cumulative counter so successive
/// observations can be turned into per-second rates.
#[derive(Debug, Default)]
pub struct CounterTracker {
    prev: HashMap<String, (u64, Instant)>,
}

impl CounterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Units per second since the last observation of `key`.
    ///
    /// The first observation and any observation where the counter went
    /// backwards (restart, wraparound) only set the baseline and yield 0.
    pub fn rate(&mut self, key: &str, value: u64, now: Instant) -> f64 {
        match self.prev.insert(key.to_string(), (value, now)) {
            Some((prev, at)) if value >= prev => {
                let secs = now.saturating_duration_since(at).as_secs_f64();
                if secs > 0.0 {
                    (value - prev) as f64 / secs
                } else {
                    0.0
                }
            }
            Some((prev, _)) => {
                tracing::debug!("Counter {} went backwards ({} -> {}), resetting baseline", key, prev, value);
                0.0
            }
            None => 0.0,
        }
    }

    /// Forget counters that were not observed in the latest collection.
    pub fn retain_keys<F: Fn(&str) -> bool>(&mut self, keep: F) {
        self.prev.retain(|k, _| keep(k));
    }

    pub fn len(&self) -> usize {
        self.prev.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prev.is_empty()
    }
}

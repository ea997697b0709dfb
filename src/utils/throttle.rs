//! Log throttling utility
//!
//! Limits how often the same failure is logged, so a sink that fails on
//! every frame does not flood the log at the capture frame rate.

use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Log throttler keyed by message kind
///
/// Owned by a single thread; the capture pipeline has no concurrent
/// mutators.
///
/// # Example
///
/// ```rust
/// use uvc_capture::utils::LogThrottler;
///
/// let mut throttler = LogThrottler::with_secs(5);
/// assert_eq!(throttler.should_log("sink_append"), Some(0));
/// assert_eq!(throttler.should_log("sink_append"), None);
/// ```
pub struct LogThrottler {
    entries: HashMap<String, Entry>,
    interval: Duration,
}

impl LogThrottler {
    /// Create a throttler with the minimum time between two logs of one key
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            interval,
        }
    }

    /// Create a throttler with interval specified in seconds
    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Check whether a message of kind `key` should be logged now
    ///
    /// Returns `Some(n)` when it should, where `n` is the number of messages
    /// suppressed since the last one was logged. Returns `None` (and counts
    /// the message as suppressed) while throttled.
    pub fn should_log(&mut self, key: &str) -> Option<u64> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = std::mem::take(&mut entry.suppressed);
                entry.last_logged = now;
                Some(suppressed)
            }
            None => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Forget a key, so its next message is logged immediately
    pub fn clear(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

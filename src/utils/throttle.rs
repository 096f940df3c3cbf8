//! Rate limiting for repeated log lines
//!
//! Decoders and packet loops can fail on every frame once a stream goes bad.
//! `LogThrottler` lets the first failure through, then suppresses the same key
//! until the interval elapses, reporting how many lines were swallowed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct KeyState {
    last_logged: Instant,
    suppressed: u64,
}

/// Keyed log throttler
pub struct LogThrottler {
    keys: Mutex<HashMap<String, KeyState>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `Some(suppressed)` when a line for `key` may be logged now,
    /// where `suppressed` is the number of lines dropped since the last one.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut keys = self.keys.lock();

        match keys.get_mut(key) {
            Some(state) if now.duration_since(state.last_logged) < self.interval => {
                state.suppressed += 1;
                None
            }
            Some(state) => {
                let suppressed = state.suppressed;
                state.last_logged = now;
                state.suppressed = 0;
                Some(suppressed)
            }
            None => {
                keys.insert(
                    key.to_string(),
                    KeyState {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Forget a key, e.g. when its stream is torn down
    pub fn clear(&self, key: &str) {
        self.keys.lock().remove(key);
    }

    /// Forget every key whose name starts with `prefix`
    pub fn clear_prefix(&self, prefix: &str) {
        self.keys.lock().retain(|k, _| !k.starts_with(prefix));
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `warn!`; appends the suppressed count when lines were dropped
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::warn!(suppressed, $($arg)*);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

/// Throttled `debug!`
#[macro_export]
macro_rules! debug_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::debug!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_call_passes() {
        let throttler = LogThrottler::with_secs(1);
        assert_eq!(throttler.check("decode:alice:camera"), Some(0));
    }

    #[test]
    fn test_suppressed_count_reported() {
        let throttler = LogThrottler::new(Duration::from_millis(50));

        assert!(throttler.should_log("k"));
        assert!(!throttler.should_log("k"));
        assert!(!throttler.should_log("k"));

        thread::sleep(Duration::from_millis(70));
        assert_eq!(throttler.check("k"), Some(2));
    }

    #[test]
    fn test_clear_prefix() {
        let throttler = LogThrottler::with_secs(10);
        throttler.check("decode:alice:camera");
        throttler.check("decode:alice:screen");
        throttler.check("decode:bob:camera");

        throttler.clear_prefix("decode:alice:");
        assert_eq!(throttler.len(), 1);
        assert!(throttler.should_log("decode:alice:camera"));
    }
}

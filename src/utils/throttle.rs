//! Rate limit for a warning that repeats in a tight loop
//!
//! A receive loop that keeps failing logs once per interval and reports how
//! many repeats it swallowed in between.

use std::time::{Duration, Instant};

/// Throttle owned by the loop that emits the warning
///
/// ```rust
/// use std::time::Duration;
/// use aawgd::utils::LogThrottle;
///
/// let mut throttle = LogThrottle::new(Duration::from_secs(5));
///
/// assert_eq!(throttle.admit(), Some(0));
/// assert_eq!(throttle.admit(), None);
/// ```
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// `Some(dropped)` when the message may be logged, `None` while throttled
    pub fn admit(&mut self) -> Option<u64> {
        let now = Instant::now();
        if let Some(last) = self.last {
            if now.duration_since(last) < self.interval {
                self.suppressed += 1;
                return None;
            }
        }
        self.last = Some(now);
        Some(std::mem::take(&mut self.suppressed))
    }
}

/// Warn through a [`LogThrottle`], attaching the count of dropped repeats
#[macro_export]
macro_rules! warn_throttled {
    ($throttle:expr, $($arg:tt)*) => {
        match $throttle.admit() {
            Some(0) => tracing::warn!($($arg)*),
            Some(suppressed) => tracing::warn!(suppressed, $($arg)*),
            None => {}
        }
    };
}

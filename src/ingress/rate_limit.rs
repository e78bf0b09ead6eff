use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-second token-bucket style limiter, windowed by wall-clock second rather
/// than a continuously-refilling bucket.
pub struct RateLimiter {
    limit_per_second: u32,
    window: Mutex<Window>,
}

struct Window {
    second: u64,
    count: u32,
}

impl RateLimiter {
    pub fn new(limit_per_second: u32) -> Self {
        Self {
            limit_per_second,
            window: Mutex::new(Window { second: current_second(), count: 0 }),
        }
    }

    /// Returns `true` if this call is admitted under the current second's budget.
    pub fn try_acquire(&self) -> bool {
        let mut window = self.window.lock().expect("rate limiter mutex poisoned");
        let now = current_second();
        if window.second != now {
            window.second = now;
            window.count = 0;
        }
        if window.count >= self.limit_per_second {
            false
        } else {
            window.count += 1;
            true
        }
    }
}

fn current_second() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock is before the unix epoch").as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_configured_limit_then_rejects() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }
}

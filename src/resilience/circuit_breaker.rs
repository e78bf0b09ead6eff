use std::sync::Mutex;
use std::time::{Duration, Instant};

/// `{closed | open | half_open, consecutiveFailures, openUntilMs}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// A single breaker instance, used independently for read-like (`pull`) and
/// write-like (`submit`) backend paths. Fail-fast calls never count toward
/// `consecutive_failures`.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_for: Duration,
    inner: Mutex<Inner>,
}

/// Returned when a call is rejected without being attempted.
#[derive(Debug, Clone, Copy)]
pub struct CircuitOpenError {
    pub retry_after_ms: u64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_for: Duration) -> Self {
        Self {
            failure_threshold,
            open_for,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                open_until: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("circuit breaker mutex poisoned").state
    }

    /// Call before attempting the guarded operation. Transitions `open` -> `half_open`
    /// when the cool-down has elapsed; otherwise fails fast.
    pub fn ensure_allowed(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let now = Instant::now();
                let open_until = inner.open_until.unwrap_or(now);
                if now >= open_until {
                    inner.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    let retry_after_ms = (open_until - now).as_millis() as u64;
                    Err(CircuitOpenError { retry_after_ms })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.open_until = Some(Instant::now() + self.open_for);
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.open_until = Some(Instant::now() + self.open_for);
                }
            }
            CircuitState::Open => {
                inner.open_until = Some(Instant::now() + self.open_for);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_open_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(50));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        let err = breaker.ensure_allowed().unwrap_err();
        assert!(err.retry_after_ms > 0);
    }

    #[test]
    fn half_open_success_closes_and_clears_failures() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(5));
        breaker.ensure_allowed().expect("cool-down elapsed");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_window() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        breaker.ensure_allowed().expect("cool-down elapsed");
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn fail_fast_does_not_count_toward_failure_streak() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        // Reject without attempting -- a caller-side fail-fast decision made
        // elsewhere must never call record_failure for a call that never ran.
        assert!(breaker.ensure_allowed().is_ok());
    }
}

use rand::Rng;

/// A fixed table of base delays `d_0, ..., d_{k-1}`. Attempt `i` uses
/// `d_{min(i, k-1)} + U[0, jitter)`. Deliberately table-driven rather than
/// exponential so operators can shape burst recovery independently of retry count.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    base_delays_ms: Vec<u64>,
    jitter_ms: u64,
}

impl BackoffSchedule {
    pub fn new(base_delays_ms: Vec<u64>, jitter_ms: u64) -> Self {
        assert!(!base_delays_ms.is_empty(), "backoff schedule needs at least one step");
        Self {
            base_delays_ms,
            jitter_ms,
        }
    }

    /// Default relay backend-submit schedule: 200ms, 500ms, 1s, 2s, 5s, +/- 100ms jitter.
    pub fn default_backend() -> Self {
        Self::new(vec![200, 500, 1_000, 2_000, 5_000], 100)
    }

    /// Default gateway chat-retry schedule: 250ms, 750ms, 1.5s, +/- 150ms jitter.
    pub fn default_chat() -> Self {
        Self::new(vec![250, 750, 1_500], 150)
    }

    pub fn delay_ms_for_attempt(&self, attempt: usize) -> u64 {
        let idx = attempt.min(self.base_delays_ms.len() - 1);
        let base = self.base_delays_ms[idx];
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        };
        base + jitter
    }
}

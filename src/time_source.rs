use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Platforms with 32-bit timer limits cap at roughly this many milliseconds.
/// `tokio::time` itself handles 64-bit durations fine on every platform we build
/// for, but callers may receive timeout values from an external, less careful
/// source (env vars, backend payloads), so we clamp here.
const MAX_TIMEOUT_MS: u64 = 2_100_000_000;

static CLAMP_WARNED: AtomicBool = AtomicBool::new(false);

/// Clamps a caller-supplied timeout to the platform-safe maximum, logging a warning
/// the first time a clamp actually happens.
pub fn clamp_timeout_ms(requested_ms: u64) -> u64 {
    if requested_ms > MAX_TIMEOUT_MS {
        if !CLAMP_WARNED.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                requested_ms,
                clamped_ms = MAX_TIMEOUT_MS,
                "timeout exceeds platform-safe maximum, clamping"
            );
        }
        MAX_TIMEOUT_MS
    } else {
        requested_ms
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_through_values_within_bound() {
        assert_eq!(clamp_timeout_ms(5_000), 5_000);
    }

    #[test]
    fn clamps_values_beyond_the_platform_maximum() {
        assert_eq!(clamp_timeout_ms(u64::MAX), MAX_TIMEOUT_MS);
    }
}

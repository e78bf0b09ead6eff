use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use super::backoff::BackoffSchedule;

/// Bounded retry loop around a fallible async body.
///
/// `should_retry` is consulted with the error and the zero-based attempt index that
/// just failed; returning `false`, or exhausting `attempts`, rethrows the last error.
/// Sleeps between attempts respect `deadline` so a caller-supplied timeout always
/// wins over the backoff schedule.
pub async fn retry<T, E, F, Fut>(
    attempts: usize,
    schedule: &BackoffSchedule,
    deadline: Option<Instant>,
    mut should_retry: impl FnMut(&E, usize) -> bool,
    mut on_retry: impl FnMut(&E, usize, u64),
    mut body: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    assert!(attempts >= 1, "attempts must be at least 1");
    let mut attempt = 0;
    loop {
        match body(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let is_last = attempt + 1 >= attempts;
                if is_last || !should_retry(&err, attempt) {
                    return Err(err);
                }
                let delay_ms = schedule.delay_ms_for_attempt(attempt);
                let delay = Duration::from_millis(delay_ms);
                if let Some(deadline) = deadline {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(err);
                    }
                    let remaining = deadline - now;
                    let sleep_for = delay.min(remaining);
                    on_retry(&err, attempt, sleep_for.as_millis() as u64);
                    tokio::time::sleep(sleep_for).await;
                } else {
                    on_retry(&err, attempt, delay_ms);
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_until_should_retry_returns_false() {
        let schedule = BackoffSchedule::new(vec![10], 0);
        let calls = AtomicUsize::new(0);
        let result: Result<(), &str> = retry(
            5,
            &schedule,
            None,
            |_, _| true,
            |_, _, _| {},
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err("transient")
                    } else {
                        Ok(())
                    }
                }
            },
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_stops_immediately() {
        let schedule = BackoffSchedule::new(vec![10], 0);
        let calls = AtomicUsize::new(0);
        let result: Result<(), &str> = retry(
            5,
            &schedule,
            None,
            |_, _| false,
            |_, _, _| {},
            |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err("fatal") }
            },
        )
        .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_attempts_returns_last_error() {
        let schedule = BackoffSchedule::new(vec![5], 0);
        let result: Result<(), &str> = retry(
            3,
            &schedule,
            None,
            |_, _| true,
            |_, _, _| {},
            |_attempt| async move { Err("still failing") },
        )
        .await;
        assert_eq!(result, Err("still failing"));
    }
}

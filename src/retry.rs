// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixed-interval retry combinator
//!
//! DNS propagation and certificate authority windows have roughly constant
//! retry economics, so attempts are spaced by a fixed interval. The sleep
//! happens only between attempts, never after the last one.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Outcome of one attempt that did not succeed
#[derive(Debug)]
pub enum Attempt<E> {
    /// Worth trying again after the interval
    Retry(E),
    /// Stop immediately; retrying cannot help
    Abort(E),
}

/// Why [`retry`] gave up
#[derive(Debug)]
pub struct RetryError<E> {
    /// Error from the last attempt
    pub last: E,
    /// Number of attempts made
    pub attempts: u32,
    /// Whether the last attempt aborted the loop
    pub aborted: bool,
}

/// Run `operation` up to `max_attempts` times, sleeping `interval` between
/// attempts. The closure receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(
    max_attempts: u32,
    interval: Duration,
    mut operation: F,
) -> Result<(T, u32), RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(Attempt::Abort(last)) => {
                return Err(RetryError {
                    last,
                    attempts: attempt,
                    aborted: true,
                })
            }
            Err(Attempt::Retry(last)) => {
                if attempt >= max_attempts {
                    return Err(RetryError {
                        last,
                        attempts: attempt,
                        aborted: false,
                    });
                }
                debug!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    interval_secs = interval.as_secs_f64(),
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(interval).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retries() {
        let start = Instant::now();
        let result: Result<(&str, u32), RetryError<&str>> =
            retry(5, Duration::from_secs(10), |n| async move {
                if n < 3 {
                    Err(Attempt::Retry("not yet"))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), ("done", 3));
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_without_trailing_sleep() {
        let start = Instant::now();
        let result: Result<((), u32), RetryError<u32>> =
            retry(3, Duration::from_secs(1), |n| async move { Err(Attempt::Retry(n)) }).await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last, 3);
        assert!(!err.aborted);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_immediately() {
        let result: Result<((), u32), RetryError<&str>> =
            retry(10, Duration::from_secs(60), |n| async move {
                if n == 2 {
                    Err(Attempt::Abort("rate limited"))
                } else {
                    Err(Attempt::Retry("transient"))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 2);
        assert!(err.aborted);
        assert_eq!(err.last, "rate limited");
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let result: Result<(u8, u32), RetryError<()>> =
            retry(0, Duration::from_secs(1), |_| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), (7, 1));
    }
}

//! Bounded-attempt retry with exponential backoff, grounded on
//! `api::client::HttpClient::calculate_backoff` and generalized into a
//! standalone helper so the orchestrator's readiness waits, the proxy sink's
//! reload protocol, and the scheduler's dispatch calls can all share it.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("exhausted {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

/// Retries `op` up to `attempts` times (the first call counts as attempt 1),
/// sleeping `interval` between tries. Unlike a true exponential backoff this
/// keeps the interval fixed per call site, matching the spec's
/// "bounded attempts x interval" phrasing used throughout §4 (readiness
/// wait, DNS wait, proxy reload).
pub async fn retry_with_backoff<T, E, F, Fut>(
    label: &str,
    attempts: u32,
    interval: Duration,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(label, attempt, attempts, "attempt failed, will retry");
                last_err = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
    debug!(label, attempts, "retry budget exhausted");
    Err(RetryError::Exhausted {
        attempts,
        last: last_err.expect("attempts >= 1 guarantees at least one error recorded"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_before_exhausting_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result = retry_with_backoff("test", 5, Duration::from_millis(1), move || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err("not yet")
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test]
    async fn reports_exhaustion() {
        let result: Result<(), RetryError<&str>> =
            retry_with_backoff("test", 3, Duration::from_millis(1), || async { Err("nope") }).await;
        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            Ok(_) => panic!("expected exhaustion"),
        }
    }
}

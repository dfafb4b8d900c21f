//! Bounded retry for optimistic-concurrency conflicts.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Sleep before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 5, backoff: Duration::from_millis(10) }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error; `last` is the final one.
    Exhausted { attempts: u32, last: E },
    /// A non-retryable error; returned as soon as it happens.
    Failed(E),
    Cancelled,
}

/// Run `op` until it succeeds, fails with an error `is_retryable` rejects, or
/// the attempt budget runs out. `op` must be safe to repeat: each attempt
/// re-reads whatever it writes.
pub async fn retry_on<T, E, F, Fut, P>(
    policy: RetryPolicy,
    token: &CancellationToken,
    is_retryable: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let res = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(RetryError::Cancelled),
            r = op() => r,
        };
        match res {
            Ok(v) => return Ok(v),
            Err(e) if !is_retryable(&e) => return Err(RetryError::Failed(e)),
            Err(e) if attempt >= attempts => return Err(RetryError::Exhausted { attempts: attempt, last: e }),
            Err(_) => {
                counter!("converge_conflict_retries", 1u64);
                debug!(attempt, "retrying after conflict");
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(policy.backoff * attempt) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy { attempts, backoff: Duration::from_millis(1) }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let c = &calls;
        let token = CancellationToken::new();
        let out = retry_on(fast(5), &token, |e: &&str| *e == "conflict", || async move {
            if c.fetch_add(1, Ordering::SeqCst) < 2 { Err("conflict") } else { Ok(7) }
        })
        .await;
        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_exhaustion_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let c = &calls;
        let token = CancellationToken::new();
        let out: Result<(), _> = retry_on(fast(3), &token, |_: &&str| true, || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Err("conflict")
        })
        .await;
        assert_eq!(out, Err(RetryError::Exhausted { attempts: 3, last: "conflict" }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let c = &calls;
        let token = CancellationToken::new();
        let out: Result<(), _> = retry_on(fast(5), &token, |e: &&str| *e == "conflict", || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Err("fatal")
        })
        .await;
        assert_eq!(out, Err(RetryError::Failed("fatal")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_attempt() {
        let calls = AtomicU32::new(0);
        let c = &calls;
        let token = CancellationToken::new();
        token.cancel();
        let out: Result<(), RetryError<&str>> = retry_on(fast(5), &token, |_| true, || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
        assert_eq!(out, Err(RetryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

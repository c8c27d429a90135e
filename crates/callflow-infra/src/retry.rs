//! Bounded fixed-delay retry.
//!
//! Transient control-protocol failures (the PBX reporting a resource
//! allocation failure under load) are retried a small, bounded number
//! of times with a fixed delay. The outcome is typed: callers see
//! whether the operation completed, exhausted its attempts on a
//! transient error, or aborted on a non-transient one. There is no
//! open-ended rescheduling.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Result of a bounded retry loop.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded within the attempt budget.
    Completed(T),
    /// Every attempt failed with a transient error.
    Exhausted(E),
    /// The operation failed with an error the caller marked non-transient;
    /// no further attempts were made.
    Aborted(E),
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_completed(&self) -> bool {
        matches!(self, RetryOutcome::Completed(_))
    }
}

/// Run `op` until it succeeds, it fails non-transiently, or
/// `max_attempts` transient failures have been observed.
///
/// `is_transient` classifies errors; a non-transient error aborts
/// immediately. The delay is applied between attempts, not after the
/// last one.
pub async fn retry_fixed<T, E, F, Fut, P>(
    max_attempts: u32,
    delay: Duration,
    is_transient: P,
    mut op: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = max_attempts.max(1);
    let mut last_err: Option<E> = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("Operation succeeded on attempt {}/{}", attempt, attempts);
                }
                return RetryOutcome::Completed(value);
            }
            Err(e) if is_transient(&e) => {
                warn!("Transient failure on attempt {}/{}: {}", attempt, attempts, e);
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => {
                debug!("Non-transient failure, aborting retry: {}", e);
                return RetryOutcome::Aborted(e);
            }
        }
    }

    // attempts >= 1, so last_err is set when we fall through.
    RetryOutcome::Exhausted(last_err.expect("at least one attempt was made"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Transient,
        Fatal,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn transient(e: &TestError) -> bool {
        matches!(e, TestError::Transient)
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let outcome = retry_fixed(5, Duration::from_millis(1), transient, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert!(matches!(outcome, RetryOutcome::Completed(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempt_budget() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<(), _> =
            retry_fixed(3, Duration::from_millis(1), transient, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Transient) }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Exhausted(TestError::Transient)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_aborts_immediately() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<(), _> =
            retry_fixed(5, Duration::from_millis(1), transient, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Fatal) }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Aborted(TestError::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

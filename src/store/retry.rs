use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{CouncilError, CouncilResult};

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds or attempts run out. Only transport
    /// failures are retried; cancellation cuts the backoff short.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> CouncilResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CouncilResult<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut delay = self.initial_delay;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transport() && attempt < attempts => {
                    tracing::warn!(what, attempt, error = %e, "retrying after failure");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CouncilError::Interrupted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let value = fast()
            .run("embed", &CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CouncilError::Provider("rate limited".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let calls = AtomicUsize::new(0);
        let err = fast()
            .run("embed", &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CouncilError::Provider("down".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CouncilError::Provider(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn storage_failure_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let err = fast()
            .run("embed", &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CouncilError::Storage("disk full".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CouncilError::Storage(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_secs(60),
        };
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = policy
            .run("embed", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CouncilError::Provider("rate limited".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CouncilError::Interrupted));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn interruption_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let err = fast()
            .run("embed", &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CouncilError::Interrupted)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CouncilError::Interrupted));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

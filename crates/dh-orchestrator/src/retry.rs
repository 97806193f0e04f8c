//! Retry-once policy for transient failures
//!
//! Caller-facing operations retry helper timeouts and proxy reload failures
//! exactly once before surfacing them. Everything else surfaces immediately.

use std::future::Future;
use std::time::Duration;

use dh_core::{DevhostError, Result};

/// Pause between the first failure and the retry
pub const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Run `op`, and run it once more if the first attempt failed transiently
pub async fn retry_once<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            tracing::warn!("{} failed ({}), retrying once", what, e);
            tokio::time::sleep(RETRY_DELAY).await;
            op().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_transient_failure_is_retried_once() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_once("reload", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DevhostError::ProxyReloadFailed("busy".into()))
        })
        .await;

        assert!(matches!(result, Err(DevhostError::ProxyReloadFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_attempt_can_succeed() {
        let calls = AtomicUsize::new(0);
        let result = retry_once("helper", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(DevhostError::HelperTimeout(Duration::from_secs(1)))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_once("helper", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DevhostError::HelperUnavailable("no socket".into()))
        })
        .await;
        assert!(matches!(result, Err(DevhostError::HelperUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

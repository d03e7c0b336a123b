//! Bounded and panic-safe execution helpers.

use crate::errors::{FlowgateError, Result};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

/// Runs `fut`, failing with [`FlowgateError::Timeout`] after `timeout`.
pub async fn run_with_timeout<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, timeout_ms = %timeout.as_millis(), "operation timed out");
            Err(FlowgateError::timeout(operation, timeout))
        }
    }
}

/// Converts a panic inside `fut` into [`FlowgateError::Internal`].
pub async fn catch_panic<T, F>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(panic = %message, "task panicked");
            Err(FlowgateError::Internal(format!("panicked: {message}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[tokio::test]
    async fn test_run_with_timeout_passes_through() {
        let value = run_with_timeout("fast", Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_with_timeout_expires() {
        let err = run_with_timeout("slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("slow"));
    }

    #[tokio::test]
    async fn test_catch_panic() {
        let fail = true;
        let err = catch_panic(async move {
            assert!(!fail, "engine exploded");
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("engine exploded"));
    }
}

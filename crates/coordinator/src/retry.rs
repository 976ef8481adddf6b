//! Retry with exponential backoff, deadline and cancellation

use crate::config::RetryConfig;
use std::fmt::Display;
use std::future::Future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a retried operation stopped without succeeding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The cancellation token fired; outstanding work was dropped
    Cancelled,
    /// The deadline passed; carries the last retriable error, if any
    DeadlineExceeded(Option<E>),
    /// The operation failed with an error that is not retried
    Failed(E),
}

/// Run `operation` until it succeeds, fails permanently, hits `deadline`, or
/// `cancel` fires.
///
/// Only errors for which `is_retriable` returns true are retried. Without a
/// deadline, retriable errors are retried until cancellation. An attempt still
/// in flight when the deadline passes or the token fires is dropped.
pub async fn with_retry<T, E, F, Fut>(
    retry: &RetryConfig,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    is_retriable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = expires(deadline) => return Err(RetryError::DeadlineExceeded(None)),
            result = operation() => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) if !is_retriable(&error) => return Err(RetryError::Failed(error)),
            Err(error) => error,
        };

        let delay = retry.delay(attempt);
        if let Some(deadline) = deadline
            && Instant::now() + delay >= deadline
        {
            return Err(RetryError::DeadlineExceeded(Some(error)));
        }

        tracing::warn!(
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying operation"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt = attempt.saturating_add(1);
    }
}

async fn expires(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn retry() -> RetryConfig {
        RetryConfig::default()
            .with_initial_backoff(Duration::from_millis(10))
            .with_max_backoff(Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, RetryError<String>> = with_retry(
            &retry(),
            &CancellationToken::new(),
            None,
            |_| true,
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 3 { Err(format!("attempt {}", n)) } else { Ok(n) }
            },
        )
        .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), RetryError<String>> = with_retry(
            &retry(),
            &CancellationToken::new(),
            None,
            |e: &String| e != "fatal",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("fatal".to_string())
            },
        )
        .await;

        assert_eq!(result, Err(RetryError::Failed("fatal".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_retrying() {
        let deadline = Instant::now() + Duration::from_millis(250);
        let result: Result<(), RetryError<String>> = with_retry(
            &retry(),
            &CancellationToken::new(),
            Some(deadline),
            |_| true,
            || async { Err("unreachable".to_string()) },
        )
        .await;

        assert_eq!(
            result,
            Err(RetryError::DeadlineExceeded(Some("unreachable".to_string())))
        );
        assert!(Instant::now() <= deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_hanging_attempt() {
        let deadline = Instant::now() + Duration::from_millis(100);
        let result: Result<(), RetryError<String>> = with_retry(
            &retry(),
            &CancellationToken::new(),
            Some(deadline),
            |_| true,
            || std::future::pending(),
        )
        .await;

        assert_eq!(result, Err(RetryError::DeadlineExceeded(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_pending_operation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result: Result<(), RetryError<String>> = with_retry(
            &retry(),
            &cancel,
            None,
            |_| true,
            || std::future::pending(),
        )
        .await;

        assert_eq!(result, Err(RetryError::Cancelled));
    }
}

//! Database retry logic
//!
//! Retries operations that fail with SQLite lock contention. Several source
//! pipelines write concurrently, so short "database is locked" windows are
//! expected under WAL even with a busy timeout.

use futures::future::BoxFuture;
use std::time::{Duration, Instant};
use kgdb_common::{Error, Result};

/// Default upper bound on time spent retrying one operation
pub const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5_000;

const INITIAL_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 1_000;

/// Retry a database operation with exponential backoff until `max_wait_ms` elapses.
///
/// Only lock contention is retried; any other error is returned immediately.
/// Backoff starts at 10ms and doubles up to 1s. Each attempt is a boxed
/// `Send` future so callers stay spawnable.
pub async fn retry_on_lock<'a, F, T>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> BoxFuture<'a, Result<T>>,
{
    let start_time = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt = 0u32;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    let elapsed_ms = start_time.elapsed().as_millis();
                    if elapsed_ms > 2_000 {
                        tracing::warn!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms,
                            "Database operation succeeded after significant retry period"
                        );
                    } else {
                        tracing::debug!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms,
                            "Database operation succeeded after retry"
                        );
                    }
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_lock_contention() {
                    return Err(err);
                }

                let elapsed = start_time.elapsed();
                if elapsed >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis(),
                        max_wait_ms,
                        "Database operation failed: max retry time exceeded"
                    );
                    return Err(Error::Internal(format!(
                        "{}: database locked after {} attempts ({} ms elapsed)",
                        operation_name,
                        attempt,
                        elapsed.as_millis()
                    )));
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms,
                    "Database locked, will retry after backoff"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

/// `retry_on_lock` with the default wait budget
pub async fn retry_on_lock_default<'a, F, T>(operation_name: &str, operation: F) -> Result<T>
where
    F: FnMut() -> BoxFuture<'a, Result<T>>,
{
    retry_on_lock(operation_name, DEFAULT_MAX_LOCK_WAIT_MS, operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_attempt_success() {
        let result = retry_on_lock("noop", 100, || async { Ok::<_, Error>(7) }.boxed()).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = retry_on_lock("fails", 1_000, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::InvalidInput("bad".to_string()))
            }
            .boxed()
        })
        .await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

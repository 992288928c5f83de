//! Bounded retry of transient repository failures

use std::future::Future;
use tokio::time::Instant;

use docbatch_core::{RepositoryError, RetryPolicy};

/// Result of a retried call together with the attempts it took
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, RepositoryError>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails permanently, exhausts the policy, or
/// the next backoff would cross `deadline`
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, deadline: Option<Instant>, mut op: F) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RepositoryError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        let err = match op().await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts,
                }
            }
            Err(err) => err,
        };

        if !err.is_transient() || attempts >= policy.max_attempts {
            return Attempted {
                result: Err(err),
                attempts,
            };
        }

        let backoff = policy.backoff(attempts);
        if deadline.is_some_and(|deadline| Instant::now() + backoff >= deadline) {
            tracing::debug!(attempts, "retry budget crosses deadline");
            return Attempted {
                result: Err(err),
                attempts,
            };
        }

        tracing::debug!(attempts, backoff_ms = backoff.as_millis(), error = %err, "retrying transient failure");
        tokio::time::sleep(backoff).await;
    }
}

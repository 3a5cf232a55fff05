use std::future::Future;

use tracing::{debug, warn};

use ipxarray::{Error, Result};

use crate::config::RetryPolicy;

/// Run `attempt` until it succeeds, fails for good, or runs out of attempts.
///
/// Only transient errors are retried. When the attempts run out the last transient error is
/// reported as `FetchFailed` with the number of attempts made.
///
pub(crate) async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) if attempts >= max_attempts => {
                warn!(what, attempts, %err, "giving up");
                return Err(Error::FetchFailed {
                    attempts,
                    reason: reason(err),
                });
            }
            Err(err) => {
                let delay = policy.delay(attempts);
                debug!(what, attempts, ?delay, %err, "retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn reason(err: Error) -> String {
    match err {
        Error::FetchFailed { reason, .. } => reason,
        err => err.to_string(),
    }
}

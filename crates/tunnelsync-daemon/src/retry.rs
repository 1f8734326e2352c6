//! Fixed-delay retry executor.

use tokio::time::sleep;
use tracing::warn;

pub use tunnelsync_core::RetryPolicy;

/// Run `operation` until it succeeds or `policy.max_attempts` attempts fail.
///
/// Attempts are strictly sequential with `policy.delay` between them; there
/// is no delay after the final attempt. On exhaustion the error of the last
/// attempt is returned.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(policy, operation, |_| true).await
}

/// Like [`retry`], but errors for which `is_transient` returns `false` are
/// returned immediately without consuming the remaining attempts.
pub async fn retry_if<T, E, F, Fut, P>(
    policy: RetryPolicy,
    mut operation: F,
    is_transient: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !is_transient(&e) => return Err(e),
            Err(e) if attempt >= max_attempts => {
                warn!(error = %e, attempt, max_attempts, "All attempts failed");
                return Err(e);
            }
            Err(e) => {
                warn!(
                    error = %e,
                    attempt,
                    max_attempts,
                    delay_ms = policy.delay_ms,
                    "Attempt failed, retrying"
                );
                sleep(policy.delay()).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

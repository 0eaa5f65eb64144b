//! Bounded fixed-interval polling.

use crate::config::RetryPolicy;
use crate::utils::Result;
use std::future::Future;
use tracing::debug;

/// Call `probe` until it succeeds or `policy.attempts` calls have failed,
/// sleeping `policy.interval()` between attempts. Returns the attempt that
/// succeeded.
pub async fn poll<F, Fut>(policy: RetryPolicy, what: &str, mut probe: F) -> Option<u32>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    for attempt in 1..=policy.attempts {
        match probe().await {
            Ok(()) => return Some(attempt),
            Err(e) => debug!("{} not ready (attempt {}/{}): {}", what, attempt, policy.attempts, e),
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval()).await;
        }
    }
    None
}

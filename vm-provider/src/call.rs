//! Retry discipline for gateway calls.
//!
//! Read-only calls (resolution, tree reads, grant reads) are retried a bounded
//! number of times on `GatewayUnavailable`. Mutating calls run exactly once:
//! a retry could double-apply a destructive action.

use std::future::Future;
use tracing::warn;
use vm_config::RetryPolicy;
use vm_core::error::Result;

use crate::context::CallContext;

/// Run a read-only gateway call with bounded exponential backoff.
pub async fn read_with_retry<T, F, Fut>(
    ctx: &CallContext,
    retry: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match ctx.guard(operation, call()).await {
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = retry.backoff(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying read-only gateway call"
                );
                ctx.guard(operation, async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Run a mutating gateway call once, bounded by the context.
pub async fn mutate<T, Fut>(ctx: &CallContext, operation: &str, call: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    ctx.guard(operation, call).await
}

//! Retry with bounded backoff for transient device errors.

use std::future::Future;
use std::time::Duration;

use crate::error::{DeviceError, DeviceResult};

/// Runs `operation`, retrying retryable failures once per entry in `delays`.
///
/// Non-retryable errors (`ConfigurationError`, `InvalidArgument`, ...) are
/// returned immediately. After the last delay the most recent error is
/// returned.
pub(crate) async fn with_retry<T, F, Fut>(
    label: &str,
    delays: &[Duration],
    mut operation: F,
) -> DeviceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DeviceResult<T>>,
{
    let mut last_error = None;
    for (attempt, &delay) in std::iter::once(&Duration::ZERO)
        .chain(delays.iter())
        .enumerate()
    {
        if attempt > 0 {
            log::info!(
                "[Registry] Retrying {} (attempt {}/{}) after {}ms",
                label,
                attempt + 1,
                delays.len() + 1,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                log::warn!("[Registry] {} transient error: {}", label, e);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error
        .unwrap_or_else(|| DeviceError::DeviceUnreachable(format!("{label}: no attempt made"))))
}

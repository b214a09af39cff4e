use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Polls `predicate` every `interval` until it returns true or `timeout`
/// elapses. Returns whether the predicate was satisfied; the timeout is
/// advisory and callers typically proceed regardless.
pub async fn poll_until<F, Fut>(interval: Duration, timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if Instant::now() + interval > deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

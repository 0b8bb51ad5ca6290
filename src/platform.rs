use std::{future::Future, time::Duration};

#[inline]
pub fn spawn<O, F>(future: F) -> tokio::task::JoinHandle<O>
where
    O: Send + 'static,
    F: Future<Output = O> + Send + 'static,
{
    tokio::spawn(future)
}

/// Hands control back to the scheduler once.
#[inline]
pub async fn yield_now() {
    tokio::task::yield_now().await
}

/// Polls `check` until it returns `true`, yielding between checks.
pub async fn poll_until(mut check: impl FnMut() -> bool) {
    while !check() {
        yield_now().await;
    }
}

/// Runs `future` to completion, or gives up after `timeout`. Returns `None` on timeout.
pub async fn deadline<F: Future>(timeout: Option<Duration>, future: F) -> Option<F::Output> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, future).await.ok(),
        None => Some(future.await),
    }
}

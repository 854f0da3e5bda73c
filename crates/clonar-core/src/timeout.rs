//! Uniform timeout wrapper for every awaited external call.
//!
//! Callers never see an error from a slow dependency: they get a `Timed`
//! value and pick a neutral fallback.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Outcome of racing a future against a time budget and an abort signal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Timed<T> {
    Completed(T),
    TimedOut(Duration),
    Cancelled,
}

/// Race `fut` against `budget` and `cancel`. Cancellation wins ties.
pub async fn race<F>(budget: Duration, cancel: &CancellationToken, fut: F) -> Timed<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Timed::Cancelled,
        result = tokio::time::timeout(budget, fut) => match result {
            Ok(v) => Timed::Completed(v),
            Err(_) => Timed::TimedOut(budget),
        },
    }
}

/// Race `fut` against `budget` only.
pub async fn within<F>(budget: Duration, fut: F) -> Timed<F::Output>
where
    F: Future,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(v) => Timed::Completed(v),
        Err(_) => Timed::TimedOut(budget),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn completes_within_budget() {
        let cancel = CancellationToken::new();
        let out = race(Duration::from_secs(1), &cancel, async { 7 }).await;
        assert_eq!(out, Timed::Completed(7));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_future_times_out() {
        let out = within(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            1
        })
        .await;
        assert_eq!(out, Timed::TimedOut(Duration::from_millis(50)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = race(Duration::from_secs(5), &cancel, async { 1 }).await;
        assert_eq!(out, Timed::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_flight() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let out = race(Duration::from_secs(5), &cancel, async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            1
        })
        .await;
        assert_eq!(out, Timed::Cancelled);
    }
}

// ── Bounded dispatch ──
//
// Client-side timeouts that never cancel the provider call. When the bound
// elapses the caller gets the still-running future back and decides how
// long to keep driving it.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub(crate) enum Bounded<F: Future> {
    Completed(F::Output),
    /// The bound elapsed; the call is still pending.
    TimedOut(Pin<Box<F>>),
}

/// Poll `fut` for at most `limit`.
pub(crate) async fn bounded<F: Future>(limit: Duration, fut: F) -> Bounded<F> {
    let mut fut = Box::pin(fut);
    match tokio::time::timeout(limit, &mut fut).await {
        Ok(output) => Bounded::Completed(output),
        Err(_) => Bounded::TimedOut(fut),
    }
}

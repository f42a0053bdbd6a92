//! Cooperative yield.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

struct YieldNow(bool);

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.0 {
            Poll::Ready(())
        } else {
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Relinquish the cpu and reschedule the current task at the back of the
/// run queue.
///
/// # Examples
///
/// ```
/// ksched::task::spawn(async {
///     ksched::task::yield_now().await;
/// }).expect("oom");
/// ksched::task::run_all();
/// ```
pub async fn yield_now() {
    YieldNow(false).await
}

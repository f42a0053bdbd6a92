//! Post-and-acknowledge mechanism.
//!
//! A [`PostAckMechanism`] fans an item out to every attached
//! [`PostAckAgent`]. The future returned by [`PostAckMechanism::post`]
//! completes only after each agent that was attached at post time has seen
//! the item and acknowledged it, which gives posters implicit backpressure:
//! a slow consumer stalls the producer rather than losing items.
//!
//! Agents consume items in posting order through [`PostAckAgent::poll`],
//! which honours a [`CancelToken`]. A cancelled poll never consumes an item;
//! the next poll still observes it.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use crate::cancel::CancelToken;
use crate::sync::Spinlock;

struct ItemState {
    remaining: usize,
    waker: Option<Waker>,
}

struct Item<T> {
    seq: u64,
    value: T,
    state: Spinlock<ItemState>,
}

struct MechInner<T> {
    items: VecDeque<Arc<Item<T>>>,
    next_seq: u64,
    agents: usize,
    poll_wakers: Vec<Waker>,
}

struct Shared<T> {
    inner: Spinlock<MechInner<T>>,
}

/// Fan-out mechanism with acknowledgement-based completion.
///
/// # Examples
///
/// ```
/// use ksched::postack::PostAckMechanism;
///
/// let mech: PostAckMechanism<u32> = PostAckMechanism::new();
/// // With no attached agents a post completes immediately.
/// ksched::task::spawn(async move {
///     mech.post(7).await;
/// })
/// .unwrap();
/// ksched::task::run_all();
/// ```
pub struct PostAckMechanism<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + Sync> PostAckMechanism<T> {
    /// Creates an empty mechanism with no attached agents.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Spinlock::new(MechInner {
                    items: VecDeque::new(),
                    next_seq: 0,
                    agents: 0,
                    poll_wakers: Vec::new(),
                }),
            }),
        }
    }

    /// Posts an item to every currently attached agent.
    ///
    /// The item is enqueued before this function returns; the returned
    /// future resolves once all of those agents have acknowledged it. If no
    /// agent is attached, the returned future is immediately ready.
    pub fn post(&self, value: T) -> PostFuture<T> {
        let mut g = self.shared.inner.lock();
        if g.agents == 0 {
            return PostFuture { item: None };
        }
        let item = Arc::new(Item {
            seq: g.next_seq,
            value,
            state: Spinlock::new(ItemState {
                remaining: g.agents,
                waker: None,
            }),
        });
        g.next_seq += 1;
        g.items.push_back(item.clone());
        let wakers = core::mem::take(&mut g.poll_wakers);
        drop(g);
        for w in wakers {
            w.wake();
        }
        PostFuture { item: Some(item) }
    }
}

impl<T: Send + Sync> Default for PostAckMechanism<T> {
    fn default() -> Self {
        PostAckMechanism::new()
    }
}

/// Future returned by [`PostAckMechanism::post`].
#[must_use = "the post is not complete until this future resolves"]
pub struct PostFuture<T> {
    item: Option<Arc<Item<T>>>,
}

impl<T> Future for PostFuture<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let item = match &self.item {
            None => return Poll::Ready(()),
            Some(item) => item,
        };
        let mut st = item.state.lock();
        if st.remaining == 0 {
            Poll::Ready(())
        } else {
            st.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// A consumer attached to a [`PostAckMechanism`].
///
/// An agent observes every item posted after it attached, in order. Each
/// observed item must be acknowledged through the yielded
/// [`PostAckHandle`]; detaching acknowledges anything still pending so a
/// departing consumer cannot stall posters forever.
pub struct PostAckAgent<T> {
    state: Spinlock<AgentState<T>>,
}

struct AgentState<T> {
    shared: Option<Arc<Shared<T>>>,
    next_seq: u64,
}

impl<T> PostAckAgent<T> {
    /// Creates a detached agent.
    pub const fn new() -> Self {
        Self {
            state: Spinlock::new(AgentState {
                shared: None,
                next_seq: 0,
            }),
        }
    }

    /// Attaches to a mechanism. The agent sees only items posted from now on.
    pub fn attach(&self, mech: &PostAckMechanism<T>) {
        let mut st = self.state.lock();
        debug_assert!(st.shared.is_none());
        let mut g = mech.shared.inner.lock();
        g.agents += 1;
        st.next_seq = g.next_seq;
        drop(g);
        st.shared = Some(mech.shared.clone());
    }

    /// Detaches from the mechanism, acknowledging every item this agent has
    /// not yet acknowledged.
    pub fn detach(&self) {
        let mut st = self.state.lock();
        let shared = match st.shared.take() {
            None => return,
            Some(s) => s,
        };
        let next_seq = st.next_seq;
        drop(st);
        let mut wakers = Vec::new();
        let mut g = shared.inner.lock();
        g.agents -= 1;
        g.items.retain(|item| {
            if item.seq < next_seq {
                return true;
            }
            let mut is = item.state.lock();
            is.remaining -= 1;
            if is.remaining == 0 {
                if let Some(w) = is.waker.take() {
                    wakers.push(w);
                }
                false
            } else {
                true
            }
        });
        drop(g);
        for w in wakers {
            w.wake();
        }
    }

    /// Whether this agent is currently attached.
    pub fn is_attached(&self) -> bool {
        self.state.lock().shared.is_some()
    }

    /// Waits for the next item this agent has not yet observed.
    ///
    /// Resolves to `None` if the token is cancelled or the agent is
    /// detached; the item, if any, stays queued for a later poll.
    pub fn poll<'a>(&'a self, token: &'a CancelToken) -> PollFuture<'a, T> {
        PollFuture { agent: self, token }
    }
}

impl<T> Default for PostAckAgent<T> {
    fn default() -> Self {
        PostAckAgent::new()
    }
}

impl<T> Drop for PostAckAgent<T> {
    /// A dropped agent can no longer acknowledge; detach so posters do not
    /// wait for it forever.
    fn drop(&mut self) {
        self.detach();
    }
}

/// Future returned by [`PostAckAgent::poll`].
#[must_use = "polls do nothing unless awaited"]
pub struct PollFuture<'a, T> {
    agent: &'a PostAckAgent<T>,
    token: &'a CancelToken,
}

impl<'a, T: Send + Sync> Future for PollFuture<'a, T> {
    type Output = Option<PostAckHandle<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.token.is_cancelled() {
            return Poll::Ready(None);
        }
        let mut st = self.agent.state.lock();
        let shared = match &st.shared {
            None => return Poll::Ready(None),
            Some(s) => s.clone(),
        };
        let mut g = shared.inner.lock();
        let found = g
            .items
            .iter()
            .find(|item| item.seq >= st.next_seq)
            .cloned();
        if let Some(item) = found {
            st.next_seq = item.seq + 1;
            drop(g);
            drop(st);
            return Poll::Ready(Some(PostAckHandle {
                shared,
                item,
                acked: false,
            }));
        }
        g.poll_wakers.push(cx.waker().clone());
        drop(g);
        drop(st);
        self.token.register(cx.waker());
        if self.token.is_cancelled() {
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}

/// Handle on one observed item.
///
/// Dropping the handle acknowledges the item as well; [`ack`](Self::ack)
/// makes the acknowledgement explicit at the point the local work is done.
pub struct PostAckHandle<T> {
    shared: Arc<Shared<T>>,
    item: Arc<Item<T>>,
    acked: bool,
}

impl<T> PostAckHandle<T> {
    /// The posted value.
    pub fn value(&self) -> &T {
        &self.item.value
    }

    /// Acknowledges the item, allowing the post to complete once every
    /// other agent has acknowledged as well.
    pub fn ack(mut self) {
        self.ack_impl();
    }

    fn ack_impl(&mut self) {
        if self.acked {
            return;
        }
        self.acked = true;
        let mut g = self.shared.inner.lock();
        let waker = {
            let mut is = self.item.state.lock();
            is.remaining -= 1;
            if is.remaining == 0 {
                is.waker.take()
            } else {
                drop(is);
                drop(g);
                return;
            }
        };
        if let Some(pos) = g.items.iter().position(|i| Arc::ptr_eq(i, &self.item)) {
            g.items.remove(pos);
        }
        drop(g);
        if let Some(w) = waker {
            w.wake();
        }
    }
}

impl<T> Drop for PostAckHandle<T> {
    fn drop(&mut self) {
        self.ack_impl();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use crate::task;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn post_without_agents_is_immediate() {
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let mech: PostAckMechanism<u32> = PostAckMechanism::new();
        task::spawn(async move {
            mech.post(1).await;
            done2.store(true, Ordering::SeqCst);
        })
        .unwrap();
        task::run_all();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn post_waits_for_every_agent() {
        let mech: Arc<PostAckMechanism<u32>> = Arc::new(PostAckMechanism::new());
        let a = Arc::new(PostAckAgent::new());
        let b = Arc::new(PostAckAgent::new());
        a.attach(&mech);
        b.attach(&mech);

        let done = Arc::new(AtomicBool::new(false));
        let acked = Arc::new(AtomicUsize::new(0));

        let post_mech = mech.clone();
        let post_done = done.clone();
        let post_acked = acked.clone();
        task::spawn(async move {
            post_mech.post(42).await;
            // Both agents must have acknowledged by now.
            assert_eq!(post_acked.load(Ordering::SeqCst), 2);
            post_done.store(true, Ordering::SeqCst);
        })
        .unwrap();

        for agent in [a, b] {
            let acked = acked.clone();
            task::spawn(async move {
                let token = CancelToken::never();
                let handle = agent.poll(&token).await.unwrap();
                assert_eq!(*handle.value(), 42);
                acked.fetch_add(1, Ordering::SeqCst);
                handle.ack();
                agent.detach();
            })
            .unwrap();
        }

        task::run_all();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn detach_acknowledges_pending() {
        let mech: Arc<PostAckMechanism<u32>> = Arc::new(PostAckMechanism::new());
        let agent = Arc::new(PostAckAgent::new());
        agent.attach(&mech);

        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let post_mech = mech.clone();
        task::spawn(async move {
            post_mech.post(5).await;
            done2.store(true, Ordering::SeqCst);
        })
        .unwrap();

        let leaver = agent.clone();
        task::spawn(async move {
            leaver.detach();
        })
        .unwrap();

        task::run_all();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn cancelled_poll_does_not_lose_items() {
        let mech: Arc<PostAckMechanism<u32>> = Arc::new(PostAckMechanism::new());
        let agent = Arc::new(PostAckAgent::new());
        agent.attach(&mech);

        let src = CancelSource::new();
        src.cancel();
        let cancelled = src.token();

        let mech2 = mech.clone();
        let agent2 = agent.clone();
        task::spawn(async move {
            let post = mech2.post(9);
            // A cancelled poll returns None without consuming the item.
            assert!(agent2.poll(&cancelled).await.is_none());
            // A live poll still sees it.
            let token = CancelToken::never();
            let handle = agent2.poll(&token).await.unwrap();
            assert_eq!(*handle.value(), 9);
            handle.ack();
            post.await;
            agent2.detach();
        })
        .unwrap();
        task::run_all();
    }
}

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// A FIFO queue of suspended callers.
///
/// `wait` appends a waiter, `notify` wakes the oldest live one, and
/// `notify_all` wakes every waiter queued at the time of the call.
#[derive(Default)]
pub struct Condition {
    queue: Mutex<VecDeque<oneshot::Sender<()>>>,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the queue. The returned [`Waiter`] resolves once notified.
    pub fn wait(&self) -> Waiter {
        let (sender, receiver) = oneshot::channel();
        self.queue.lock().push_back(sender);
        Waiter {
            receiver,
            observed: false,
        }
    }

    /// Wake the longest-waiting caller.
    ///
    /// Waiters that were dropped before being notified are skipped. Returns
    /// whether anyone was woken.
    pub fn notify(&self) -> bool {
        let mut queue = self.queue.lock();
        while let Some(sender) = queue.pop_front() {
            if sender.send(()).is_ok() {
                return true;
            }
        }
        false
    }

    /// Wake everyone currently queued. Returns how many were woken.
    pub fn notify_all(&self) -> usize {
        let drained: Vec<_> = self.queue.lock().drain(..).collect();
        drained
            .into_iter()
            .map(|sender| sender.send(()).is_ok())
            .filter(|woken| *woken)
            .count()
    }

    /// Number of live waiters.
    pub fn waiters(&self) -> usize {
        self.queue
            .lock()
            .iter()
            .filter(|sender| !sender.is_closed())
            .count()
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("waiters", &self.waiters())
            .finish()
    }
}

/// A queued [`Condition`] waiter.
///
/// Dropping it before it is notified removes it from the line.
#[must_use = "waiters do nothing unless awaited"]
#[derive(Debug)]
pub struct Waiter {
    receiver: oneshot::Receiver<()>,
    observed: bool,
}

impl Waiter {
    /// True if a notification was delivered but never observed by polling.
    ///
    /// Lets an owner that is being cancelled pass the wake-up on. The waiter
    /// leaves the queue first, so a racing `notify` moves on to the next one.
    pub(crate) fn take_unobserved(&mut self) -> bool {
        if self.observed {
            return false;
        }
        self.receiver.close();
        self.receiver.try_recv().is_ok()
    }
}

impl Future for Waiter {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.observed {
            return Poll::Ready(());
        }

        match Pin::new(&mut self.receiver).poll(cx) {
            // a dropped condition releases its waiters too
            Poll::Ready(_) => {
                self.observed = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

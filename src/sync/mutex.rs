use std::fmt;
use std::future::Future;

use super::condition::{Condition, Waiter};

/// Serializes async critical sections in arrival order.
///
/// The mutex owns no data; it only guarantees that at most one `body`
/// passed to [`lock`](Mutex::lock) is in flight at a time. Ownership is
/// handed directly from the finishing body to the next queued caller, so a
/// newcomer can never overtake the queue.
pub struct Mutex {
    free: parking_lot::Mutex<bool>,
    condition: Condition,
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            free: parking_lot::Mutex::new(true),
            condition: Condition::new(),
        }
    }

    /// Run `body` once every earlier caller's body has finished.
    ///
    /// The mutex is passed on when `body` completes, fails, panics or is
    /// cancelled; the body's output, including any error, is returned as is.
    pub async fn lock<F, Fut>(&self, body: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let mut ticket = Ticket {
            mutex: self,
            waiter: None,
            held: false,
        };

        {
            let mut free = self.free.lock();
            if *free {
                *free = false;
                ticket.held = true;
            } else {
                ticket.waiter = Some(self.condition.wait());
            }
        }

        if let Some(waiter) = ticket.waiter.as_mut() {
            waiter.await;
            ticket.held = true;
        }

        body().await
    }

    /// Whether a body is currently running or about to run.
    pub fn is_locked(&self) -> bool {
        !*self.free.lock()
    }

    /// Callers queued behind the current holder.
    pub fn queued(&self) -> usize {
        self.condition.waiters()
    }

    fn unlock(&self) {
        let mut free = self.free.lock();
        if !self.condition.notify() {
            *free = true;
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .field("queued", &self.queued())
            .finish()
    }
}

/// A caller's place in line. Releases (or forwards) the mutex on drop.
struct Ticket<'a> {
    mutex: &'a Mutex,
    waiter: Option<Waiter>,
    held: bool,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        // cancelled right after ownership was handed over
        let handed_over = self
            .waiter
            .as_mut()
            .is_some_and(|waiter| waiter.take_unobserved());

        if self.held || handed_over {
            self.mutex.unlock();
        }
    }
}

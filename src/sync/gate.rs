use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// One single-fire slot. Waiters share the receiving end, so every `wait`
/// on the same cell observes the same value.
struct Cell<T> {
    sender: Option<oneshot::Sender<T>>,
    receiver: Shared<oneshot::Receiver<T>>,
}

impl<T: Clone> Cell<T> {
    fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            sender: Some(sender),
            receiver: receiver.shared(),
        }
    }
}

/// A registry of named, single-fire wait points.
///
/// Cells are created lazily by whichever of [`wait`](Gate::wait) and
/// [`open`](Gate::open) comes first, so a producer may arm a name before
/// the consumer starts waiting on it: sending with nobody waiting stores
/// the value for the next receive.
///
/// | call      | cell exists                      | no cell                        |
/// |-----------|----------------------------------|--------------------------------|
/// | `open`    | resolve it and keep it armed     | create it already resolved     |
/// | `release` | resolve it and remove it         | no-op                          |
/// | `close`   | remove it, failing its waiters   | no-op                          |
///
/// Only the first value sent into a cell is kept. A second `open` before the
/// cell is closed is dropped.
pub struct Gate<T> {
    cells: Mutex<HashMap<String, Cell<T>>>,
}

impl<T> Gate<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until `name` is opened or released.
    ///
    /// The cell is registered before this returns. The future fails with
    /// [`Error::GateClosed`] if the cell is closed without being resolved.
    pub fn wait(&self, name: &str) -> impl Future<Output = Result<T>> + Send + 'static {
        let receiver = {
            let mut cells = self.cells.lock();
            cells
                .entry(name.to_owned())
                .or_insert_with(Cell::new)
                .receiver
                .clone()
        };
        let name = name.to_owned();

        async move { receiver.await.map_err(|_| Error::GateClosed(name)) }
    }

    /// Resolve `name`, arming it ahead of any future wait.
    pub fn open(&self, name: &str, value: T) {
        let mut cells = self.cells.lock();
        let cell = cells.entry(name.to_owned()).or_insert_with(Cell::new);

        match cell.sender.take() {
            Some(sender) => {
                let _ = sender.send(value);
            }
            None => tracing::warn!(gate = name, "gate already open, value dropped"),
        }
    }

    /// Resolve and discard the cell for `name`, if one exists.
    ///
    /// Returns whether a cell was found.
    pub fn release(&self, name: &str, value: T) -> bool {
        let cell = self.cells.lock().remove(name);

        match cell {
            Some(mut cell) => {
                if let Some(sender) = cell.sender.take() {
                    let _ = sender.send(value);
                }
                true
            }
            None => false,
        }
    }

    /// Discard the cell for `name` without resolving it.
    pub fn close(&self, name: &str) -> bool {
        self.cells.lock().remove(name).is_some()
    }

    /// Whether a cell currently exists for `name`.
    pub fn is_armed(&self, name: &str) -> bool {
        self.cells.lock().contains_key(name)
    }
}

impl<T> Default for Gate<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Gate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cells = self.cells.lock();
        f.debug_struct("Gate")
            .field("cells", &cells.keys().collect::<Vec<_>>())
            .finish()
    }
}

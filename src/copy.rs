//! In-memory duplex stream.
//!
//! A [`CopyStream`] connects a writer directly to a reader without an
//! intermediate queue: a read lends its buffer to the stream and waits,
//! writes copy straight into that buffer, and the read completes once the
//! buffer is full or the writer ends the stream.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as StateLock;
use tracing::trace;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::sync::{Condition, Mutex};
use crate::traits::{Sink, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// No read in progress
    Empty,
    /// A reader's buffer is waiting for bytes
    Ready,
    /// The buffer is full or the stream ended; the reader may take it back
    Done,
}

struct State {
    output: Option<Buffer>,
    slot: Slot,
    ended: bool,
}

struct Inner {
    state: StateLock<State>,
    reading: Mutex,
    writing: Mutex,
    output_ready: Condition,
    output_done: Condition,
}

/// Hands the lent buffer back to the reader, also when the read is cancelled.
struct Lent<'a> {
    inner: &'a Inner,
    buffer: &'a mut Buffer,
}

impl Drop for Lent<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if let Some(output) = state.output.take() {
            *self.buffer = output;
        }
        state.slot = Slot::Empty;
    }
}

/// A rendezvous between one writing side and one reading side.
///
/// Reads are serialized with each other, and so are writes and `end`.
/// Clones share the same stream, so one clone can be handed to a pipe as a
/// sink while another is pumped as a source.
#[derive(Clone)]
pub struct CopyStream {
    inner: Arc<Inner>,
}

impl CopyStream {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: StateLock::new(State {
                    output: None,
                    slot: Slot::Empty,
                    ended: false,
                }),
                reading: Mutex::new(),
                writing: Mutex::new(),
                output_ready: Condition::new(),
                output_done: Condition::new(),
            }),
        }
    }

    /// Fill the spare capacity of `buffer` with written bytes.
    ///
    /// Completes when the buffer is full or the stream is ended. Returns
    /// `Ok(false)` once the stream has ended and nothing was read.
    pub async fn read(&self, buffer: &mut Buffer) -> Result<bool> {
        if buffer.is_full() {
            return Err(Error::protocol("copy stream read into a full buffer"));
        }

        let inner = &*self.inner;
        inner
            .reading
            .lock(|| async move {
                let done = {
                    let mut state = inner.state.lock();
                    if state.ended {
                        return Ok(false);
                    }
                    state.output = Some(std::mem::replace(buffer, Buffer::new(0)));
                    state.slot = Slot::Ready;
                    let done = inner.output_done.wait();
                    inner.output_ready.notify();
                    done
                };

                let lent = Lent {
                    inner,
                    buffer: &mut *buffer,
                };
                done.await;
                drop(lent);

                let ended = inner.state.lock().ended;
                Ok(!(ended && buffer.is_empty()))
            })
            .await
    }

    /// Whether [`end`](Sink::end) has been called.
    pub fn is_ended(&self) -> bool {
        self.inner.state.lock().ended
    }
}

impl Default for CopyStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CopyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CopyStream")
            .field("slot", &state.slot)
            .field("ended", &state.ended)
            .finish()
    }
}

#[async_trait]
impl Source for CopyStream {
    async fn pull(&mut self, buffer: &mut Buffer) -> Result<bool> {
        self.read(buffer).await
    }
}

#[async_trait]
impl Sink for CopyStream {
    async fn write(&self, data: &[u8]) -> Result<()> {
        let inner = &*self.inner;
        inner
            .writing
            .lock(|| async move {
                if inner.state.lock().ended {
                    return Err(Error::Closed);
                }

                let mut offset = 0;
                while offset < data.len() {
                    let ready = {
                        let mut guard = inner.state.lock();
                        let state = &mut *guard;
                        match state.output.as_mut() {
                            Some(output) if state.slot == Slot::Ready => {
                                let count = output.extend_from_slice(&data[offset..]);
                                offset += count;
                                trace!(count, "copied into reader buffer");
                                if output.is_full() {
                                    state.slot = Slot::Done;
                                    inner.output_done.notify();
                                }
                                continue;
                            }
                            _ => inner.output_ready.wait(),
                        }
                    };
                    ready.await;
                }
                Ok(())
            })
            .await
    }

    /// Complete a pending read with whatever it holds and refuse further writes.
    async fn end(&self) -> Result<()> {
        let inner = &*self.inner;
        inner
            .writing
            .lock(|| async move {
                let mut state = inner.state.lock();
                state.ended = true;
                if state.output.is_some() && state.slot == Slot::Ready {
                    state.slot = Slot::Done;
                    inner.output_done.notify();
                }
                Ok(())
            })
            .await
    }
}

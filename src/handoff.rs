//! Rendezvous channel between a sink and a source.
//!
//! [`channel`] returns a [`HandoffSink`] and a [`HandoffSource`] joined by
//! two gates: the writer publishes each chunk on one and waits on the other
//! until the reader has pulled every byte of it. Nothing is queued, so a
//! pipe writing into the sink runs at the pace of whoever pumps the source.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::sync::{Gate, Mutex};
use crate::traits::{Sink, Source};

const CHUNK: &str = "chunk";
const CONSUMED: &str = "consumed";

#[derive(Debug, Clone)]
enum Signal {
    Chunk(Arc<[u8]>),
    End,
}

struct Channel {
    chunks: Gate<Signal>,
    consumed: Gate<()>,
    writing: Mutex,
    ended: AtomicBool,
    reader_gone: AtomicBool,
}

/// Create a connected sink/source pair.
pub fn channel() -> (HandoffSink, HandoffSource) {
    let channel = Arc::new(Channel {
        chunks: Gate::new(),
        consumed: Gate::new(),
        writing: Mutex::new(),
        ended: AtomicBool::new(false),
        reader_gone: AtomicBool::new(false),
    });

    (
        HandoffSink {
            channel: channel.clone(),
        },
        HandoffSource {
            channel,
            pending: None,
            ended: false,
        },
    )
}

/// Writing half of a [`channel`].
///
/// Each write returns once the reader has taken all of it. Dropping the
/// sink without ending it ends the stream. Cancelling a write part way
/// leaves the channel out of step, so treat it as fatal.
pub struct HandoffSink {
    channel: Arc<Channel>,
}

#[async_trait]
impl Sink for HandoffSink {
    async fn write(&self, data: &[u8]) -> Result<()> {
        let channel = &*self.channel;
        channel
            .writing
            .lock(|| async move {
                if channel.ended.load(Ordering::SeqCst) {
                    return Err(Error::Closed);
                }
                if data.is_empty() {
                    return Ok(());
                }

                let consumed = channel.consumed.wait(CONSUMED);
                if channel.reader_gone.load(Ordering::SeqCst) {
                    channel.consumed.close(CONSUMED);
                    return Err(Error::Closed);
                }

                channel.chunks.open(CHUNK, Signal::Chunk(Arc::from(data)));
                let result = consumed.await.map_err(|_| Error::Closed);
                channel.consumed.close(CONSUMED);
                result
            })
            .await
    }

    async fn end(&self) -> Result<()> {
        let channel = &*self.channel;
        channel
            .writing
            .lock(|| async move {
                if !channel.ended.swap(true, Ordering::SeqCst) {
                    channel.chunks.open(CHUNK, Signal::End);
                }
                Ok(())
            })
            .await
    }
}

impl Drop for HandoffSink {
    fn drop(&mut self) {
        if !self.channel.ended.swap(true, Ordering::SeqCst) {
            debug!("handoff sink dropped without end");
            self.channel.chunks.open(CHUNK, Signal::End);
        }
    }
}

impl std::fmt::Debug for HandoffSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffSink")
            .field("ended", &self.channel.ended.load(Ordering::SeqCst))
            .finish()
    }
}

/// Reading half of a [`channel`].
///
/// A chunk larger than the buffer is spread over several pulls; the writer
/// is released after the last of them.
pub struct HandoffSource {
    channel: Arc<Channel>,
    pending: Option<(Arc<[u8]>, usize)>,
    ended: bool,
}

#[async_trait]
impl Source for HandoffSource {
    async fn pull(&mut self, buffer: &mut Buffer) -> Result<bool> {
        if self.ended {
            return Ok(false);
        }

        if self.pending.is_none() {
            let signal = self.channel.chunks.wait(CHUNK).await?;
            self.channel.chunks.close(CHUNK);
            match signal {
                Signal::End => {
                    self.ended = true;
                    return Ok(false);
                }
                Signal::Chunk(data) => self.pending = Some((data, 0)),
            }
        }

        if let Some((data, offset)) = self.pending.as_mut() {
            *offset += buffer.extend_from_slice(&data[*offset..]);
            if *offset >= data.len() {
                self.pending = None;
                self.channel.consumed.open(CONSUMED, ());
            }
        }
        Ok(true)
    }
}

impl Drop for HandoffSource {
    fn drop(&mut self) {
        self.channel.reader_gone.store(true, Ordering::SeqCst);
        self.channel.consumed.close(CONSUMED);
    }
}

impl std::fmt::Debug for HandoffSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffSource")
            .field("pending", &self.pending.as_ref().map(|(data, offset)| data.len() - offset))
            .field("ended", &self.ended)
            .finish()
    }
}

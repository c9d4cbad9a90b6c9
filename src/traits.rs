//! Collaborator traits for the streaming engine.
//!
//! Sources are pulled into caller-provided buffers, sinks are pushed shared
//! byte slices, and transformers convert bytes between two buffers. Nothing
//! here ever queues data on its own: a source only runs when someone hands it
//! a free buffer, which is how backpressure travels upstream.

use async_trait::async_trait;

use crate::buffer::Buffer;
use crate::error::Result;

/// A pull-based byte producer.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use bytepump::{Buffer, Result, Source};
///
/// struct Countdown(u8);
///
/// #[async_trait]
/// impl Source for Countdown {
///     async fn pull(&mut self, buffer: &mut Buffer) -> Result<bool> {
///         if self.0 == 0 {
///             return Ok(false); // end of stream
///         }
///         buffer.extend_from_slice(&[self.0]);
///         self.0 -= 1;
///         Ok(true)
///     }
/// }
/// ```
#[async_trait]
pub trait Source: Send {
    /// Append the next unit of data to `buffer`'s spare capacity.
    ///
    /// Returns `Ok(false)` once the source is exhausted; the buffer contents
    /// are ignored in that case. Taking `&mut self` rules out overlapping pulls.
    async fn pull(&mut self, buffer: &mut Buffer) -> Result<bool>;
}

#[async_trait]
impl<S: Source + ?Sized> Source for Box<S> {
    async fn pull(&mut self, buffer: &mut Buffer) -> Result<bool> {
        (**self).pull(buffer).await
    }
}

/// A push-based byte consumer.
///
/// Sinks are shared between the pipe and its in-flight write rounds, so the
/// methods take `&self`; implementations keep their state behind a lock.
/// A pipe never issues a round of writes before the previous round settled.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Accept one chunk.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Called once the upstream source is exhausted, if the sink asked for it.
    async fn end(&self) -> Result<()> {
        Ok(())
    }
}

/// Bytes moved by one [`Transformer::transform`] step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Input bytes taken from the front of `input`
    pub consumed: usize,
    /// Output bytes written at `output[offset..]`
    pub produced: usize,
}

impl Progress {
    pub fn new(consumed: usize, produced: usize) -> Self {
        Self { consumed, produced }
    }
}

/// A stateful byte-to-byte converter such as a compressor or a codec.
///
/// The driver calls `transform` with whatever input remains and the output
/// buffer at `offset`. During the final flush `input` is empty and `ending`
/// is true; the flush ends on the first step that produces nothing, so an
/// implementation must eventually report `produced == 0` there.
#[async_trait]
pub trait Transformer: Send {
    async fn transform(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        offset: usize,
        ending: bool,
    ) -> Result<Progress>;
}

#[async_trait]
impl<T: Transformer + ?Sized> Transformer for Box<T> {
    async fn transform(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        offset: usize,
        ending: bool,
    ) -> Result<Progress> {
        (**self).transform(input, output, offset, ending).await
    }
}

/// In-place rewrite applied by a pipe to every chunk it reads.
#[async_trait]
pub trait ChunkTransform: Send {
    /// Rewrite the filled bytes of `buffer`. Returning `false` ends the stream.
    async fn apply(&mut self, buffer: &mut Buffer) -> Result<bool>;
}

//! Source implementations.
//!
//! Small byte producers for wiring up pumps, transforms and pipes.

use async_trait::async_trait;
use std::collections::VecDeque;

use crate::buffer::Buffer;
use crate::error::Result;
use crate::traits::Source;

/// A source that replays pre-recorded chunks.
///
/// A chunk larger than the buffer it is pulled into is split across pulls.
#[derive(Debug, Default, Clone)]
pub struct ChunkSource {
    chunks: VecDeque<Vec<u8>>,
    offset: usize,
}

impl ChunkSource {
    /// Create a source yielding `chunks` in order
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        Self {
            chunks: chunks.into_iter().map(|c| c.as_ref().to_vec()).collect(),
            offset: 0,
        }
    }

    /// Queue another chunk
    pub fn push(&mut self, chunk: impl Into<Vec<u8>>) {
        self.chunks.push_back(chunk.into());
    }

    /// Check if every chunk has been pulled
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Get the number of chunks not yet fully pulled
    pub fn len(&self) -> usize {
        self.chunks.len()
    }
}

#[async_trait]
impl Source for ChunkSource {
    async fn pull(&mut self, buffer: &mut Buffer) -> Result<bool> {
        let Some(chunk) = self.chunks.front() else {
            return Ok(false);
        };

        self.offset += buffer.extend_from_slice(&chunk[self.offset..]);
        if self.offset >= chunk.len() {
            self.chunks.pop_front();
            self.offset = 0;
        }
        Ok(true)
    }
}

/// A source that repeats a byte pattern.
///
/// Each pull emits (the rest of) one repetition.
#[derive(Debug, Clone)]
pub struct RepeatSource {
    pattern: Vec<u8>,
    remaining: Option<usize>,
    offset: usize,
}

impl RepeatSource {
    /// Repeat `pattern` until the consumer stops pulling
    pub fn forever(pattern: impl Into<Vec<u8>>) -> Self {
        Self {
            pattern: pattern.into(),
            remaining: None,
            offset: 0,
        }
    }

    /// Repeat `pattern` `count` times
    pub fn times(pattern: impl Into<Vec<u8>>, count: usize) -> Self {
        Self {
            pattern: pattern.into(),
            remaining: Some(count),
            offset: 0,
        }
    }
}

#[async_trait]
impl Source for RepeatSource {
    async fn pull(&mut self, buffer: &mut Buffer) -> Result<bool> {
        if self.pattern.is_empty() || self.remaining == Some(0) {
            return Ok(false);
        }

        self.offset += buffer.extend_from_slice(&self.pattern[self.offset..]);
        if self.offset >= self.pattern.len() {
            self.offset = 0;
            if let Some(ref mut rem) = self.remaining {
                *rem -= 1;
            }
        }
        Ok(true)
    }
}

/// Caps the total number of bytes pulled from an inner source.
///
/// The inner source only ever sees as much buffer capacity as is left under
/// the cap, so it never produces bytes that would have to be thrown away.
/// The limit stays on the buffer until it is cleared.
#[derive(Debug)]
pub struct LimitSource<S> {
    inner: S,
    remaining: usize,
}

impl<S> LimitSource<S> {
    pub fn new(inner: S, max_bytes: usize) -> Self {
        Self {
            inner,
            remaining: max_bytes,
        }
    }

    /// Bytes that may still be pulled
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: Source> Source for LimitSource<S> {
    async fn pull(&mut self, buffer: &mut Buffer) -> Result<bool> {
        if self.remaining == 0 {
            return Ok(false);
        }

        let start = buffer.len();
        buffer.limit(start.saturating_add(self.remaining));

        let more = self.inner.pull(buffer).await?;
        self.remaining -= buffer.len() - start;
        Ok(more)
    }
}

/// A source that is exhausted from the start.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSource;

#[async_trait]
impl Source for NullSource {
    async fn pull(&mut self, _buffer: &mut Buffer) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect<S: Source>(source: &mut S, size: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut buffer = Buffer::new(size);
        loop {
            buffer.clear();
            if !source.pull(&mut buffer).await.unwrap() {
                return out;
            }
            out.push(buffer.to_vec());
        }
    }

    #[tokio::test]
    async fn chunk_source_splits_oversized_chunks() {
        let mut source = ChunkSource::new(["abcde", "f"]);
        assert_eq!(source.len(), 2);

        let chunks = collect(&mut source, 2).await;
        assert_eq!(chunks, vec![b"ab".to_vec(), b"cd".to_vec(), b"e".to_vec(), b"f".to_vec()]);
        assert!(source.is_empty());
    }

    #[tokio::test]
    async fn repeat_source_counts_whole_repetitions() {
        let mut source = RepeatSource::times("xyz", 2);
        let chunks = collect(&mut source, 2).await;
        assert_eq!(chunks.concat(), b"xyzxyz");
    }

    #[tokio::test]
    async fn limit_source_stops_at_the_cap() {
        let mut source = LimitSource::new(RepeatSource::forever("abcd"), 6);
        let chunks = collect(&mut source, 4).await;

        assert_eq!(chunks.concat(), b"abcdab");
        assert_eq!(source.remaining(), 0);
    }

    #[tokio::test]
    async fn limit_source_passes_end_through() {
        let mut source = LimitSource::new(ChunkSource::new(["hi"]), 100);
        let chunks = collect(&mut source, 8).await;
        assert_eq!(chunks, vec![b"hi".to_vec()]);
        assert_eq!(source.remaining(), 98);
    }

    #[tokio::test]
    async fn null_source_is_empty() {
        let chunks = collect(&mut NullSource, 8).await;
        assert!(chunks.is_empty());
    }
}

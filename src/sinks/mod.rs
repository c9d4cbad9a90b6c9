//! Sink implementations.
//!
//! Sinks are shared by reference between a pipe and its write rounds, so
//! each one keeps its state behind `Arc`s; cloning a sink yields another
//! handle onto the same state.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

use crate::error::{Error, Result};
use crate::traits::Sink;

/// A sink that records every chunk it receives.
#[derive(Debug, Clone, Default)]
pub struct CollectSink {
    chunks: Arc<TokioMutex<Vec<Vec<u8>>>>,
    ended: Arc<AtomicBool>,
}

impl CollectSink {
    /// Create a new collect sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the chunks received so far
    pub async fn chunks(&self) -> Vec<Vec<u8>> {
        self.chunks.lock().await.clone()
    }

    /// Get all received bytes, concatenated
    pub async fn bytes(&self) -> Vec<u8> {
        self.chunks.lock().await.concat()
    }

    /// Whether `end` has been called
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for CollectSink {
    async fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_ended() {
            return Err(Error::Closed);
        }
        self.chunks.lock().await.push(data.to_vec());
        Ok(())
    }

    async fn end(&self) -> Result<()> {
        self.ended.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A sink that counts bytes and chunks
#[derive(Debug, Clone, Default)]
pub struct CountSink {
    bytes: Arc<AtomicU64>,
    chunks: Arc<AtomicUsize>,
}

impl CountSink {
    /// Create a new count sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes written
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Number of writes
    pub fn chunks(&self) -> usize {
        self.chunks.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for CountSink {
    async fn write(&self, data: &[u8]) -> Result<()> {
        self.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.chunks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A sink that discards everything until it is ended.
#[derive(Debug, Default)]
pub struct NullSink {
    ended: AtomicBool,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Sink for NullSink {
    async fn write(&self, _data: &[u8]) -> Result<()> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    async fn end(&self) -> Result<()> {
        self.ended.store(true, Ordering::SeqCst);
        Ok(())
    }
}

//! Fan-out pipe.
//!
//! A [`Pipe`] reads one [`Source`] into buffers from its own bounded pool
//! and writes every chunk to all connected sinks. Each round of writes runs
//! as a tokio task chained behind the previous round, so sinks see chunks
//! in order and a buffer goes back on the free list only once every write
//! of its round has settled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::buffer::{validate_bounds, Buffer, BufferPool, HeapPool, PoolStats};
use crate::error::{Error, Result};
use crate::sync::Condition;
use crate::traits::{ChunkTransform, Sink, Source};

/// Pool bounds for a [`Pipe`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PipeConfig {
    /// Buffers allocated when the pipe is built
    pub min_buffers: usize,
    /// Hard cap on buffers alive at once
    pub max_buffers: usize,
    /// Capacity of each buffer
    pub buffer_size: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            min_buffers: 1,
            max_buffers: 2,
            buffer_size: 8 * 1024,
        }
    }
}

impl PipeConfig {
    /// Set the number of buffers allocated up front
    pub fn min_buffers(mut self, min: usize) -> Self {
        self.min_buffers = min;
        self
    }

    /// Set the buffer cap
    pub fn max_buffers(mut self, max: usize) -> Self {
        self.max_buffers = max;
        self
    }

    /// Set the capacity of each buffer
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_bounds(self.min_buffers, self.max_buffers, self.buffer_size)
    }
}

#[derive(Clone)]
struct Output {
    sink: Arc<dyn Sink>,
    end: bool,
}

struct Reader<S> {
    source: S,
    transform: Option<Box<dyn ChunkTransform>>,
}

impl<S: Source> Reader<S> {
    async fn read(&mut self, buffer: &mut Buffer) -> Result<bool> {
        if !self.source.pull(buffer).await? {
            return Ok(false);
        }
        match self.transform.as_mut() {
            Some(transform) => transform.apply(buffer).await,
            None => Ok(true),
        }
    }
}

struct Pool {
    free: Vec<Buffer>,
    buffers: usize,
    high_water: usize,
}

struct Shared {
    pool: Mutex<Pool>,
    buffer_free: Condition,
    started: AtomicBool,
    error: Mutex<Option<Error>>,
    allocator: Arc<dyn BufferPool>,
    config: PipeConfig,
}

impl Shared {
    /// Take a free buffer, growing the pool up to `max_buffers` first and
    /// waiting for a round to settle after that.
    async fn take_buffer(&self) -> Buffer {
        loop {
            let freed = {
                let mut pool = self.pool.lock();
                if let Some(buffer) = pool.free.pop() {
                    return buffer;
                }
                if pool.buffers < self.config.max_buffers {
                    pool.buffers += 1;
                    pool.high_water = pool.high_water.max(pool.buffers);
                    debug!(buffers = pool.buffers, "growing pipe pool");
                    drop(pool);
                    return self.allocator.allocate(self.config.buffer_size);
                }
                self.buffer_free.wait()
            };
            freed.await;
        }
    }

    fn recycle(&self, buffer: Buffer) {
        let mut pool = self.pool.lock();
        pool.free.push(buffer);
        self.buffer_free.notify();
    }

    fn failed(&self) -> bool {
        self.error.lock().is_some()
    }

    /// Record `error` unless an earlier one is already held, and stop.
    fn fail(&self, error: Error) {
        self.started.store(false, Ordering::SeqCst);

        let mut slot = self.error.lock();
        if slot.is_none() {
            warn!(error = %error, "pipe stopping on error");
            *slot = Some(error);
        } else {
            debug!(error = %error, "discarding later pipe error");
        }
    }

    fn stats(&self) -> PoolStats {
        let pool = self.pool.lock();
        PoolStats {
            buffers: pool.buffers,
            free: pool.free.len(),
            ready: pool.buffers - pool.free.len(),
            high_water: pool.high_water,
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for buffer in self.pool.get_mut().free.drain(..) {
            self.allocator.release(buffer);
        }
    }
}

/// Clears the running flag when `start` returns or is dropped.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn same_sink(a: &Arc<dyn Sink>, b: &Arc<dyn Sink>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Moves one source to any number of sinks.
///
/// Sinks are registered with [`connect`](Pipe::connect) and can come and
/// go at any time; a read is delivered to the sinks connected when it
/// completed. The first error from a source, transform, write or end stops
/// the pipe and is returned from [`start`](Pipe::start) once every round in
/// flight has drained.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use bytepump::pipe::{Pipe, PipeConfig};
/// use bytepump::sinks::CollectSink;
/// use bytepump::sources::ChunkSource;
///
/// # async fn demo() -> bytepump::Result<()> {
/// let left = CollectSink::new();
/// let right = CollectSink::new();
///
/// let pipe = Pipe::new(ChunkSource::new(["a", "b"]), PipeConfig::default())?;
/// pipe.connect(Arc::new(left.clone()), true);
/// pipe.connect(Arc::new(right.clone()), true);
/// pipe.start().await?;
///
/// assert_eq!(left.bytes().await, right.bytes().await);
/// # Ok(())
/// # }
/// ```
pub struct Pipe<S> {
    reader: tokio::sync::Mutex<Reader<S>>,
    outputs: Mutex<Vec<Output>>,
    shared: Arc<Shared>,
}

impl<S: Source> Pipe<S> {
    /// Build a pipe reading `source` with heap-allocated buffers.
    pub fn new(source: S, config: PipeConfig) -> Result<Self> {
        Self::with_pool(source, config, Arc::new(HeapPool))
    }

    /// Build a pipe reading `source`, taking buffers from `allocator`.
    pub fn with_pool(source: S, config: PipeConfig, allocator: Arc<dyn BufferPool>) -> Result<Self> {
        config.validate()?;

        let free: Vec<Buffer> = (0..config.min_buffers)
            .map(|_| allocator.allocate(config.buffer_size))
            .collect();
        let pool = Pool {
            buffers: free.len(),
            high_water: free.len(),
            free,
        };

        Ok(Self {
            reader: tokio::sync::Mutex::new(Reader {
                source,
                transform: None,
            }),
            outputs: Mutex::new(Vec::new()),
            shared: Arc::new(Shared {
                pool: Mutex::new(pool),
                buffer_free: Condition::new(),
                started: AtomicBool::new(false),
                error: Mutex::new(None),
                allocator,
                config,
            }),
        })
    }

    /// Rewrite every chunk with `transform` before it is written out.
    pub fn with_transform<T>(mut self, transform: T) -> Self
    where
        T: ChunkTransform + 'static,
    {
        self.reader.get_mut().transform = Some(Box::new(transform));
        self
    }

    /// Register `sink`. When `end` is set the sink is ended after the
    /// source is exhausted. Returns false if the sink was already connected.
    pub fn connect(&self, sink: Arc<dyn Sink>, end: bool) -> bool {
        let mut outputs = self.outputs.lock();
        if outputs.iter().any(|output| same_sink(&output.sink, &sink)) {
            return false;
        }
        outputs.push(Output { sink, end });
        true
    }

    /// Remove `sink`. Removing the last sink stops the pipe.
    pub fn disconnect(&self, sink: &Arc<dyn Sink>) -> bool {
        let mut outputs = self.outputs.lock();
        let Some(index) = outputs.iter().position(|output| same_sink(&output.sink, sink)) else {
            return false;
        };

        outputs.remove(index);
        if outputs.is_empty() {
            debug!("last pipe output disconnected");
            self.stop();
        }
        true
    }

    /// Number of connected sinks.
    pub fn outputs(&self) -> usize {
        self.outputs.lock().len()
    }

    /// Ask the read loop to stop before its next read.
    pub fn stop(&self) {
        self.shared.started.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &PipeConfig {
        &self.shared.config
    }

    /// Pool occupancy. Buffers being read or written count as ready.
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Run the read loop until the source ends, the pipe is stopped, or
    /// something fails.
    ///
    /// Returns immediately if the pipe is already running. Fails with
    /// [`Error::NoOutputs`] when no sink is connected.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if self.outputs.lock().is_empty() {
            return Err(Error::NoOutputs);
        }

        let mut reader = self.reader.lock().await;
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _running = Running(&self.shared.started);
        let mut last: Option<JoinHandle<()>> = None;

        debug!(outputs = self.outputs(), "pipe started");

        while self.is_running() {
            let mut buffer = self.shared.take_buffer().await;
            if !self.is_running() {
                self.shared.recycle(buffer);
                break;
            }

            buffer.clear();
            let more = match reader.read(&mut buffer).await {
                Ok(more) => more,
                Err(error) => {
                    self.shared.recycle(buffer);
                    self.shared.fail(error);
                    break;
                }
            };

            let outputs = self.outputs.lock().clone();
            if !more {
                debug!("pipe source exhausted");
                let ending = outputs.into_iter().filter(|output| output.end).collect();
                last = Some(self.spawn_round(last, ending, buffer, true));
                break;
            }

            trace!(len = buffer.len(), sinks = outputs.len(), "pipe round");
            last = Some(self.spawn_round(last, outputs, buffer, false));
        }

        self.stop();
        if let Some(last) = last {
            last.await?;
        }

        let error = self.shared.error.lock().take();
        match error {
            Some(error) => Err(error),
            None => {
                debug!("pipe finished");
                Ok(())
            }
        }
    }

    fn spawn_round(
        &self,
        previous: Option<JoinHandle<()>>,
        outputs: Vec<Output>,
        buffer: Buffer,
        ending: bool,
    ) -> JoinHandle<()> {
        tokio::spawn(settle(self.shared.clone(), previous, outputs, buffer, ending))
    }

    /// Pipe `source` into a single `sink` with the default configuration.
    pub async fn run(source: S, sink: Arc<dyn Sink>, end: bool) -> Result<()> {
        let pipe = Self::new(source, PipeConfig::default())?;
        pipe.connect(sink, end);
        pipe.start().await
    }
}

impl<S> std::fmt::Debug for Pipe<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("config", &self.shared.config)
            .field("outputs", &self.outputs.lock().len())
            .field("running", &self.shared.started.load(Ordering::SeqCst))
            .field("stats", &self.shared.stats())
            .finish()
    }
}

/// One round: wait for the previous round, write or end every output,
/// record the first failure and hand the buffer back.
async fn settle(
    shared: Arc<Shared>,
    previous: Option<JoinHandle<()>>,
    outputs: Vec<Output>,
    buffer: Buffer,
    ending: bool,
) {
    if let Some(previous) = previous {
        if let Err(error) = previous.await {
            shared.fail(error.into());
        }
    }

    if !shared.failed() {
        let results = if ending {
            join_all(outputs.iter().map(|output| output.sink.end())).await
        } else if buffer.is_empty() {
            Vec::new()
        } else {
            join_all(outputs.iter().map(|output| output.sink.write(&buffer))).await
        };

        #[cfg(feature = "metrics")]
        crate::metrics::record_bytes("pipe", buffer.len() * outputs.len());

        for result in results {
            if let Err(error) = result {
                shared.fail(error);
            }
        }
    }

    shared.recycle(buffer);

    #[cfg(feature = "metrics")]
    crate::metrics::record_pool("pipe", &shared.stats());
}

//! Buffer pump.
//!
//! A [`Pump`] turns a [`Source`] into a bounded sequence of filled buffers.
//! A background pull-loop fills buffers from a recycling pool while the
//! consumer is still working on the previous chunk, so pulling and
//! consuming overlap without ever holding more than `max_buffers` buffers.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::buffer::{validate_bounds, Buffer, BufferPool, HeapPool, PoolStats, DEFAULT_BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::sync::Gate;
use crate::traits::Source;

const FREE: &str = "free";
const READY: &str = "ready";

/// Pool bounds for a [`Pump`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PumpConfig {
    /// Buffers allocated up front and kept as spares
    pub min_buffers: usize,
    /// Hard cap on buffers alive at once
    pub max_buffers: usize,
    /// Capacity of each buffer
    pub buffer_size: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            min_buffers: 1,
            max_buffers: 16,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl PumpConfig {
    /// Set the number of spare buffers
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

enum Outcome {
    Data,
    End,
    Failed(Error),
}

struct Filled {
    outcome: Outcome,
    buffer: Buffer,
}

struct State {
    free: VecDeque<Buffer>,
    ready: VecDeque<Filled>,
    buffers: usize,
    high_water: usize,
    finished: bool,
}

struct Shared {
    state: Mutex<State>,
    gate: Gate<()>,
    pool: Arc<dyn BufferPool>,
    config: PumpConfig,
}

impl Shared {
    fn stats(&self, active: bool) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            buffers: state.buffers,
            free: state.free.len(),
            ready: state.ready.len() + usize::from(active),
            high_water: state.high_water,
        }
    }
}

/// Pulls a [`Source`] ahead of its consumer through a bounded buffer pool.
///
/// The buffer handed out by [`next`](Pump::next) stays with the consumer
/// until the following call, which recycles it: back onto the free list if
/// fewer than `min_buffers` spares are idle, otherwise back to the
/// allocator.
///
/// Dropping the pump aborts the pull-loop and returns every buffer to the
/// allocator, including one caught in the middle of a source pull.
///
/// Must be created inside a tokio runtime.
pub struct Pump {
    shared: Arc<Shared>,
    active: Option<Buffer>,
    done: bool,
    task: JoinHandle<()>,
}

impl Pump {
    /// Start pumping `source` with heap-allocated buffers.
    pub fn new<S>(source: S, config: PumpConfig) -> Result<Self>
    where
        S: Source + 'static,
    {
        Self::with_pool(source, config, Arc::new(HeapPool))
    }

    /// Start pumping `source`, taking buffers from `pool`.
    pub fn with_pool<S>(source: S, config: PumpConfig, pool: Arc<dyn BufferPool>) -> Result<Self>
    where
        S: Source + 'static,
    {
        config.validate()?;

        let free: VecDeque<Buffer> = (0..config.min_buffers)
            .map(|_| pool.allocate(config.buffer_size))
            .collect();
        let state = State {
            buffers: free.len(),
            high_water: free.len(),
            free,
            ready: VecDeque::new(),
            finished: false,
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            gate: Gate::new(),
            pool,
            config,
        });

        debug!(
            min = shared.config.min_buffers,
            max = shared.config.max_buffers,
            size = shared.config.buffer_size,
            "starting pump"
        );
        let task = tokio::spawn(pull_loop(source, shared.clone()));

        Ok(Self {
            shared,
            active: None,
            done: false,
            task,
        })
    }

    /// Move to the next filled buffer.
    ///
    /// Returns `Ok(false)` at end of stream. A source error is returned once;
    /// after the end or an error every further call returns `Ok(false)`.
    pub async fn advance(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }

        self.recycle();

        let filled = loop {
            let ready = {
                let mut state = self.shared.state.lock();
                if let Some(filled) = state.ready.pop_front() {
                    break filled;
                }
                self.shared.gate.wait(READY)
            };
            ready.await?;
        };

        match filled.outcome {
            Outcome::Data => {
                trace!(len = filled.buffer.len(), "pump chunk ready");
                self.active = Some(filled.buffer);
                Ok(true)
            }
            Outcome::End => {
                self.finish(filled.buffer);
                Ok(false)
            }
            Outcome::Failed(error) => {
                self.finish(filled.buffer);
                Err(error)
            }
        }
    }

    /// The bytes of the current buffer, empty before the first advance.
    pub fn chunk(&self) -> &[u8] {
        self.active.as_deref().unwrap_or(&[])
    }

    /// Advance and borrow the new chunk. `Ok(None)` marks the end.
    pub async fn next(&mut self) -> Result<Option<&[u8]>> {
        if self.advance().await? {
            Ok(Some(self.chunk()))
        } else {
            Ok(None)
        }
    }

    /// Whether the end of the stream (or an error) has been observed.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn config(&self) -> &PumpConfig {
        &self.shared.config
    }

    /// Pool occupancy. The consumer's current buffer counts as ready.
    pub fn stats(&self) -> PoolStats {
        self.shared.stats(self.active.is_some())
    }

    fn recycle(&mut self) {
        let Some(buffer) = self.active.take() else {
            return;
        };

        let spare = {
            let mut state = self.shared.state.lock();
            if state.free.len() < self.shared.config.min_buffers {
                state.free.push_back(buffer);
                self.shared.gate.release(FREE, ());
                None
            } else {
                state.buffers -= 1;
                Some(buffer)
            }
        };

        if let Some(buffer) = spare {
            self.shared.pool.release(buffer);
        }

        #[cfg(feature = "metrics")]
        crate::metrics::record_pool("pump", &self.stats());
    }

    fn finish(&mut self, last: Buffer) {
        self.done = true;

        let mut retired = vec![last];
        {
            let mut state = self.shared.state.lock();
            let excess = state.free.len().saturating_sub(self.shared.config.min_buffers);
            retired.extend(state.free.drain(..excess));
            state.buffers -= retired.len();
        }

        debug!(returned = retired.len(), "pump drained");
        for buffer in retired {
            self.shared.pool.release(buffer);
        }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.task.abort();

        let mut retired: Vec<Buffer> = self.active.take().into_iter().collect();
        {
            let mut state = self.shared.state.lock();
            state.finished = true;
            retired.extend(state.free.drain(..));
            retired.extend(state.ready.drain(..).map(|filled| filled.buffer));
            state.buffers = state.buffers.saturating_sub(retired.len());
        }
        self.shared.gate.close(FREE);
        self.shared.gate.close(READY);

        for buffer in retired {
            self.shared.pool.release(buffer);
        }
    }
}

impl std::fmt::Debug for Pump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pump")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .field("done", &self.done)
            .finish()
    }
}

/// A buffer owned by the pull-loop while the source fills it.
///
/// Returned to the allocator if the loop is aborted mid-pull.
struct Held<'a> {
    shared: &'a Shared,
    buffer: Buffer,
    armed: bool,
}

impl<'a> Held<'a> {
    fn new(shared: &'a Shared, buffer: Buffer) -> Self {
        Self {
            shared,
            buffer,
            armed: true,
        }
    }

    fn into_inner(mut self) -> Buffer {
        self.armed = false;
        std::mem::replace(&mut self.buffer, Buffer::new(0))
    }
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            state.buffers = state.buffers.saturating_sub(1);
        }
        trace!("returning buffer from aborted pull");
        let buffer = std::mem::replace(&mut self.buffer, Buffer::new(0));
        self.shared.pool.release(buffer);
    }
}

async fn pull_loop<S: Source>(mut source: S, shared: Arc<Shared>) {
    let size = shared.config.buffer_size;

    loop {
        let buffer = loop {
            let freed = {
                let mut state = shared.state.lock();
                if state.finished {
                    return;
                }
                if let Some(buffer) = state.free.pop_front() {
                    break buffer;
                }
                if state.buffers < shared.config.max_buffers {
                    state.buffers += 1;
                    state.high_water = state.high_water.max(state.buffers);
                    debug!(buffers = state.buffers, "growing pump pool");
                    drop(state);
                    break shared.pool.allocate(size);
                }
                shared.gate.wait(FREE)
            };
            if freed.await.is_err() {
                return;
            }
        };

        let mut held = Held::new(&shared, buffer);
        held.buffer.clear();
        let outcome = match source.pull(&mut held.buffer).await {
            Ok(true) => Outcome::Data,
            Ok(false) => Outcome::End,
            Err(error) => {
                warn!(error = %error, "pump source failed");
                Outcome::Failed(error)
            }
        };
        let buffer = held.into_inner();

        #[cfg(feature = "metrics")]
        crate::metrics::record_bytes("pump", buffer.len());

        let last = !matches!(outcome, Outcome::Data);
        {
            let mut state = shared.state.lock();
            state.ready.push_back(Filled { outcome, buffer });
            if last {
                state.finished = true;
            }
            shared.gate.release(READY, ());
        }

        if last {
            debug!("pump source exhausted");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{ChunkSource, RepeatSource};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct CountingPool {
        allocated: AtomicUsize,
        released: AtomicUsize,
    }

    impl CountingPool {
        fn outstanding(&self) -> usize {
            self.allocated.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst)
        }
    }

    impl BufferPool for CountingPool {
        fn allocate(&self, size: usize) -> Buffer {
            self.allocated.fetch_add(1, Ordering::SeqCst);
            Buffer::new(size)
        }

        fn release(&self, _buffer: Buffer) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingSource {
        good: usize,
    }

    #[async_trait]
    impl Source for FailingSource {
        async fn pull(&mut self, buffer: &mut Buffer) -> Result<bool> {
            if self.good == 0 {
                return Err(Error::custom("device unplugged"));
            }
            self.good -= 1;
            buffer.extend_from_slice(b"ok");
            Ok(true)
        }
    }

    /// Yields one chunk, then parks forever.
    struct Stalling {
        first: bool,
        _dropped: oneshot::Sender<()>,
    }

    #[async_trait]
    impl Source for Stalling {
        async fn pull(&mut self, buffer: &mut Buffer) -> Result<bool> {
            if self.first {
                self.first = false;
                buffer.extend_from_slice(b"once");
                return Ok(true);
            }
            std::future::pending::<()>().await;
            Ok(false)
        }
    }

    async fn drain(pump: &mut Pump) -> Result<Vec<Vec<u8>>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = pump.next().await? {
            chunks.push(chunk.to_vec());
        }
        Ok(chunks)
    }

    #[tokio::test]
    async fn delivers_chunks_in_order() {
        let source = ChunkSource::new(["ab", "cde", "f"]);
        let config = PumpConfig::default().max_buffers(2).buffer_size(4);
        let mut pump = Pump::new(source, config).unwrap();

        let chunks = drain(&mut pump).await.unwrap();
        assert_eq!(chunks, vec![b"ab".to_vec(), b"cde".to_vec(), b"f".to_vec()]);
        assert!(pump.is_done());
        assert_eq!(pump.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn splits_chunks_at_buffer_capacity() {
        let source = ChunkSource::new(["abcdef"]);
        let config = PumpConfig::default().max_buffers(2).buffer_size(4);
        let mut pump = Pump::new(source, config).unwrap();

        let chunks = drain(&mut pump).await.unwrap();
        assert_eq!(chunks, vec![b"abcd".to_vec(), b"ef".to_vec()]);
        assert_eq!(chunks.concat(), b"abcdef");
    }

    #[tokio::test]
    async fn never_exceeds_max_buffers() {
        let source = RepeatSource::forever(b"x".to_vec());
        let config = PumpConfig::default().max_buffers(3).buffer_size(1);
        let mut pump = Pump::new(source, config).unwrap();

        for _ in 0..50 {
            assert_eq!(pump.next().await.unwrap(), Some(&b"x"[..]));
            // give the pull-loop every chance to run ahead
            tokio::task::yield_now().await;
            let stats = pump.stats();
            assert!(stats.buffers <= 3);
            assert!(stats.high_water <= 3);
        }
        assert_eq!(pump.stats().high_water, 3);
    }

    #[tokio::test]
    async fn source_error_reaches_consumer_once() {
        let config = PumpConfig::default().max_buffers(2).buffer_size(8);
        let mut pump = Pump::new(FailingSource { good: 1 }, config).unwrap();

        assert_eq!(pump.next().await.unwrap(), Some(&b"ok"[..]));
        let err = pump.next().await.unwrap_err();
        assert!(matches!(err, Error::Custom(ref m) if m == "device unplugged"));
        assert_eq!(pump.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn buffers_are_conserved() {
        let pool = Arc::new(CountingPool::default());
        let source = ChunkSource::new(["one", "two", "three", "four", "five"]);
        let config = PumpConfig::default().min_buffers(2).max_buffers(4).buffer_size(8);
        let mut pump = Pump::with_pool(source, config, pool.clone()).unwrap();

        assert_eq!(pool.outstanding(), pump.stats().buffers);
        while pump.advance().await.unwrap() {
            tokio::task::yield_now().await;
            let stats = pump.stats();
            assert_eq!(pool.outstanding(), stats.buffers);
            assert!(stats.free + stats.ready <= stats.buffers);
        }

        // only the spares survive the end of the stream
        assert!(pump.stats().buffers <= 2);
        drop(pump);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn dropping_mid_stream_returns_idle_buffers() {
        let pool = Arc::new(CountingPool::default());
        let source = RepeatSource::forever(b"data".to_vec());
        let config = PumpConfig::default().max_buffers(4).buffer_size(4);
        let mut pump = Pump::with_pool(source, config, pool.clone()).unwrap();

        pump.advance().await.unwrap();
        tokio::task::yield_now().await;
        drop(pump);

        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn dropping_during_a_pull_returns_the_held_buffer() {
        let pool = Arc::new(CountingPool::default());
        let (dropped_tx, dropped_rx) = oneshot::channel();
        let source = Stalling {
            first: true,
            _dropped: dropped_tx,
        };
        let config = PumpConfig::default().max_buffers(2).buffer_size(8);
        let mut pump = Pump::with_pool(source, config, pool.clone()).unwrap();

        assert_eq!(pump.next().await.unwrap(), Some(&b"once"[..]));
        // let the pull-loop take a second buffer and park in the source
        tokio::task::yield_now().await;
        assert_eq!(pool.allocated.load(Ordering::SeqCst), 2);

        drop(pump);
        // resolves once the aborted loop has been torn down
        let _ = dropped_rx.await;
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn rejects_inverted_bounds() {
        let config = PumpConfig::default().min_buffers(4).max_buffers(2);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}

//! # Cooperative byte streaming with bounded buffers
//!
//! This crate moves bytes from pull-based sources to push-based sinks without
//! ever queueing more data than its buffer pools allow. Upstream stages only
//! run when a downstream stage hands them a free buffer, so backpressure
//! travels by suspension instead of by unbounded queues.
//!
//! ## Core Concepts
//!
//! - **Source**: fills a caller-provided [`Buffer`] on demand
//! - **Sink**: accepts shared byte slices and an optional end-of-stream
//! - **Pump**: pulls a source ahead of its consumer through a recycling pool
//! - **TransformSession**: drives a stateful [`Transformer`] across chunk
//!   and buffer boundaries, flushing at end of input
//! - **Pipe**: fans one source out to many sinks, freeing each buffer only
//!   after every write of its round has settled
//! - **Gate / Condition / Mutex**: the cooperative primitives the rest is
//!   built from
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use bytepump::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let source = ChunkSource::new(["hello", " ", "world"]);
//!     let session = TransformSession::from_source(source, PumpConfig::default(), Passthrough)?;
//!
//!     let sink = CollectSink::new();
//!     let pipe = Pipe::new(session, PipeConfig::default().buffer_size(4))?;
//!     pipe.connect(Arc::new(sink.clone()), true);
//!     pipe.start().await?;
//!
//!     assert_eq!(sink.bytes().await, b"hello world");
//!     assert!(sink.is_ended());
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod copy;
pub mod error;
pub mod handoff;
pub mod io;
pub mod pipe;
pub mod pump;
pub mod sinks;
pub mod sources;
pub mod sync;
pub mod traits;
pub mod transform;

// Re-export commonly used items
pub mod prelude {
    pub use crate::buffer::{Buffer, BufferPool, HeapPool, PoolStats};
    pub use crate::copy::CopyStream;
    pub use crate::error::{Error, IntoError, Result};
    pub use crate::handoff::{channel, HandoffSink, HandoffSource};
    pub use crate::io::{ReaderSource, WriterSink};
    pub use crate::pipe::{Pipe, PipeConfig};
    pub use crate::pump::{Pump, PumpConfig};
    pub use crate::sinks::{CollectSink, CountSink, NullSink};
    pub use crate::sources::{ChunkSource, LimitSource, NullSource, RepeatSource};
    pub use crate::traits::{ChunkTransform, Progress, Sink, Source, Transformer};
    pub use crate::transform::{Passthrough, TransformSession};
}

pub use buffer::Buffer;
pub use error::{Error, Result};
pub use traits::{ChunkTransform, Progress, Sink, Source, Transformer};

#[cfg(feature = "metrics")]
pub mod metrics;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

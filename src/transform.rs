//! Pull-based binary transform driver.
//!
//! A [`TransformSession`] feeds chunks from a [`Pump`] through a
//! [`Transformer`] and fills whatever output buffer its caller hands it.
//! The session is itself a [`Source`], so it can sit in front of another
//! pump or a pipe.

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::pump::{Pump, PumpConfig};
use crate::traits::{Progress, Source, Transformer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Reading,
    Flushing,
    Done,
}

/// Drives one transformer over one input stream.
///
/// Unconsumed input stays in the pump's current chunk until the transformer
/// takes it, so no bytes are lost when an output buffer fills mid-chunk.
/// Once the input ends the session flushes: it keeps calling the
/// transformer with empty input and `ending = true` until a step produces
/// nothing, handing out full buffers along the way and the non-empty
/// remainder last.
pub struct TransformSession<T> {
    input: Pump,
    transformer: T,
    cursor: usize,
    phase: Phase,
    consumed: u64,
    produced: u64,
}

impl<T: Transformer> TransformSession<T> {
    /// Transform the chunks delivered by `input`.
    pub fn new(input: Pump, transformer: T) -> Self {
        Self {
            input,
            transformer,
            cursor: 0,
            phase: Phase::Reading,
            consumed: 0,
            produced: 0,
        }
    }

    /// Pump `source` with `config` and transform what it yields.
    pub fn from_source<S>(source: S, config: PumpConfig, transformer: T) -> Result<Self>
    where
        S: Source + 'static,
    {
        Ok(Self::new(Pump::new(source, config)?, transformer))
    }

    /// Cumulative `(consumed, produced)` byte counts.
    pub fn totals(&self) -> (u64, u64) {
        (self.consumed, self.produced)
    }

    /// Whether the flush has completed or the session failed.
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn transformer(&self) -> &T {
        &self.transformer
    }

    /// Stop the input pump and give back the transformer.
    pub fn into_transformer(self) -> T {
        self.transformer
    }

    fn record(&mut self, step: Progress) {
        self.consumed += step.consumed as u64;
        self.produced += step.produced as u64;
    }
}

fn check(step: Progress, input: usize, space: usize) -> Result<()> {
    if step.consumed > input {
        return Err(Error::protocol(format!(
            "transformer consumed {} bytes of {}",
            step.consumed, input
        )));
    }
    if step.produced > space {
        return Err(Error::protocol(format!(
            "transformer produced {} bytes into {} free",
            step.produced, space
        )));
    }
    Ok(())
}

#[async_trait]
impl<T: Transformer> Source for TransformSession<T> {
    async fn pull(&mut self, output: &mut Buffer) -> Result<bool> {
        if output.capacity() == 0 {
            return Err(Error::protocol("transform output buffer has no capacity"));
        }

        let result = self.fill(output).await;
        if result.is_err() {
            // upstream and transformer failures are terminal
            self.phase = Phase::Done;
        }
        result
    }
}

impl<T: Transformer> TransformSession<T> {
    async fn fill(&mut self, output: &mut Buffer) -> Result<bool> {
        loop {
            if self.phase == Phase::Done {
                return Ok(false);
            }
            if output.is_full() {
                return Ok(true);
            }

            let offset = output.len();
            let space = output.remaining();

            if self.phase == Phase::Reading {
                if self.cursor >= self.input.chunk().len() {
                    if self.input.advance().await? {
                        self.cursor = 0;
                    } else {
                        debug!(consumed = self.consumed, "transform input ended, flushing");
                        self.phase = Phase::Flushing;
                    }
                    continue;
                }

                let input = &self.input.chunk()[self.cursor..];
                let step = self
                    .transformer
                    .transform(input, output.storage_mut(), offset, false)
                    .await?;
                check(step, input.len(), space)?;
                if step.consumed == 0 && step.produced == 0 {
                    return Err(Error::protocol("transformer made no progress"));
                }

                trace!(consumed = step.consumed, produced = step.produced, "transform step");
                self.cursor += step.consumed;
                output.advance(step.produced);
                self.record(step);
            } else {
                let step = self
                    .transformer
                    .transform(&[], output.storage_mut(), offset, true)
                    .await?;
                check(step, 0, space)?;

                output.advance(step.produced);
                self.record(step);

                if step.produced == 0 {
                    debug!(
                        consumed = self.consumed,
                        produced = self.produced,
                        "transform flushed"
                    );
                    self.phase = Phase::Done;
                    return Ok(!output.is_empty());
                }
            }
        }
    }
}

/// A transformer that copies its input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

#[async_trait]
impl Transformer for Passthrough {
    async fn transform(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        offset: usize,
        _ending: bool,
    ) -> Result<Progress> {
        let count = input.len().min(output.len() - offset);
        output[offset..offset + count].copy_from_slice(&input[..count]);
        Ok(Progress::new(count, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::ChunkSource;
    use proptest::prelude::*;

    /// Writes every byte twice, carrying a half-written pair across buffers.
    #[derive(Default)]
    struct Doubler {
        carry: Option<u8>,
    }

    #[async_trait]
    impl Transformer for Doubler {
        async fn transform(
            &mut self,
            input: &[u8],
            output: &mut [u8],
            offset: usize,
            _ending: bool,
        ) -> Result<Progress> {
            let mut out = offset;
            let mut consumed = 0;

            if let Some(byte) = self.carry {
                if out < output.len() {
                    output[out] = byte;
                    out += 1;
                    self.carry = None;
                }
            }

            while self.carry.is_none() && consumed < input.len() && out < output.len() {
                let byte = input[consumed];
                consumed += 1;
                output[out] = byte;
                out += 1;
                if out < output.len() {
                    output[out] = byte;
                    out += 1;
                } else {
                    self.carry = Some(byte);
                }
            }

            Ok(Progress::new(consumed, out - offset))
        }
    }

    /// Copies input, then emits a trailer during the flush.
    struct Trailer {
        trailer: &'static [u8],
        sent: usize,
        flush_calls: usize,
    }

    #[async_trait]
    impl Transformer for Trailer {
        async fn transform(
            &mut self,
            input: &[u8],
            output: &mut [u8],
            offset: usize,
            ending: bool,
        ) -> Result<Progress> {
            if !ending {
                return Passthrough.transform(input, output, offset, false).await;
            }
            self.flush_calls += 1;
            let rest = &self.trailer[self.sent..];
            let count = rest.len().min(output.len() - offset);
            output[offset..offset + count].copy_from_slice(&rest[..count]);
            self.sent += count;
            Ok(Progress::new(0, count))
        }
    }

    struct Liar;

    #[async_trait]
    impl Transformer for Liar {
        async fn transform(
            &mut self,
            input: &[u8],
            _output: &mut [u8],
            _offset: usize,
            _ending: bool,
        ) -> Result<Progress> {
            Ok(Progress::new(input.len() + 1, 0))
        }
    }

    struct Stuck;

    #[async_trait]
    impl Transformer for Stuck {
        async fn transform(
            &mut self,
            _input: &[u8],
            _output: &mut [u8],
            _offset: usize,
            _ending: bool,
        ) -> Result<Progress> {
            Ok(Progress::default())
        }
    }

    /// Fails on every call, counting them.
    #[derive(Default)]
    struct Faulty {
        calls: usize,
    }

    #[async_trait]
    impl Transformer for Faulty {
        async fn transform(
            &mut self,
            _input: &[u8],
            _output: &mut [u8],
            _offset: usize,
            _ending: bool,
        ) -> Result<Progress> {
            self.calls += 1;
            Err(Error::custom("bad block"))
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl Source for BrokenSource {
        async fn pull(&mut self, _buffer: &mut Buffer) -> Result<bool> {
            Err(Error::custom("upstream broke"))
        }
    }

    async fn drain<T: Transformer>(session: &mut TransformSession<T>, size: usize) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        let mut buffer = Buffer::new(size);
        loop {
            buffer.clear();
            if !session.pull(&mut buffer).await? {
                return Ok(out);
            }
            out.push(buffer.to_vec());
        }
    }

    fn pump_of<I, C>(chunks: I, size: usize) -> Pump
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        let config = PumpConfig::default().max_buffers(2).buffer_size(size);
        Pump::new(ChunkSource::new(chunks), config).unwrap()
    }

    #[tokio::test]
    async fn passthrough_refills_full_output_buffers() {
        let mut session = TransformSession::new(pump_of(["hello", " ", "world"], 3), Passthrough);
        let chunks = drain(&mut session, 4).await.unwrap();

        assert_eq!(chunks.concat(), b"hello world");
        // every buffer but the last is full
        for chunk in &chunks[..chunks.len() - 1] {
            assert_eq!(chunk.len(), 4);
        }
        assert_eq!(session.totals(), (11, 11));
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn carried_state_survives_buffer_boundaries() {
        let mut session = TransformSession::new(pump_of(["abc"], 8), Doubler::default());
        let chunks = drain(&mut session, 3).await.unwrap();

        assert_eq!(chunks, vec![b"aab".to_vec(), b"bcc".to_vec()]);
        assert_eq!(session.totals(), (3, 6));
    }

    #[tokio::test]
    async fn flush_runs_until_nothing_is_produced() {
        let trailer = Trailer {
            trailer: b"<END>",
            sent: 0,
            flush_calls: 0,
        };
        let mut session = TransformSession::new(pump_of(["ab"], 8), trailer);
        let chunks = drain(&mut session, 2).await.unwrap();

        assert_eq!(chunks, vec![b"ab".to_vec(), b"<E".to_vec(), b"ND".to_vec(), b">".to_vec()]);
        // three productive flush steps plus the terminating one
        assert_eq!(session.transformer().flush_calls, 4);
    }

    #[tokio::test]
    async fn empty_input_yields_nothing() {
        let mut session = TransformSession::new(pump_of(Vec::<Vec<u8>>::new(), 8), Passthrough);
        assert!(drain(&mut session, 4).await.unwrap().is_empty());
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn overclaimed_input_is_a_protocol_error() {
        let mut session = TransformSession::new(pump_of(["abc"], 8), Liar);
        let err = drain(&mut session, 4).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn stalled_transformer_is_a_protocol_error() {
        let mut session = TransformSession::new(pump_of(["abc"], 8), Stuck);
        let err = drain(&mut session, 4).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m.contains("no progress")));
    }

    #[tokio::test]
    async fn upstream_error_ends_the_session_without_flushing() {
        let trailer = Trailer {
            trailer: b"!",
            sent: 0,
            flush_calls: 0,
        };
        let config = PumpConfig::default().max_buffers(2).buffer_size(8);
        let mut session = TransformSession::from_source(BrokenSource, config, trailer).unwrap();
        let mut buffer = Buffer::new(4);

        let err = session.pull(&mut buffer).await.unwrap_err();
        assert!(matches!(err, Error::Custom(ref m) if m == "upstream broke"));
        assert!(session.is_finished());

        buffer.clear();
        assert!(!session.pull(&mut buffer).await.unwrap());
        assert!(buffer.is_empty());
        assert_eq!(session.transformer().flush_calls, 0);
    }

    #[tokio::test]
    async fn failed_transformer_is_not_called_again() {
        let mut session = TransformSession::new(pump_of(["abc", "def"], 8), Faulty::default());
        let mut buffer = Buffer::new(4);

        assert!(session.pull(&mut buffer).await.is_err());
        buffer.clear();
        assert!(!session.pull(&mut buffer).await.unwrap());
        assert!(buffer.is_empty());
        assert_eq!(session.transformer().calls, 1);
    }

    proptest! {
        #[test]
        fn passthrough_round_trips_any_chunking(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 0..12),
            pump_size in 1usize..16,
            out_size in 1usize..16,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let produced = runtime.block_on(async {
                let mut session = TransformSession::new(pump_of(chunks.clone(), pump_size), Passthrough);
                drain(&mut session, out_size).await.unwrap().concat()
            });

            prop_assert_eq!(produced, chunks.concat());
        }
    }
}

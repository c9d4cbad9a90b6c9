//! Adapters between tokio I/O and the pull/push traits.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::traits::{Sink, Source};

/// Reads an [`AsyncRead`] into pulled buffers.
///
/// Every pull keeps reading until the buffer is full or the reader reaches
/// EOF, so chunks come out at buffer size except for the last one.
#[derive(Debug)]
pub struct ReaderSource<R> {
    reader: R,
    eof: bool,
}

impl<R> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, eof: false }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

#[async_trait]
impl<R> Source for ReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn pull(&mut self, buffer: &mut Buffer) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }

        let start = buffer.len();
        while !buffer.is_full() {
            let read = self.reader.read(buffer.spare_mut()).await?;
            if read == 0 {
                debug!("reader source hit eof");
                self.eof = true;
                break;
            }
            buffer.advance(read);
        }

        Ok(buffer.len() > start || !self.eof)
    }
}

/// Writes pushed chunks to an [`AsyncWrite`].
///
/// Writes are serialized. `end` flushes and shuts the writer down; writes
/// after that fail with [`Error::Closed`].
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: Mutex<W>,
    ended: AtomicBool,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            ended: AtomicBool::new(false),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> Sink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&self, data: &[u8]) -> Result<()> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.writer.lock().await.write_all(data).await?;
        Ok(())
    }

    async fn end(&self) -> Result<()> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        writer.flush().await?;
        writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reader_source_fills_whole_buffers() {
        let data: &[u8] = b"0123456789";
        let mut source = ReaderSource::new(data);
        let mut buffer = Buffer::new(4);
        let mut chunks = Vec::new();

        loop {
            buffer.clear();
            if !source.pull(&mut buffer).await.unwrap() {
                break;
            }
            chunks.push(buffer.to_vec());
        }

        assert_eq!(chunks, vec![b"0123".to_vec(), b"4567".to_vec(), b"89".to_vec()]);
    }

    #[tokio::test]
    async fn writer_sink_rejects_writes_after_end() {
        let sink = WriterSink::new(Vec::new());
        sink.write(b"abc").await.unwrap();
        sink.write(b"def").await.unwrap();
        sink.end().await.unwrap();
        sink.end().await.unwrap();

        assert!(matches!(sink.write(b"x").await, Err(Error::Closed)));
        assert_eq!(sink.into_inner(), b"abcdef");
    }
}

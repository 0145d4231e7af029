//! Chunked transfers with backpressure, cancellation and progress.
//!
//! Sources are any [`AsyncRead`], sinks any [`AsyncWrite`].  A sink signals
//! backpressure by returning `Pending` from `poll_write`; every chunk is
//! awaited in full before the next one is sent, and completion is only
//! reported after `flush` + `shutdown` succeed.
//!
//! The cancellation token is checked between chunks.  A cancelled transfer
//! stops sending/receiving immediately and returns [`FsError::Cancelled`];
//! bytes already delivered to the remote are left as they are.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{FsError, FsResult};

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Callback invoked with the cumulative number of bytes moved so far.
pub type ProgressFn<'a> = dyn Fn(u64) + Send + Sync + 'a;

/// Parameters of one chunked transfer.
#[derive(Clone)]
pub struct Transfer<'a> {
    chunk_size: usize,
    cancel: CancellationToken,
    progress: Option<&'a ProgressFn<'a>>,
}

impl Default for Transfer<'_> {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl<'a> Transfer<'a> {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Abort the transfer (between chunks) once `token` is cancelled.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn on_progress(mut self, progress: &'a ProgressFn<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn checkpoint(&self, moved: u64) -> FsResult<()> {
        if self.cancel.is_cancelled() {
            debug!(bytes = moved, "transfer cancelled");
            return Err(FsError::Cancelled);
        }
        Ok(())
    }

    fn report(&self, moved: u64) {
        if let Some(progress) = self.progress {
            progress(moved);
        }
    }

    /// Drain `source` into memory.
    pub async fn read_streamed<R>(&self, source: &mut R) -> FsResult<Bytes>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut out = BytesMut::new();
        let mut chunk = vec![0u8; self.chunk_size];
        loop {
            self.checkpoint(out.len() as u64)?;
            let n = fill(source, &mut chunk).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
            self.report(out.len() as u64);
        }
        Ok(out.freeze())
    }

    /// Push `data` into `sink` one chunk at a time, then flush and close it.
    pub async fn write_streamed<W>(&self, sink: &mut W, data: &[u8]) -> FsResult<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut sent = 0u64;
        for piece in data.chunks(self.chunk_size) {
            self.checkpoint(sent)?;
            sink.write_all(piece).await?;
            sent += piece.len() as u64;
            self.report(sent);
        }
        self.checkpoint(sent)?;
        sink.flush().await?;
        sink.shutdown().await?;
        Ok(())
    }

    /// Pipe `source` into `sink` without buffering more than one chunk.
    /// Returns the number of bytes copied.
    pub async fn copy_streamed<R, W>(&self, source: &mut R, sink: &mut W) -> FsResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut chunk = vec![0u8; self.chunk_size];
        let mut copied = 0u64;
        loop {
            self.checkpoint(copied)?;
            let n = fill(source, &mut chunk).await?;
            if n == 0 {
                break;
            }
            sink.write_all(&chunk[..n]).await?;
            copied += n as u64;
            self.report(copied);
        }
        sink.flush().await?;
        sink.shutdown().await?;
        Ok(copied)
    }
}

/// Read until `buf` is full or the source is exhausted.
async fn fill<R>(source: &mut R, buf: &mut [u8]) -> FsResult<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    /// A sink that accepts at most `limit` bytes per call and stalls every
    /// other call, recording the size of every accepted write.
    #[derive(Default)]
    struct SlowSink {
        data: Vec<u8>,
        writes: Vec<usize>,
        limit: usize,
        stall: bool,
        stalls: usize,
        shut: bool,
    }

    impl SlowSink {
        fn new(limit: usize) -> Self {
            Self {
                limit,
                ..Self::default()
            }
        }
    }

    impl AsyncWrite for SlowSink {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            if this.stall {
                this.stall = false;
                this.stalls += 1;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            this.stall = true;
            let n = buf.len().min(this.limit);
            this.data.extend_from_slice(&buf[..n]);
            this.writes.push(n);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.get_mut().shut = true;
            Poll::Ready(Ok(()))
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    // -- write_streamed -------------------------------------------------------

    #[tokio::test]
    async fn write_respects_backpressure_and_closes() {
        let data = payload(10_000);
        let mut sink = SlowSink::new(700);
        Transfer::new(1024)
            .write_streamed(&mut sink, &data)
            .await
            .unwrap();

        assert_eq!(sink.data, data);
        assert!(sink.writes.iter().all(|&n| n <= 700));
        assert!(sink.stalls > 0);
        assert!(sink.shut);
    }

    #[tokio::test]
    async fn write_reports_cumulative_progress_per_chunk() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = {
            let seen = Arc::clone(&seen);
            move |n: u64| seen.lock().unwrap().push(n)
        };
        let mut sink = SlowSink::new(usize::MAX);
        Transfer::new(4)
            .on_progress(&record)
            .write_streamed(&mut sink, b"0123456789")
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![4, 8, 10]);
    }

    #[tokio::test]
    async fn cancelled_write_stops_between_chunks() {
        let token = CancellationToken::new();
        let cancel_after_first = {
            let token = token.clone();
            move |_: u64| token.cancel()
        };
        let mut sink = SlowSink::new(usize::MAX);
        let err = Transfer::new(4)
            .cancel_on(token)
            .on_progress(&cancel_after_first)
            .write_streamed(&mut sink, b"0123456789")
            .await
            .unwrap_err();

        assert!(matches!(err, FsError::Cancelled));
        assert_eq!(sink.data, b"0123");
        assert!(!sink.shut);
    }

    // -- read_streamed --------------------------------------------------------

    #[tokio::test]
    async fn read_accumulates_everything() {
        let data = payload(5_000);
        let mut source: &[u8] = &data;
        let seen = Mutex::new(Vec::new());
        let record = |n: u64| seen.lock().unwrap().push(n);
        let out = Transfer::new(2048)
            .on_progress(&record)
            .read_streamed(&mut source)
            .await
            .unwrap();
        assert_eq!(out, data);
        assert_eq!(*seen.lock().unwrap(), vec![2048, 4096, 5000]);
    }

    #[tokio::test]
    async fn read_of_empty_source_is_empty() {
        let mut source: &[u8] = b"";
        let out = Transfer::default().read_streamed(&mut source).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn pre_cancelled_read_fails_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let mut source: &[u8] = b"data";
        let err = Transfer::default()
            .cancel_on(token)
            .read_streamed(&mut source)
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Cancelled));
    }

    // -- copy_streamed --------------------------------------------------------

    #[tokio::test]
    async fn copy_pipes_source_to_sink() {
        let data = payload(9_999);
        let mut source: &[u8] = &data;
        let mut sink = SlowSink::new(512);
        let copied = Transfer::new(1000)
            .copy_streamed(&mut source, &mut sink)
            .await
            .unwrap();
        assert_eq!(copied, 9_999);
        assert_eq!(sink.data, data);
        assert!(sink.shut);
    }
}

//! Inbound byte queue for one logical connection.
//!
//! Writers never block: the session's read loop appends whatever arrives.
//! Readers wait until bytes are queued, the buffer is closed, or the read
//! deadline passes. Once closed, queued bytes are still drained before the
//! close error is reported.

use crate::config::MAX_BUFFER;
use bytes::BytesMut;
use dialer_wire::StreamError;
use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use tokio::io::ReadBuf;
use tokio::time::{Instant, Sleep};

#[derive(Debug, Default)]
struct Inner {
    buf: BytesMut,
    peak: usize,
    deadline: Option<Instant>,
    err: Option<StreamError>,
    waiters: Vec<Waker>,
}

impl Inner {
    fn wake_all(&mut self) {
        for waker in self.waiters.drain(..) {
            waker.wake();
        }
    }

    fn register(&mut self, waker: &Waker) {
        if !self.waiters.iter().any(|w| w.will_wake(waker)) {
            self.waiters.push(waker.clone());
        }
    }
}

/// Deadline timer owned by one reader
pub(crate) type ReadTimer = Option<Pin<Box<Sleep>>>;

/// Flow-controlled receive queue with a close latch
#[derive(Debug)]
pub struct ReadBuffer {
    id: i64,
    compact_threshold: usize,
    inner: Mutex<Inner>,
}

impl ReadBuffer {
    /// Create an empty buffer for connection `id`
    pub fn new(id: i64) -> Self {
        Self::with_compact_threshold(id, MAX_BUFFER / 8)
    }

    /// Create an empty buffer that drops idle storage above `compact_threshold`
    pub fn with_compact_threshold(id: i64, compact_threshold: usize) -> Self {
        Self {
            id,
            compact_threshold,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means another reader panicked mid-copy
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connection id this buffer belongs to
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Append `data` and wake waiting readers.
    ///
    /// Fails with the close error once the buffer has been closed.
    pub fn write(&self, data: &[u8]) -> Result<(), StreamError> {
        let mut inner = self.lock();
        if let Some(err) = &inner.err {
            return Err(err.clone());
        }
        if !data.is_empty() {
            inner.buf.extend_from_slice(data);
            inner.peak = inner.peak.max(inner.buf.len());
            inner.wake_all();
        }
        Ok(())
    }

    /// Read at least one byte into `dst`, waiting as needed
    pub async fn read(&self, dst: &mut [u8]) -> Result<usize, StreamError> {
        if dst.is_empty() {
            return Ok(0);
        }
        let mut timer: ReadTimer = None;
        let mut read_buf = ReadBuf::new(dst);
        poll_fn(|cx| self.poll_read(cx, &mut read_buf, &mut timer)).await?;
        Ok(read_buf.filled().len())
    }

    /// Poll for queued bytes, copying as many as fit into `dst`
    pub(crate) fn poll_read(
        &self,
        cx: &mut Context<'_>,
        dst: &mut ReadBuf<'_>,
        timer: &mut ReadTimer,
    ) -> Poll<Result<(), StreamError>> {
        let mut inner = self.lock();

        if !inner.buf.is_empty() {
            let n = inner.buf.len().min(dst.remaining());
            let chunk = inner.buf.split_to(n);
            dst.put_slice(&chunk);
            *timer = None;
            return Poll::Ready(Ok(()));
        }

        if inner.peak > self.compact_threshold {
            inner.buf = BytesMut::new();
            inner.peak = 0;
        }

        if let Some(err) = &inner.err {
            *timer = None;
            return Poll::Ready(Err(err.clone()));
        }

        match inner.deadline {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    *timer = None;
                    return Poll::Ready(Err(StreamError::DeadlineExceeded));
                }
                let stale = timer
                    .as_ref()
                    .map_or(true, |sleep| sleep.deadline() != deadline);
                if stale {
                    *timer = Some(Box::pin(tokio::time::sleep_until(deadline)));
                }
                if let Some(sleep) = timer.as_mut() {
                    if sleep.as_mut().poll(cx).is_ready() {
                        *timer = None;
                        return Poll::Ready(Err(StreamError::DeadlineExceeded));
                    }
                }
            }
            None => *timer = None,
        }

        inner.register(cx.waker());
        Poll::Pending
    }

    /// Set or clear the absolute read deadline, waking blocked readers
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        let mut inner = self.lock();
        inner.deadline = deadline;
        inner.wake_all();
    }

    /// Current read deadline
    pub fn deadline(&self) -> Option<Instant> {
        self.lock().deadline
    }

    /// Latch `err` (first close wins) and wake every reader.
    ///
    /// `None` is recorded as [`StreamError::ClosedPipe`]. Returns whether this
    /// call set the latch.
    pub fn close(&self, err: Option<StreamError>) -> bool {
        let mut inner = self.lock();
        let latched = inner.err.is_none();
        if latched {
            inner.err = Some(err.unwrap_or(StreamError::ClosedPipe));
        }
        inner.wake_all();
        latched
    }

    /// Bytes queued and not yet read
    pub fn buffered(&self) -> usize {
        self.lock().buf.len()
    }

    /// Close error, if the buffer has been closed
    pub fn error(&self) -> Option<StreamError> {
        self.lock().err.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_across_chunk_sizes() {
        let buffer = ReadBuffer::new(1);
        buffer.write(b"hello ").unwrap();
        buffer.write(b"multiplexed ").unwrap();
        buffer.write(b"world").unwrap();

        let mut out = Vec::new();
        let mut chunk = [0u8; 4];
        while out.len() < 23 {
            let n = buffer.read(&mut chunk).await.unwrap();
            assert!(n > 0);
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, b"hello multiplexed world");
    }

    #[tokio::test]
    async fn test_partial_read_returns_what_is_available() {
        let buffer = ReadBuffer::new(1);
        buffer.write(b"abc").unwrap();
        let mut dst = [0u8; 64];
        assert_eq!(buffer.read(&mut dst).await.unwrap(), 3);
        assert_eq!(&dst[..3], b"abc");
    }

    #[tokio::test]
    async fn test_blocked_reader_wakes_on_write() {
        let buffer = Arc::new(ReadBuffer::new(1));
        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut dst = [0u8; 8];
                let n = buffer.read(&mut dst).await.unwrap();
                dst[..n].to_vec()
            })
        };
        tokio::task::yield_now().await;
        buffer.write(b"late").unwrap();
        assert_eq!(reader.await.unwrap(), b"late");
    }

    #[tokio::test]
    async fn test_close_drains_then_errors() {
        let buffer = ReadBuffer::new(1);
        buffer.write(b"abcdef").unwrap();
        assert!(buffer.close(Some(StreamError::other("boom"))));

        let mut dst = [0u8; 4];
        assert_eq!(buffer.read(&mut dst).await.unwrap(), 4);
        assert_eq!(buffer.read(&mut dst).await.unwrap(), 2);
        for _ in 0..3 {
            assert_eq!(
                buffer.read(&mut dst).await,
                Err(StreamError::Other("boom".to_string()))
            );
        }
    }

    #[tokio::test]
    async fn test_first_close_wins() {
        let buffer = ReadBuffer::new(1);
        assert!(buffer.close(None));
        assert!(!buffer.close(Some(StreamError::Eof)));
        assert_eq!(buffer.error(), Some(StreamError::ClosedPipe));
        assert_eq!(buffer.write(b"x"), Err(StreamError::ClosedPipe));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let buffer = Arc::new(ReadBuffer::new(1));
        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut dst = [0u8; 8];
                buffer.read(&mut dst).await
            })
        };
        tokio::task::yield_now().await;
        buffer.close(Some(StreamError::Eof));
        assert_eq!(reader.await.unwrap(), Err(StreamError::Eof));
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_fails_immediately() {
        let buffer = ReadBuffer::new(1);
        buffer.set_deadline(Some(Instant::now() - Duration::from_millis(1)));
        let mut dst = [0u8; 8];
        assert_eq!(buffer.read(&mut dst).await, Err(StreamError::DeadlineExceeded));

        // Queued data still wins over an expired deadline
        buffer.write(b"ok").unwrap();
        assert_eq!(buffer.read(&mut dst).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_deadline_elapses() {
        let buffer = ReadBuffer::new(1);
        let start = Instant::now();
        let deadline = start + Duration::from_secs(5);
        buffer.set_deadline(Some(deadline));

        let mut dst = [0u8; 8];
        assert_eq!(buffer.read(&mut dst).await, Err(StreamError::DeadlineExceeded));
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_secs(5));
        assert!(waited < Duration::from_secs(6));

        // The connection stays usable after a timeout
        buffer.set_deadline(None);
        buffer.write(b"again").unwrap();
        assert_eq!(buffer.read(&mut dst).await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extending_deadline_rearms_waiter() {
        let buffer = Arc::new(ReadBuffer::new(1));
        let start = Instant::now();
        buffer.set_deadline(Some(start + Duration::from_secs(1)));

        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut dst = [0u8; 8];
                buffer.read(&mut dst).await
            })
        };
        tokio::task::yield_now().await;
        buffer.set_deadline(Some(start + Duration::from_secs(10)));

        assert_eq!(reader.await.unwrap(), Err(StreamError::DeadlineExceeded));
        assert!(Instant::now() - start >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_idle_storage_compacted() {
        let buffer = ReadBuffer::with_compact_threshold(1, 16);
        buffer.write(&[1u8; 1024]).unwrap();
        let mut dst = vec![0u8; 1024];
        assert_eq!(buffer.read(&mut dst).await.unwrap(), 1024);

        buffer.set_deadline(Some(Instant::now()));
        assert_eq!(buffer.read(&mut dst).await, Err(StreamError::DeadlineExceeded));
        assert_eq!(buffer.lock().peak, 0);
        assert_eq!(buffer.lock().buf.capacity(), 0);

        buffer.set_deadline(None);
        buffer.write(b"after").unwrap();
        assert_eq!(buffer.read(&mut dst).await.unwrap(), 5);
    }
}

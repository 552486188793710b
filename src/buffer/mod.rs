// Bounded byte queue between a tuner producer and a consumer engine.
//
// Single producer, single consumer. The producer pushes raw transport-stream
// bytes as they arrive from the network; the consumer drains them in large
// transfers. Capacity is preallocated; a full buffer parks the writer rather
// than dropping data.

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("stream buffer is closed")]
    Closed,
}

struct RingState {
    buf: Vec<u8>,
    /// Index of the next byte to read.
    head: usize,
    /// Number of readable bytes.
    len: usize,
    closed: bool,
}

/// Fixed-capacity ring buffer with async blocking semantics.
///
/// Exactly one task may write and exactly one task may read; that restriction
/// is a hard precondition, not something the buffer detects.
pub struct StreamRing {
    state: Mutex<RingState>,
    not_empty: Notify,
    not_full: Notify,
}

impl StreamRing {
    /// Preallocates `capacity` bytes. `capacity` must be non-zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            state: Mutex::new(RingState {
                buf: vec![0u8; capacity],
                head: 0,
                len: 0,
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        // The lock is only held for cursor arithmetic; a poisoned lock can
        // only come from a panic inside that arithmetic, so keep the state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().buf.len()
    }

    /// Bytes currently readable without waiting.
    pub fn read_available(&self) -> usize {
        self.lock().len
    }

    /// Free space currently writable without waiting.
    pub fn write_available(&self) -> usize {
        let state = self.lock();
        state.buf.len() - state.len
    }

    /// Appends all of `src`, waiting while the buffer is full.
    ///
    /// Fails with [`BufferError::Closed`] once the buffer has been closed;
    /// bytes are never silently dropped.
    pub async fn write(&self, mut src: &[u8]) -> Result<(), BufferError> {
        while !src.is_empty() {
            let not_full = self.not_full.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    return Err(BufferError::Closed);
                }
                let cap = state.buf.len();
                let space = cap - state.len;
                if space > 0 {
                    let n = space.min(src.len());
                    let tail = (state.head + state.len) % cap;
                    let first = n.min(cap - tail);
                    state.buf[tail..tail + first].copy_from_slice(&src[..first]);
                    state.buf[..n - first].copy_from_slice(&src[first..n]);
                    state.len += n;
                    src = &src[n..];
                    self.not_empty.notify_one();
                    continue;
                }
            }
            not_full.await;
        }
        Ok(())
    }

    /// Copies up to `dst.len()` bytes out, waiting while the buffer is empty.
    ///
    /// Returns the number of bytes copied. After [`close`](Self::close) the
    /// remaining bytes drain normally; once empty, reads report
    /// [`BufferError::Closed`].
    pub async fn read(&self, dst: &mut [u8]) -> Result<usize, BufferError> {
        if dst.is_empty() {
            return Ok(0);
        }
        loop {
            let not_empty = self.not_empty.notified();
            {
                let mut state = self.lock();
                if state.len > 0 {
                    let cap = state.buf.len();
                    let n = state.len.min(dst.len());
                    let first = n.min(cap - state.head);
                    dst[..first].copy_from_slice(&state.buf[state.head..state.head + first]);
                    dst[first..n].copy_from_slice(&state.buf[..n - first]);
                    state.head = (state.head + n) % cap;
                    state.len -= n;
                    self.not_full.notify_one();
                    return Ok(n);
                }
                if state.closed {
                    return Err(BufferError::Closed);
                }
            }
            not_empty.await;
        }
    }

    /// Closes the buffer and wakes all waiters. Idempotent.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_one();
        self.not_full.notify_one();
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Resets the cursors and the closed flag, leaving a fresh buffer.
    ///
    /// Only safe while no task is reading or writing; calling it concurrently
    /// with `read`/`write` is a programmer error.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.head = 0;
        state.len = 0;
        state.closed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn transfers_bytes_in_order() {
        let ring = Arc::new(StreamRing::new(64));
        let input: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

        let writer = {
            let ring = ring.clone();
            let input = input.clone();
            tokio::spawn(async move {
                ring.write(&input).await.unwrap();
                ring.close();
            })
        };

        let mut out = Vec::new();
        let mut buf = [0u8; 48];
        loop {
            match ring.read(&mut buf).await {
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(BufferError::Closed) => break,
            }
        }
        writer.await.unwrap();
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn close_drains_then_reports_closed() {
        let ring = StreamRing::new(16);
        ring.write(b"abc").await.unwrap();
        ring.close();

        assert_eq!(ring.write(b"x").await, Err(BufferError::Closed));

        let mut buf = [0u8; 16];
        let n = ring.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");
        assert_eq!(ring.read(&mut buf).await, Err(BufferError::Closed));
    }

    #[tokio::test]
    async fn clear_restores_a_fresh_buffer() {
        let ring = StreamRing::new(8);
        ring.write(b"junk").await.unwrap();
        ring.close();
        ring.clear();

        assert_eq!(ring.read_available(), 0);
        ring.write(b"data").await.unwrap();
        let mut buf = [0u8; 8];
        let n = ring.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"data");
    }

    #[tokio::test]
    async fn writer_blocks_until_reader_makes_room() {
        let ring = Arc::new(StreamRing::new(4));
        ring.write(b"full").await.unwrap();

        let writer = {
            let ring = ring.clone();
            tokio::spawn(async move { ring.write(b"more").await })
        };
        // The writer cannot finish until we drain.
        tokio::task::yield_now().await;
        assert!(!writer.is_finished());

        let mut buf = [0u8; 8];
        let mut drained = Vec::new();
        while drained.len() < 8 {
            let n = ring.read(&mut buf).await.unwrap();
            drained.extend_from_slice(&buf[..n]);
        }
        writer.await.unwrap().unwrap();
        assert_eq!(drained, b"fullmore");
    }

    #[tokio::test]
    async fn available_snapshots_track_cursors() {
        let ring = StreamRing::new(10);
        assert_eq!(ring.read_available(), 0);
        assert_eq!(ring.write_available(), 10);

        ring.write(b"1234").await.unwrap();
        assert_eq!(ring.read_available(), 4);
        assert_eq!(ring.write_available(), 6);
    }
}

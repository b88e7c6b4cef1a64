//! Growable byte buffer shared between one producer and one decoder thread.
//!
//! The producer appends chunks as they arrive and finally completes the
//! buffer (optionally with an error). The consumer reads at arbitrary
//! offsets and blocks until enough bytes exist or the buffer is complete.

use std::{
    io::{self, Read},
    sync::Arc,
};

use parking_lot::{Condvar, Mutex};

use super::decode::PackSource;

#[derive(Debug, Default)]
struct State {
    data: Vec<u8>,
    completed: bool,
    producer_error: Option<String>,
    consumer_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct SharedBuffer {
    state: Mutex<State>,
    cv: Condvar,
}

impl SharedBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append bytes and wake a waiting reader. Ignored once completed.
    pub fn append(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        if state.completed {
            tracing::warn!("dropping {} bytes appended after completion", bytes.len());
            return;
        }
        state.data.extend_from_slice(bytes);
        self.cv.notify_all();
    }

    /// Mark the end of input. An error aborts every pending and future read.
    pub fn complete(&self, error: Option<String>) {
        let mut state = self.state.lock();
        if state.completed {
            return;
        }
        state.completed = true;
        state.producer_error = error;
        self.cv.notify_all();
    }

    /// Record that the reading side gave up; producers should stop writing.
    pub fn fail_consumer(&self, error: String) {
        let mut state = self.state.lock();
        state.consumer_error.get_or_insert(error);
    }

    pub fn consumer_error(&self) -> Option<String> {
        self.state.lock().consumer_error.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().completed
    }

    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` from `offset`, blocking until the whole range is available
    /// or the buffer is complete. Returns the number of bytes copied.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let want = offset.saturating_add(buf.len() as u64);
        self.read_when(offset, buf, |len| len >= want)
    }

    /// Like [`read_at`](Self::read_at) but returns as soon as any byte past
    /// `offset` is available.
    pub fn read_some_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let empty = buf.is_empty();
        self.read_when(offset, buf, move |len| empty || len > offset)
    }

    fn read_when(
        &self,
        offset: u64,
        buf: &mut [u8],
        ready: impl Fn(u64) -> bool,
    ) -> io::Result<usize> {
        let mut state = self.state.lock();
        loop {
            if let Some(error) = &state.producer_error {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, error.clone()));
            }
            if state.completed || ready(state.data.len() as u64) {
                break;
            }
            self.cv.wait(&mut state);
        }

        let len = state.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(state.data.len() - start);
        buf[..n].copy_from_slice(&state.data[start..start + n]);
        Ok(n)
    }

    /// Take the accumulated bytes, leaving the buffer empty.
    pub fn take_bytes(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().data)
    }

    pub fn reader(self: &Arc<Self>) -> BufferReader {
        BufferReader {
            buffer: Arc::clone(self),
            position: 0,
        }
    }
}

/// Positioned reader over a [`SharedBuffer`]; seekable because every
/// appended byte is kept.
pub struct BufferReader {
    buffer: Arc<SharedBuffer>,
    position: u64,
}

impl Read for BufferReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.buffer.read_some_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl PackSource for BufferReader {
    fn is_seekable(&self) -> bool {
        true
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.position = offset;
        Ok(())
    }
}

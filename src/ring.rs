//! Line-aware ring buffer and a blocking single-producer/single-reader pipe
//! built on top of it.
//!
//! `fetch.rs` feeds a `git fetch`'s sideband progress text through a
//! `LinePipe` so it can be drained and logged on a background thread without
//! ever blocking the fetch itself on a slow reader.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// A fixed-capacity byte buffer that only ever holds whole lines.
///
/// Pushing a line that would overflow capacity evicts the oldest lines (not
/// partial ones) until there's room, or until the new line itself exceeds
/// capacity, in which case it's truncated to the buffer's capacity.
pub struct LineRingBuffer {
    capacity: usize,
    used: usize,
    lines: VecDeque<Vec<u8>>,
}

impl LineRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            lines: VecDeque::new(),
        }
    }

    /// Appends a single line (without its trailing newline) to the buffer,
    /// evicting the oldest lines as needed to stay within capacity.
    pub fn push_line(&mut self, mut line: Vec<u8>) {
        if line.len() > self.capacity {
            line.truncate(self.capacity);
        }

        while self.used + line.len() > self.capacity {
            match self.lines.pop_front() {
                Some(evicted) => self.used -= evicted.len(),
                None => break,
            }
        }

        self.used += line.len();
        self.lines.push_back(line);
    }

    /// Splits `data` on `\n` and pushes each resulting line; a trailing
    /// partial line (no terminating newline) is returned so the caller can
    /// prepend it to the next chunk.
    pub fn push_chunk(&mut self, data: &[u8], carry: Vec<u8>) -> Vec<u8> {
        let mut carry = carry;
        carry.extend_from_slice(data);

        let mut start = 0;
        while let Some(pos) = memchr::memchr(b'\n', &carry[start..]) {
            let end = start + pos;
            self.push_line(carry[start..end].to_vec());
            start = end + 1;
        }

        carry.drain(..start);
        carry
    }

    pub fn lines(&self) -> impl Iterator<Item = &[u8]> {
        self.lines.iter().map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

struct PipeState {
    buffer: LineRingBuffer,
    carry: Vec<u8>,
    closed: bool,
}

/// A single-producer/single-reader blocking pipe of complete lines, backed
/// by a [`LineRingBuffer`].
///
/// The producer writes raw byte chunks; the reader drains whole lines,
/// blocking (via a [`Condvar`]) when none are available yet. Closing the
/// pipe wakes any blocked reader so it can observe end-of-stream.
pub struct LinePipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl LinePipe {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PipeState {
                buffer: LineRingBuffer::new(capacity),
                carry: Vec::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        })
    }

    /// Writes a chunk of bytes from the producer side. Never blocks.
    pub fn write(&self, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        let carry = std::mem::take(&mut state.carry);
        state.carry = state.buffer.push_chunk(data, carry);
        self.ready.notify_one();
    }

    /// Signals end-of-stream; wakes a blocked reader.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.ready.notify_one();
    }

    /// Blocks until at least one line is available or the pipe is closed,
    /// then drains and returns all currently buffered lines. Returns `None`
    /// once the pipe is closed and drained.
    pub fn read_lines(&self) -> Option<Vec<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.buffer.is_empty() {
                let drained: Vec<Vec<u8>> = state.buffer.lines().map(|l| l.to_vec()).collect();
                state.buffer = LineRingBuffer::new(state.buffer.capacity);
                return Some(drained);
            }
            if state.closed {
                return None;
            }
            state = self.ready.wait(state).unwrap();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn ring_buffer_evicts_oldest_whole_lines() {
        let mut rb = LineRingBuffer::new(10);
        rb.push_line(b"aaaa".to_vec());
        rb.push_line(b"bbbb".to_vec());
        // Pushing "cccc" (4 bytes) would put us at 12 > 10, so "aaaa" is evicted.
        rb.push_line(b"cccc".to_vec());

        let lines: Vec<&[u8]> = rb.lines().collect();
        assert_eq!(lines, vec![b"bbbb".as_ref(), b"cccc".as_ref()]);
    }

    #[test]
    fn ring_buffer_truncates_oversized_line() {
        let mut rb = LineRingBuffer::new(4);
        rb.push_line(b"way too long".to_vec());
        assert_eq!(rb.lines().next().unwrap(), b"way ");
    }

    #[test]
    fn push_chunk_carries_partial_line() {
        let mut rb = LineRingBuffer::new(100);
        let carry = rb.push_chunk(b"hello wor", Vec::new());
        assert_eq!(carry, b"hello wor");
        assert!(rb.is_empty());

        let carry = rb.push_chunk(b"ld\nsecond\nthi", carry);
        assert_eq!(carry, b"thi");

        let lines: Vec<&[u8]> = rb.lines().collect();
        assert_eq!(lines, vec![b"hello world".as_ref(), b"second".as_ref()]);
    }

    #[test]
    fn pipe_blocks_reader_until_write() {
        let pipe = LinePipe::new(1024);
        let reader_pipe = pipe.clone();

        let handle = thread::spawn(move || reader_pipe.read_lines());

        thread::sleep(Duration::from_millis(20));
        pipe.write(b"one\ntwo\n");

        let lines = handle.join().unwrap().expect("pipe not closed");
        assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn pipe_read_returns_none_after_close_when_drained() {
        let pipe = LinePipe::new(1024);
        pipe.write(b"only\n");
        assert_eq!(pipe.read_lines(), Some(vec![b"only".to_vec()]));

        pipe.close();
        assert_eq!(pipe.read_lines(), None);
    }
}

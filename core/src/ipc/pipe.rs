//! Unidirectional pipes.
//!
//! One bounded byte queue shared by a writer and a reader endpoint. When
//! either side closes, the pipe is broken: remaining bytes drain, then
//! reads report end-of-file and writes fail. Blocking sides park on the
//! pipe's wait queues rather than spinning.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use axerrno::{LinuxError, LinuxResult};
use ringbuf::{
    HeapRb,
    traits::{Consumer, Observer, Producer},
};
use spin::Mutex;

use crate::config::PIPE_BUF_SIZE;
use crate::sched::WaitQueue;

struct Shared {
    buffer: Mutex<HeapRb<u8>>,
    broken: AtomicBool,
    /// Readers sleeping for bytes.
    rd_wq: WaitQueue,
    /// Writers sleeping for room.
    wr_wq: WaitQueue,
}

impl Shared {
    fn broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    fn hang_up(&self) {
        self.broken.store(true, Ordering::Release);
        self.rd_wq.notify_all();
        self.wr_wq.notify_all();
    }
}

/// The read end of a pipe.
pub struct PipeReader {
    shared: Arc<Shared>,
    nonblocking: AtomicBool,
}

/// The write end of a pipe.
pub struct PipeWriter {
    shared: Arc<Shared>,
    nonblocking: AtomicBool,
}

/// Create a connected pipe pair. With `blocking` unset both endpoints start
/// in non-blocking mode.
pub fn pipe_pair(blocking: bool) -> (Arc<PipeReader>, Arc<PipeWriter>) {
    let shared = Arc::new(Shared {
        buffer: Mutex::new(HeapRb::new(PIPE_BUF_SIZE)),
        broken: AtomicBool::new(false),
        rd_wq: WaitQueue::new(),
        wr_wq: WaitQueue::new(),
    });
    (
        Arc::new(PipeReader {
            shared: shared.clone(),
            nonblocking: AtomicBool::new(!blocking),
        }),
        Arc::new(PipeWriter {
            shared,
            nonblocking: AtomicBool::new(!blocking),
        }),
    )
}

impl PipeReader {
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::Acquire)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Release);
    }

    /// Bytes queued and not yet read.
    pub fn bytes_available(&self) -> usize {
        self.shared.buffer.lock().occupied_len()
    }

    /// Whether the write side has gone away.
    pub fn is_broken(&self) -> bool {
        self.shared.broken()
    }

    /// Read at least one byte, or end-of-file once the pipe is broken and
    /// drained. Non-blocking reads on an empty pipe report `EAGAIN`.
    pub fn read(&self, buf: &mut [u8]) -> LinuxResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let nonblocking = self.is_nonblocking();
        self.shared.rd_wq.wait_until(|| {
            let n = self.shared.buffer.lock().pop_slice(buf);
            if n > 0 {
                self.shared.wr_wq.notify_all();
                Some(Ok(n))
            } else if self.shared.broken() {
                Some(Ok(0))
            } else if nonblocking {
                Some(Err(LinuxError::EAGAIN))
            } else {
                None
            }
        })
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.hang_up();
    }
}

impl PipeWriter {
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::Acquire)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Release);
    }

    /// Room left in the queue.
    pub fn bytes_free(&self) -> usize {
        self.shared.buffer.lock().vacant_len()
    }

    pub fn is_broken(&self) -> bool {
        self.shared.broken()
    }

    /// Copy `buf` into the pipe. A blocking writer parks until everything
    /// fits; a non-blocking writer transfers what it can and reports
    /// `EAGAIN` when nothing does.
    pub fn write(&self, buf: &[u8]) -> LinuxResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let nonblocking = self.is_nonblocking();
        let mut written = 0;
        self.shared.wr_wq.wait_until(|| {
            if self.shared.broken() {
                return Some(Err(LinuxError::EPIPE));
            }
            let n = self.shared.buffer.lock().push_slice(&buf[written..]);
            if n > 0 {
                written += n;
                self.shared.rd_wq.notify_all();
            }
            if written == buf.len() {
                Some(Ok(written))
            } else if nonblocking {
                if written > 0 {
                    Some(Ok(written))
                } else {
                    Some(Err(LinuxError::EAGAIN))
                }
            } else {
                None
            }
        })
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.hang_up();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonblocking_pair() -> (Arc<PipeReader>, Arc<PipeWriter>) {
        pipe_pair(false)
    }

    #[test]
    fn fifo_byte_order() {
        let (reader, writer) = nonblocking_pair();
        assert_eq!(writer.write(b"abc").unwrap(), 3);
        assert_eq!(writer.write(b"def").unwrap(), 3);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"abcdef");
    }

    #[test]
    fn empty_pipe_would_block() {
        let (reader, writer) = nonblocking_pair();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf), Err(LinuxError::EAGAIN));
        drop(writer);
        // Broken and empty: end of file, not an error.
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn broken_pipe_drains_then_eofs() {
        let (reader, writer) = nonblocking_pair();
        writer.write(b"tail").unwrap();
        drop(writer);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"tail");
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn write_after_reader_close_fails() {
        let (reader, writer) = nonblocking_pair();
        drop(reader);
        assert_eq!(writer.write(b"x"), Err(LinuxError::EPIPE));
    }

    #[test]
    fn full_pipe_would_block() {
        let (_reader, writer) = nonblocking_pair();
        let chunk = alloc::vec![0u8; PIPE_BUF_SIZE];
        assert_eq!(writer.write(&chunk).unwrap(), PIPE_BUF_SIZE);
        assert_eq!(writer.write(b"x"), Err(LinuxError::EAGAIN));
    }
}

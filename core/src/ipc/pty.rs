//! Pseudo-terminals.
//!
//! A PTY is a symmetric pair of byte queues: what the primary writes the
//! secondary reads and vice versa, with shared `termios` and window-size
//! state that either end can inspect or change through `ioctl`. Line
//! discipline is not interpreted; bytes pass through verbatim.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use axerrno::{LinuxError, LinuxResult};
use linux_raw_sys::general::{CS8, ECHO, ICANON, ICRNL, ISIG, ONLCR, OPOST, termios, winsize};
use ringbuf::{
    HeapRb,
    traits::{Consumer, Observer, Producer},
};
use spin::Mutex;

use crate::config::PIPE_BUF_SIZE;
use crate::sched::WaitQueue;

/// One direction of the pair.
struct Channel {
    buffer: Mutex<HeapRb<u8>>,
    rd_wq: WaitQueue,
    wr_wq: WaitQueue,
}

impl Channel {
    fn new() -> Self {
        Self {
            buffer: Mutex::new(HeapRb::new(PIPE_BUF_SIZE)),
            rd_wq: WaitQueue::new(),
            wr_wq: WaitQueue::new(),
        }
    }

    fn wake_all(&self) {
        self.rd_wq.notify_all();
        self.wr_wq.notify_all();
    }

    fn read(&self, buf: &mut [u8], nonblocking: bool, hup: &AtomicBool) -> LinuxResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.rd_wq.wait_until(|| {
            let n = self.buffer.lock().pop_slice(buf);
            if n > 0 {
                self.wr_wq.notify_all();
                Some(Ok(n))
            } else if hup.load(Ordering::Acquire) {
                Some(Ok(0))
            } else if nonblocking {
                Some(Err(LinuxError::EAGAIN))
            } else {
                None
            }
        })
    }

    fn write(&self, buf: &[u8], nonblocking: bool, hup: &AtomicBool) -> LinuxResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut written = 0;
        self.wr_wq.wait_until(|| {
            if hup.load(Ordering::Acquire) {
                return Some(Err(LinuxError::EPIPE));
            }
            let n = self.buffer.lock().push_slice(&buf[written..]);
            if n > 0 {
                written += n;
                self.rd_wq.notify_all();
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

fn default_termios() -> termios {
    // SAFETY: all-zero is a valid termios; the interesting flags follow.
    let mut tio: termios = unsafe { core::mem::zeroed() };
    tio.c_iflag = ICRNL;
    tio.c_oflag = OPOST | ONLCR;
    tio.c_cflag = CS8;
    tio.c_lflag = ICANON | ECHO | ISIG;
    tio
}

struct Shared {
    /// Primary -> secondary bytes.
    input: Channel,
    /// Secondary -> primary bytes.
    output: Channel,
    termios: Mutex<termios>,
    winsize: Mutex<winsize>,
    hup: AtomicBool,
    index: u32,
}

/// One side of a PTY pair.
pub struct PtyEndpoint {
    shared: Arc<Shared>,
    primary: bool,
    nonblocking: AtomicBool,
}

/// Create a PTY pair. `index` is the registry number (`ptyN`).
pub fn openpty(index: u32, blocking: bool) -> (Arc<PtyEndpoint>, Arc<PtyEndpoint>) {
    let shared = Arc::new(Shared {
        input: Channel::new(),
        output: Channel::new(),
        termios: Mutex::new(default_termios()),
        winsize: Mutex::new(winsize {
            ws_row: 24,
            ws_col: 80,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }),
        hup: AtomicBool::new(false),
        index,
    });
    (
        Arc::new(PtyEndpoint {
            shared: shared.clone(),
            primary: true,
            nonblocking: AtomicBool::new(!blocking),
        }),
        Arc::new(PtyEndpoint {
            shared,
            primary: false,
            nonblocking: AtomicBool::new(!blocking),
        }),
    )
}

impl PtyEndpoint {
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// The `N` of this pair's `ptyN` registry name.
    pub fn index(&self) -> u32 {
        self.shared.index
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::Acquire)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Release);
    }

    pub fn is_hung_up(&self) -> bool {
        self.shared.hup.load(Ordering::Acquire)
    }

    fn incoming(&self) -> &Channel {
        if self.primary {
            &self.shared.output
        } else {
            &self.shared.input
        }
    }

    fn outgoing(&self) -> &Channel {
        if self.primary {
            &self.shared.input
        } else {
            &self.shared.output
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> LinuxResult<usize> {
        self.incoming()
            .read(buf, self.is_nonblocking(), &self.shared.hup)
    }

    pub fn write(&self, buf: &[u8]) -> LinuxResult<usize> {
        self.outgoing()
            .write(buf, self.is_nonblocking(), &self.shared.hup)
    }

    /// Bytes waiting to be read on this end.
    pub fn bytes_available(&self) -> usize {
        self.incoming().buffer.lock().occupied_len()
    }

    /// Room left on the outgoing queue.
    pub fn bytes_free(&self) -> usize {
        self.outgoing().buffer.lock().vacant_len()
    }

    pub fn termios(&self) -> termios {
        *self.shared.termios.lock()
    }

    pub fn set_termios(&self, tio: termios) {
        *self.shared.termios.lock() = tio;
    }

    pub fn window_size(&self) -> winsize {
        *self.shared.winsize.lock()
    }

    pub fn set_window_size(&self, size: winsize) {
        *self.shared.winsize.lock() = size;
    }
}

/// Adapter exposing a PTY secondary through the device registry, so the
/// pair is addressable as `ptyN`.
struct PtyDevice(Arc<PtyEndpoint>);

impl crate::dev::DeviceOps for PtyDevice {
    fn read(&self, _offset: u64, buf: &mut [u8]) -> LinuxResult<usize> {
        self.0.read(buf)
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> LinuxResult<usize> {
        self.0.write(buf)
    }
}

/// Register `endpoint` as the device `ptyN`.
pub fn register_pty_device(endpoint: Arc<PtyEndpoint>) -> LinuxResult<crate::dev::DevHandle> {
    let name = alloc::format!("pty{}", endpoint.index());
    crate::dev::register(crate::dev::Device::new_char(name, Arc::new(PtyDevice(endpoint))))
}

impl Drop for PtyEndpoint {
    fn drop(&mut self) {
        self.shared.hup.store(true, Ordering::Release);
        self.shared.input.wake_all();
        self.shared.output.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_directions_carry_bytes() {
        let (primary, secondary) = openpty(0, false);
        primary.write(b"ls\n").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(secondary.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"ls\n");

        secondary.write(b"bin\n").unwrap();
        assert_eq!(primary.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"bin\n");
    }

    #[test]
    fn termios_and_winsize_are_shared() {
        let (primary, secondary) = openpty(1, false);
        let mut tio = primary.termios();
        assert_ne!(tio.c_lflag & ICANON, 0);
        tio.c_lflag &= !ICANON;
        secondary.set_termios(tio);
        assert_eq!(primary.termios().c_lflag & ICANON, 0);

        primary.set_window_size(winsize {
            ws_row: 50,
            ws_col: 132,
            ws_xpixel: 0,
            ws_ypixel: 0,
        });
        assert_eq!(secondary.window_size().ws_col, 132);
    }

    #[test]
    fn hangup_reaches_the_peer() {
        let (primary, secondary) = openpty(2, false);
        drop(primary);
        let mut buf = [0u8; 4];
        assert_eq!(secondary.read(&mut buf).unwrap(), 0);
        assert_eq!(secondary.write(b"x"), Err(LinuxError::EPIPE));
    }
}

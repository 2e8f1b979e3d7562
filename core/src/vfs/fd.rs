//! File descriptions and descriptors.
//!
//! A descriptor is a slot in a process FD table: a shared reference to one
//! of the five open-object kinds plus the close-on-exec flag. Cloning a
//! descriptor (`dup`, `fork`) shares the underlying object.

use alloc::string::String;
use alloc::sync::Arc;

use axerrno::{LinuxError, LinuxResult};

use super::file::{RegularFile, SeekFrom};
use super::{FileStat, NodeType, TimeSpec};
use crate::ipc::{PipeReader, PipeWriter, PtyEndpoint};

bitflags::bitflags! {
    /// Readiness of an open object, as reported by `poll`.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct IoEvents: u16 {
        const IN = 1 << 0;
        const OUT = 1 << 1;
        const HUP = 1 << 2;
        const ERR = 1 << 3;
    }
}

/// The open object behind a file descriptor.
#[derive(Clone)]
pub enum FileDescription {
    File(Arc<RegularFile>),
    PipeReader(Arc<PipeReader>),
    PipeWriter(Arc<PipeWriter>),
    PtyPrimary(Arc<PtyEndpoint>),
    PtySecondary(Arc<PtyEndpoint>),
}

impl FileDescription {
    pub fn read(&self, buf: &mut [u8]) -> LinuxResult<usize> {
        match self {
            Self::File(file) => file.read(buf),
            Self::PipeReader(pipe) => pipe.read(buf),
            Self::PipeWriter(_) => Err(LinuxError::EBADF),
            Self::PtyPrimary(pty) | Self::PtySecondary(pty) => pty.read(buf),
        }
    }

    pub fn write(&self, buf: &[u8]) -> LinuxResult<usize> {
        match self {
            Self::File(file) => file.write(buf),
            Self::PipeReader(_) => Err(LinuxError::EBADF),
            Self::PipeWriter(pipe) => pipe.write(buf),
            Self::PtyPrimary(pty) | Self::PtySecondary(pty) => pty.write(buf),
        }
    }

    pub fn seek(&self, from: SeekFrom) -> LinuxResult<u64> {
        match self {
            Self::File(file) => file.seek(from),
            _ => Err(LinuxError::ESPIPE),
        }
    }

    pub fn stat(&self) -> LinuxResult<FileStat> {
        match self {
            Self::File(file) => file.stat(),
            _ => Ok(FileStat {
                ino: 0,
                mode: 0o600,
                node_type: NodeType::CharDevice,
                nlink: 1,
                rdev: 0,
                size: 0,
                atime: TimeSpec::default(),
                mtime: TimeSpec::default(),
                ctime: TimeSpec::default(),
                io_block_size: crate::config::PAGE_SIZE as u32,
                io_block_count: 0,
            }),
        }
    }

    /// Pass-through ioctl for filesystem- and device-backed files. The
    /// terminal and pipe ioctls need user-memory access and are handled a
    /// layer up.
    pub fn ioctl(&self, cmd: u32, arg: usize) -> LinuxResult<usize> {
        match self {
            Self::File(file) => file.ioctl(cmd, arg),
            _ => Err(LinuxError::ENOTTY),
        }
    }

    /// Current readiness, without blocking.
    pub fn poll(&self) -> IoEvents {
        let mut events = IoEvents::empty();
        match self {
            Self::File(_) => {
                events |= IoEvents::IN | IoEvents::OUT;
            }
            Self::PipeReader(pipe) => {
                if pipe.bytes_available() > 0 {
                    events |= IoEvents::IN;
                }
                if pipe.is_broken() {
                    events |= IoEvents::HUP;
                }
            }
            Self::PipeWriter(pipe) => {
                if pipe.is_broken() {
                    events |= IoEvents::ERR;
                } else if pipe.bytes_free() > 0 {
                    events |= IoEvents::OUT;
                }
            }
            Self::PtyPrimary(pty) | Self::PtySecondary(pty) => {
                if pty.bytes_available() > 0 {
                    events |= IoEvents::IN;
                }
                if pty.bytes_free() > 0 {
                    events |= IoEvents::OUT;
                }
                if pty.is_hung_up() {
                    events |= IoEvents::HUP;
                }
            }
        }
        events
    }

    pub fn is_nonblocking(&self) -> bool {
        match self {
            Self::File(_) => false,
            Self::PipeReader(pipe) => pipe.is_nonblocking(),
            Self::PipeWriter(pipe) => pipe.is_nonblocking(),
            Self::PtyPrimary(pty) | Self::PtySecondary(pty) => pty.is_nonblocking(),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> LinuxResult<()> {
        match self {
            Self::File(_) => Ok(()),
            Self::PipeReader(pipe) => {
                pipe.set_nonblocking(nonblocking);
                Ok(())
            }
            Self::PipeWriter(pipe) => {
                pipe.set_nonblocking(nonblocking);
                Ok(())
            }
            Self::PtyPrimary(pty) | Self::PtySecondary(pty) => {
                pty.set_nonblocking(nonblocking);
                Ok(())
            }
        }
    }

    /// Absolute path, for objects that have one.
    pub fn path(&self) -> Option<String> {
        match self {
            Self::File(file) => Some(String::from(file.path())),
            _ => None,
        }
    }

    /// Whether this is a terminal, for `not_tty` checks.
    pub fn is_tty(&self) -> bool {
        matches!(self, Self::PtyPrimary(_) | Self::PtySecondary(_))
    }
}

/// One slot of a process FD table.
#[derive(Clone)]
pub struct FileDescriptor {
    pub description: FileDescription,
    pub close_on_exec: bool,
}

impl FileDescriptor {
    pub fn new(description: FileDescription, close_on_exec: bool) -> Self {
        Self {
            description,
            close_on_exec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::pipe_pair;

    #[test]
    fn dup_shares_the_underlying_object() {
        let (reader, writer) = pipe_pair(false);
        let fd = FileDescriptor::new(FileDescription::PipeWriter(writer), false);
        let dup = fd.clone();

        dup.description.write(b"via dup").unwrap();
        drop(fd);
        // The original still works after its sibling is closed.
        assert_eq!(dup.description.write(b"!").unwrap(), 1);

        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 8);
        assert_eq!(&buf[..8], b"via dup!");
    }

    #[test]
    fn poll_reflects_pipe_state() {
        let (reader, writer) = pipe_pair(false);
        let rd = FileDescription::PipeReader(reader);
        assert_eq!(rd.poll(), IoEvents::empty());
        writer.write(b"x").unwrap();
        assert_eq!(rd.poll(), IoEvents::IN);
        drop(writer);
        assert_eq!(rd.poll(), IoEvents::IN | IoEvents::HUP);
    }

    #[test]
    fn wrong_direction_is_rejected() {
        let (reader, writer) = pipe_pair(false);
        let rd = FileDescription::PipeReader(reader);
        let wr = FileDescription::PipeWriter(writer);
        assert!(matches!(rd.write(b"x"), Err(LinuxError::EBADF)));
        let mut buf = [0u8; 1];
        assert!(matches!(wr.read(&mut buf), Err(LinuxError::EBADF)));
        assert!(matches!(
            wr.seek(SeekFrom::Set(0)),
            Err(LinuxError::ESPIPE)
        ));
    }
}

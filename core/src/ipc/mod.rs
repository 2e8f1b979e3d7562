//! IPC primitives: pipes and pseudo-terminals.

mod pipe;
mod pty;

pub use pipe::{PipeReader, PipeWriter, pipe_pair};
pub use pty::{PtyEndpoint, openpty, register_pty_device};

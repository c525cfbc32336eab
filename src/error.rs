//! The crate-wide error type.
//!
//! Every pipe operation returns a typed error so that the fuzzing and replay
//! loops can react to the exact failure: a timeout is survivable, a closed
//! peer means the worker is likely dead, garbage after the handshake means
//! the worker is corrupting its side of the protocol.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No data arrived on the worker pipe within the per-call timeout.
    #[error("timed out after {0}s waiting for the worker pipe")]
    PipeTimeout(u64),

    /// The worker closed its end of the pipe.
    #[error("worker closed its end of the pipe")]
    PipePeerClosed,

    /// The pipe delivered fewer bytes than the frame requires.
    #[error("short read on the worker pipe ({got}/{want} bytes)")]
    PipeShortRead { want: usize, got: usize },

    /// The reserved opcode value 0 arrived on the wire.
    #[error("INVALID_OPCODE received on the wire")]
    PipeInvalidOpcode,

    /// The worker sent a value outside the protocol after the handshake:
    /// an unknown opcode, or an absurd length field.
    #[error("worker sent garbage [{0}]")]
    WorkerGarbage(u64),

    /// The replay session cannot be recovered; the whole run must stop.
    #[error("unrecoverable error while replaying: {0}")]
    ReproduceCritical(String),

    /// A startup requirement is not met (missing helper, invalid path, ...).
    #[error("{0}")]
    Precondition(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("system call failed: {0}")]
    Errno(#[from] nix::Error),
}

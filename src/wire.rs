//! Framing and deframing of the monitor <-> worker pipe protocol.
//!
//! Every frame starts with a 32 bit opcode followed by a sequence of 64 bit
//! words, all little-endian. The instrumentation side of the protocol lives
//! in the worker process; this module is the only place in the monitor that
//! touches raw bytes.

use std::{
    fs::File,
    io::{ErrorKind, Read, Write},
    os::fd::{AsFd, AsRawFd, BorrowedFd},
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::{
        select::{pselect, FdSet},
        signal::SigSet,
        time::TimeSpec,
    },
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper limit of interface argument counts supported by the instrumentation.
pub const ARG_COUNT_LIMIT: u64 = 17;

/// Reads on FIFOs can be interrupted by signals; retry a bounded number of
/// times before reporting the failure.
const EINTR_RETRIES: u32 = 5;

/// One opcode of the monitor <-> worker protocol.
///
/// `Invalid` (wire value 0) is never sent; receiving it indicates a corrupted
/// pipe. It still appears in recorded corpora, marking the read failure that
/// ended a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Opcode {
    Invalid = 0,
    Nop = 1,
    WorkerUp = 2,
    LibraryCall = 3,
    CallbackCall = 4,
    LibraryReturn = 5,
    LibraryReturnNoRetval = 6,
    CallbackReturn = 7,
    CallbackReturnNoRetval = 8,
    MonitorUpAck = 9,
    InstrumentOrder = 10,
    ExecAck = 11,
    WriteOrder = 12,
    WriteArgOrder = 13,
    ReturnOrder = 14,
}

impl Opcode {
    pub fn from_wire(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Opcode::Invalid,
            1 => Opcode::Nop,
            2 => Opcode::WorkerUp,
            3 => Opcode::LibraryCall,
            4 => Opcode::CallbackCall,
            5 => Opcode::LibraryReturn,
            6 => Opcode::LibraryReturnNoRetval,
            7 => Opcode::CallbackReturn,
            8 => Opcode::CallbackReturnNoRetval,
            9 => Opcode::MonitorUpAck,
            10 => Opcode::InstrumentOrder,
            11 => Opcode::ExecAck,
            12 => Opcode::WriteOrder,
            13 => Opcode::WriteArgOrder,
            14 => Opcode::ReturnOrder,
            _ => return None,
        })
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }

    /// A library or callback call crossing, carrying a function name.
    pub fn is_call(self) -> bool {
        matches!(self, Opcode::LibraryCall | Opcode::CallbackCall)
    }

    /// Any of the four return crossings.
    pub fn is_return(self) -> bool {
        matches!(
            self,
            Opcode::LibraryReturn
                | Opcode::LibraryReturnNoRetval
                | Opcode::CallbackReturn
                | Opcode::CallbackReturnNoRetval
        )
    }

    /// A return crossing that carries a return value word.
    pub fn has_retval(self) -> bool {
        matches!(self, Opcode::LibraryReturn | Opcode::CallbackReturn)
    }
}

/// Block until `fd` is readable or `timeout` elapses.
fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> Result<()> {
    let mut retries = EINTR_RETRIES;
    loop {
        // pselect updates nothing we reuse, but the FdSet has to be rebuilt
        // after EINTR anyway.
        let mut readfds = FdSet::new();
        readfds.insert(&fd);
        let timespec = TimeSpec::from_duration(timeout);
        match pselect(
            Some(fd.as_raw_fd() + 1),
            &mut readfds,
            None,
            None,
            Some(&timespec),
            Some(&SigSet::empty()),
        ) {
            Ok(0) => return Err(Error::PipeTimeout(timeout.as_secs())),
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) if retries > 0 => retries -= 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Fill `buf` completely, retrying interrupted reads a bounded number of
/// times. End-of-file before the first byte is reported as peer-closed,
/// end-of-file mid-buffer as a short read.
fn read_exact_retry(pipe: &mut File, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    let mut retries = EINTR_RETRIES;
    while filled < buf.len() {
        match pipe.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Err(Error::PipePeerClosed),
            Ok(0) => {
                return Err(Error::PipeShortRead {
                    want: buf.len(),
                    got: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted && retries > 0 => retries -= 1,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Read one opcode from the pipe.
///
/// With a timeout, the read waits for readiness first and reports
/// [`Error::PipeTimeout`] if nothing arrives. A decoded wire value of 0
/// yields [`Error::PipeInvalidOpcode`]; any other unknown value yields
/// [`Error::WorkerGarbage`].
pub fn read_opcode(pipe: &mut File, timeout: Option<Duration>) -> Result<Opcode> {
    if let Some(timeout) = timeout {
        wait_readable(pipe.as_fd(), timeout)?;
    }

    let mut buf = [0u8; 4];
    read_exact_retry(pipe, &mut buf)?;
    let raw = u32::from_le_bytes(buf);

    match Opcode::from_wire(raw) {
        Some(Opcode::Invalid) => Err(Error::PipeInvalidOpcode),
        Some(op) => Ok(op),
        None => Err(Error::WorkerGarbage(u64::from(raw))),
    }
}

/// Read one 64 bit payload word.
pub fn read_word(pipe: &mut File) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact_retry(pipe, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Read `n` consecutive payload words.
pub fn read_words(pipe: &mut File, n: usize) -> Result<Vec<u64>> {
    let mut words = Vec::with_capacity(n);
    for _ in 0..n {
        words.push(read_word(pipe)?);
    }
    Ok(words)
}

/// Read `n` raw payload bytes (length-prefixed fields such as function
/// names).
pub fn read_bytes(pipe: &mut File, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    read_exact_retry(pipe, &mut buf)?;
    Ok(buf)
}

/// Write one frame. Passing `None` as the opcode emits only the word tail,
/// for staged writes where the opcode went out separately.
pub fn write_frame(pipe: &mut File, opcode: Option<Opcode>, words: &[u64]) -> Result<()> {
    let mut buf = Vec::with_capacity(4 + words.len() * 8);
    if let Some(op) = opcode {
        buf.extend_from_slice(&op.to_wire().to_le_bytes());
    }
    for word in words {
        buf.extend_from_slice(&word.to_le_bytes());
    }
    pipe.write_all(&buf)?;
    Ok(())
}

/// Write an opcode followed by an already-encoded payload tail, verbatim.
/// Replay uses this to resend recorded messages byte-for-byte.
pub fn write_encoded(pipe: &mut File, opcode: Opcode, payload: &[u8]) -> Result<()> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&opcode.to_wire().to_le_bytes());
    buf.extend_from_slice(payload);
    pipe.write_all(&buf)?;
    Ok(())
}

/// Encode a word tail the way it goes over the wire.
pub fn encode_words(words: &[u64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(words.len() * 8);
    for word in words {
        buf.extend_from_slice(&word.to_le_bytes());
    }
    buf
}

/// Decode a word tail; trailing partial words are dropped.
pub fn decode_words(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

//! Pipe-based control and report channels between a handle and its init process

use crate::protocol::{self, ControlMessage, SupervisorReport};
use crate::{NsinitError, Result};
use nix::fcntl::OFlag;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

/// Largest frame accepted in either direction
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Create a control channel (parent writes, init process reads)
pub fn control_channel() -> Result<(ControlSender, ControlReceiver)> {
    let (rx, tx) = create_pipe()?;
    Ok((ControlSender { tx }, ControlReceiver { rx }))
}

/// Create a report channel (init process writes, parent reads)
pub fn report_channel() -> Result<(ReportReader, ReportWriter)> {
    let (rx, tx) = create_pipe()?;
    Ok((ReportReader { rx }, ReportWriter { tx }))
}

/// Parent end of the control channel
#[derive(Debug)]
pub struct ControlSender {
    tx: File,
}

impl ControlSender {
    /// Send a request to the init process
    pub fn send(&mut self, msg: &ControlMessage) -> Result<()> {
        write_frame(&mut self.tx, msg)
            .map_err(|e| NsinitError::Control(format!("failed to send {msg:?}: {e}")))
    }

    pub fn raw_fd(&self) -> RawFd {
        self.tx.as_raw_fd()
    }
}

/// Init-process end of the control channel
#[derive(Debug)]
pub struct ControlReceiver {
    rx: File,
}

impl ControlReceiver {
    /// Wait for the next request; `None` once the parent closed its end
    pub fn recv(&mut self) -> Result<Option<ControlMessage>> {
        read_frame(&mut self.rx)
    }
}

impl AsFd for ControlReceiver {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.rx.as_fd()
    }
}

/// Parent end of the report channel
#[derive(Debug)]
pub struct ReportReader {
    rx: File,
}

impl ReportReader {
    /// Read the final report; `None` if the init process exited without
    /// sending one
    pub fn recv(mut self) -> Result<Option<SupervisorReport>> {
        read_frame(&mut self.rx)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }
}

/// Init-process end of the report channel
#[derive(Debug)]
pub struct ReportWriter {
    tx: File,
}

impl ReportWriter {
    /// Send the final report; consumes the writer so the parent sees EOF
    pub fn send(mut self, report: &SupervisorReport) -> Result<()> {
        write_frame(&mut self.tx, report)
    }
}

/// Write one length-prefixed msgpack frame
fn write_frame<T: Serialize>(w: &mut impl Write, msg: &T) -> Result<()> {
    let body = protocol::encode(msg)
        .map_err(|e| NsinitError::Control(format!("failed to encode frame: {e}")))?;

    if body.len() > MAX_FRAME_LEN {
        return Err(NsinitError::Control(format!(
            "frame too large: {} bytes",
            body.len()
        )));
    }

    // Length prefix (4 bytes, big-endian) and body in one write so small
    // frames stay atomic on the pipe
    let len = u32::try_from(body.len())
        .map_err(|_| NsinitError::Control("frame length overflow".into()))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);

    w.write_all(&frame)?;
    w.flush()?;

    Ok(())
}

/// Read one frame; `None` on EOF before the length prefix
fn read_frame<T: DeserializeOwned>(r: &mut impl Read) -> Result<Option<T>> {
    let mut len_bytes = [0u8; 4];
    match r.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NsinitError::Control(format!("frame too large: {len} bytes")));
    }

    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;

    protocol::decode(&body)
        .map(Some)
        .map_err(|e| NsinitError::Control(format!("failed to decode frame: {e}")))
}

/// Create a close-on-exec pipe (returns read end, write end)
fn create_pipe() -> Result<(File, File)> {
    let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    Ok((File::from(read_end), File::from(write_end)))
}

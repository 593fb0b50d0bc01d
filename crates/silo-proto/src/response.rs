use std::io::{self, Write};

use tracing::debug;

use crate::{
    Drive,
    header::{METADATA_SIZE, ResponseKind, write_metadata},
};

/// Incremental writer for one response frame.
///
/// The buffer is fully prepared up front, metadata included; `drive` pushes
/// the unwritten tail at the socket. Completion is `written == buf.len()`.
pub struct ResponseFrame {
    kind: ResponseKind,
    buf: Vec<u8>,
    written: usize,
}

impl ResponseFrame {
    /// Wraps a prebuilt buffer whose first 9 bytes already hold the metadata.
    pub fn from_raw(kind: ResponseKind, buf: Vec<u8>) -> Self {
        debug_assert!(buf.len() >= METADATA_SIZE);
        Self { kind, buf, written: 0 }
    }

    /// Builds a frame by copying `body` behind freshly written metadata.
    pub fn from_body(kind: ResponseKind, compressed: bool, body: &[u8]) -> Self {
        let mut buf = vec![0; METADATA_SIZE];
        buf.reserve(body.len());
        buf.extend_from_slice(body);
        write_metadata(&mut buf, kind, compressed, body.len() as u64);
        Self::from_raw(kind, buf)
    }

    /// The empty-payload error response.
    pub fn error() -> Self {
        Self::from_body(ResponseKind::Error, false, &[])
    }

    /// One reactor invocation: writes until the frame completes or the
    /// socket would block.
    pub fn drive<W: Write>(&mut self, dst: &mut W) -> Drive {
        while self.written < self.buf.len() {
            match dst.write(&self.buf[self.written..]) {
                Ok(0) => return Drive::Disconnected,
                Ok(n) => self.written += n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Drive::Progress;
                }
                Err(err) => {
                    debug!(?err, "response write");
                    return Drive::Disconnected;
                }
            }
        }
        Drive::Complete
    }

    /// Swaps in a refilled buffer (ranged-retrieval streaming) and restarts
    /// the write cursor.
    pub fn refill(&mut self, buf: Vec<u8>) {
        debug_assert!(buf.len() >= METADATA_SIZE);
        self.buf = buf;
        self.written = 0;
    }

    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    /// The compressed-payload bit of the metadata already in the buffer.
    pub fn compressed(&self) -> bool {
        self.buf[0] & 0x08 != 0
    }

    pub fn is_complete(&self) -> bool {
        self.written == self.buf.len()
    }

    #[cfg(test)]
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf
    }
}

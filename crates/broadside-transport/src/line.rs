//! Newline framing over raw descriptors

use crate::fd;
use crate::transport::poll_handles;
use broadside_core::{BroadsideError, Result};
use std::io::ErrorKind;
use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};
use tracing::debug;

/// Longest line accepted from a peer, terminator included
pub const MAX_FRAME_LEN: usize = 4096;

/// Accumulates bytes from a descriptor and splits them into lines.
///
/// Bytes after the first newline are kept for the next call, so several
/// lines arriving in one read are returned one at a time.
#[derive(Debug, Default)]
pub struct LineBuffer {
    /// Bytes read but not yet returned as a line
    pending: Vec<u8>,
    /// The peer closed its end
    eof: bool,
    /// Dropping the tail of an oversized line up to its newline
    discarding: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget buffered bytes and any end-of-stream marker
    pub fn clear(&mut self) {
        self.pending.clear();
        self.eof = false;
        self.discarding = false;
    }

    pub fn is_eof(&self) -> bool {
        self.eof && self.pending.is_empty()
    }

    /// Read the next line from `fd`, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` on timeout, or at end of stream once every buffered
    /// byte has been handed out. An unterminated remainder at end of stream
    /// is returned as a final line. `peer` names the source in errors.
    pub fn read_line(
        &mut self,
        fd: BorrowedFd<'_>,
        timeout: Duration,
        peer: &str,
    ) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.discarding {
                self.skip_discarded();
            }
            if let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
                if end + 1 > MAX_FRAME_LEN {
                    let head = self.head();
                    self.pending.drain(..=end);
                    return Err(oversized(peer, head));
                }
                return Ok(Some(self.take_line(end)));
            }
            if self.pending.len() >= MAX_FRAME_LEN {
                // The rest of this line is dropped as it arrives
                let head = self.head();
                self.pending.clear();
                self.discarding = true;
                return Err(oversized(peer, head));
            }
            if self.eof {
                return Ok(self.take_remainder());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if poll_handles(&[fd], remaining)?.is_empty() {
                return Ok(None);
            }

            let mut chunk = [0u8; 1024];
            match fd::read(fd, &mut chunk) {
                Ok(0) => {
                    debug!(peer, "end of stream");
                    self.eof = true;
                }
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(e) => {
                    return Err(BroadsideError::Connection(format!(
                        "read from {} failed: {}",
                        peer, e
                    )));
                }
            }
        }
    }

    fn take_line(&mut self, end: usize) -> String {
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8_lossy(&line).into_owned()
    }

    fn skip_discarded(&mut self) {
        match self.pending.iter().position(|&b| b == b'\n') {
            Some(end) => {
                self.pending.drain(..=end);
                self.discarding = false;
            }
            None => self.pending.clear(),
        }
    }

    fn head(&self) -> String {
        let len = self.pending.len().min(64);
        String::from_utf8_lossy(&self.pending[..len]).into_owned()
    }

    fn take_remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

fn oversized(peer: &str, head: String) -> BroadsideError {
    BroadsideError::protocol(peer, head, format!("line exceeds {} bytes", MAX_FRAME_LEN))
}

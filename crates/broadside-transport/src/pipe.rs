//! Unidirectional OS pipe with exclusively owned ends

use crate::fd;
use broadside_core::{BroadsideError, Result};
use nix::unistd::dup2;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Which end of a pipe an operation applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

/// An anonymous pipe owning at most one read and one write descriptor.
///
/// Both ends are created close-on-exec; an end only survives `exec` once it
/// has been duplicated onto another slot, e.g. with [`AnonymousPipe::merge_into`].
/// Dropping the pipe closes whatever ends are still open.
#[derive(Debug, Default)]
pub struct AnonymousPipe {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl AnonymousPipe {
    /// Create an empty pipe with no descriptors
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh read/write descriptor pair
    pub fn open(&mut self) -> Result<()> {
        if self.read.is_some() || self.write.is_some() {
            return Err(BroadsideError::Resource("pipe is already open".into()));
        }

        let (read, write) = open_cloexec_pair()?;
        self.read = Some(read);
        self.write = Some(write);
        Ok(())
    }

    pub fn can_read(&self) -> bool {
        self.read.is_some()
    }

    pub fn can_write(&self) -> bool {
        self.write.is_some()
    }

    pub fn is_open(&self, end: PipeEnd) -> bool {
        self.end(end).is_some()
    }

    pub fn read_handle(&self) -> Option<BorrowedFd<'_>> {
        self.read.as_ref().map(|fd| fd.as_fd())
    }

    pub fn write_handle(&self) -> Option<BorrowedFd<'_>> {
        self.write.as_ref().map(|fd| fd.as_fd())
    }

    pub fn close(&mut self) {
        self.close_read();
        self.close_write();
    }

    pub fn close_read(&mut self) {
        self.read = None;
    }

    pub fn close_write(&mut self) {
        self.write = None;
    }

    /// Duplicate one end onto a specific descriptor number.
    ///
    /// Used in a forked child to make the pipe its stdin or stdout. The
    /// target keeps no close-on-exec flag. The pipe still owns its original
    /// descriptor; the target number is left to whoever owns that slot.
    pub fn merge_into(&self, target: RawFd, end: PipeEnd) -> Result<()> {
        let source = self.end(end).ok_or_else(|| {
            BroadsideError::Resource(format!("pipe {:?} end is not open", end))
        })?;
        if target < 0 {
            return Err(BroadsideError::Resource(format!(
                "invalid destination descriptor: {}",
                target
            )));
        }

        if source.as_raw_fd() == target {
            // dup2 onto itself is a no-op and would keep close-on-exec set
            return fd::set_cloexec(source.as_fd(), false).map_err(|e| {
                BroadsideError::Resource(format!("failed to clear close-on-exec: {}", e))
            });
        }

        // Safety: the target slot is handed over to the pipe's end by dup2; the
        // temporary OwnedFd is forgotten so the slot is never closed here.
        let mut target_fd = unsafe { OwnedFd::from_raw_fd(target) };
        let result = dup2(source, &mut target_fd);
        std::mem::forget(target_fd);
        result.map_err(|e| BroadsideError::Resource(format!("dup2 onto {} failed: {}", target, e)))
    }

    /// Write `text` as one line, appending a newline if it has none
    pub fn write_line(&self, text: &str) -> Result<()> {
        let write = self
            .write
            .as_ref()
            .ok_or_else(|| BroadsideError::Resource("pipe is not open for writing".into()))?;

        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let written = fd::write(write.as_fd(), line.as_bytes())
            .map_err(|e| BroadsideError::Resource(format!("pipe write failed: {}", e)))?;
        if written != line.len() {
            return Err(BroadsideError::Resource(format!(
                "short pipe write: {} of {} bytes",
                written,
                line.len()
            )));
        }
        Ok(())
    }

    /// Put both open ends in non-blocking mode
    pub fn set_nonblocking(&self) -> Result<()> {
        for end in [self.read_handle(), self.write_handle()].into_iter().flatten() {
            fd::set_nonblocking(end, true).map_err(|e| {
                BroadsideError::Resource(format!("failed to set O_NONBLOCK: {}", e))
            })?;
        }
        Ok(())
    }

    fn end(&self, end: PipeEnd) -> Option<&OwnedFd> {
        match end {
            PipeEnd::Read => self.read.as_ref(),
            PipeEnd::Write => self.write.as_ref(),
        }
    }
}

/// Create a pipe whose ends are already close-on-exec.
///
/// pipe2 sets the flag atomically so a concurrent fork can never inherit
/// the descriptors.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn open_cloexec_pair() -> Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::OFlag;
    nix::unistd::pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| BroadsideError::Resource(format!("pipe2() failed: {}", e)))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn open_cloexec_pair() -> Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe()
        .map_err(|e| BroadsideError::Resource(format!("pipe() failed: {}", e)))?;
    for end in [&read, &write] {
        fd::set_cloexec(end.as_fd(), true).map_err(|e| {
            BroadsideError::Resource(format!("failed to set close-on-exec: {}", e))
        })?;
    }
    Ok((read, write))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all_available(pipe: &AnonymousPipe) -> String {
        let mut buf = [0u8; 256];
        let n = fd::read(pipe.read_handle().unwrap(), &mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn test_open_allocates_both_ends() {
        let mut pipe = AnonymousPipe::new();
        assert!(!pipe.can_read());
        assert!(!pipe.can_write());

        pipe.open().unwrap();
        assert!(pipe.can_read());
        assert!(pipe.can_write());
    }

    #[test]
    fn test_open_twice_fails() {
        let mut pipe = AnonymousPipe::new();
        pipe.open().unwrap();
        let err = pipe.open().unwrap_err();
        assert!(matches!(err, BroadsideError::Resource(_)));
        assert!(pipe.can_read());
    }

    #[test]
    fn test_write_line_appends_newline_once() {
        let mut pipe = AnonymousPipe::new();
        pipe.open().unwrap();
        pipe.write_line("hello").unwrap();
        pipe.write_line("world\n").unwrap();
        assert_eq!(read_all_available(&pipe), "hello\nworld\n");
    }

    #[test]
    fn test_write_line_requires_write_end() {
        let mut pipe = AnonymousPipe::new();
        assert!(pipe.write_line("x").is_err());

        pipe.open().unwrap();
        pipe.close_write();
        assert!(pipe.write_line("x").is_err());
        assert!(pipe.can_read());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut pipe = AnonymousPipe::new();
        pipe.open().unwrap();
        pipe.close_read();
        pipe.close_read();
        pipe.close();
        pipe.close();
        assert!(!pipe.can_read());
        assert!(!pipe.can_write());

        // A closed pipe can be opened again
        pipe.open().unwrap();
    }

    #[test]
    fn test_move_transfers_ownership() {
        let mut pipe = AnonymousPipe::new();
        pipe.open().unwrap();
        let raw = pipe.read_handle().unwrap().as_raw_fd();

        let moved = std::mem::take(&mut pipe);
        assert!(!pipe.can_read());
        assert_eq!(moved.read_handle().unwrap().as_raw_fd(), raw);
    }

    #[test]
    fn test_merge_into_requires_open_end() {
        let pipe = AnonymousPipe::new();
        assert!(pipe.merge_into(0, PipeEnd::Read).is_err());
    }

    #[test]
    fn test_merge_into_rejects_invalid_target() {
        let mut pipe = AnonymousPipe::new();
        pipe.open().unwrap();
        assert!(pipe.merge_into(-1, PipeEnd::Write).is_err());
    }

    #[test]
    fn test_merge_into_redirects_descriptor() {
        let mut source = AnonymousPipe::new();
        source.open().unwrap();
        let mut decoy = AnonymousPipe::new();
        decoy.open().unwrap();

        // The decoy's write slot now refers to the source pipe's write end
        let target = decoy.write_handle().unwrap().as_raw_fd();
        source.merge_into(target, PipeEnd::Write).unwrap();

        decoy.write_line("redirected").unwrap();
        assert_eq!(read_all_available(&source), "redirected\n");
    }
}

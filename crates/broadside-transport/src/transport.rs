//! Readiness and line-channel abstractions shared by every transport

use broadside_core::{BroadsideError, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};

/// Something that exposes a descriptor for readiness polling.
///
/// Returns `None` when the object is closed and can never become readable.
pub trait Readable {
    fn readable_fd(&self) -> Option<BorrowedFd<'_>>;
}

/// A bidirectional, newline-framed text channel
pub trait LineChannel: Readable {
    /// Human readable name used in logs and protocol errors
    fn label(&self) -> &str;

    /// Read one line without its terminator.
    ///
    /// `Ok(None)` means no complete line arrived before the timeout or the
    /// peer reached end of stream with nothing left.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>>;

    /// Send one line; a trailing newline is added
    fn write_line(&mut self, line: &str) -> Result<()>;
}

/// Wait until at least one of `sources` is readable or the timeout expires.
///
/// Returns the indices of the ready sources. Closed sources are skipped and
/// never reported. An empty result means the timeout expired.
pub fn wait_readable(sources: &[&dyn Readable], timeout: Duration) -> Result<Vec<usize>> {
    let mut indices = Vec::with_capacity(sources.len());
    let mut fds = Vec::with_capacity(sources.len());
    for (index, source) in sources.iter().enumerate() {
        if let Some(fd) = source.readable_fd() {
            indices.push(index);
            fds.push(fd);
        }
    }

    let ready = poll_handles(&fds, timeout)?;
    Ok(ready.into_iter().map(|i| indices[i]).collect())
}

/// Poll descriptors for input, restarting on EINTR until the deadline.
///
/// Hang-up and error conditions count as readable so callers observe EOF.
pub(crate) fn poll_handles(fds: &[BorrowedFd<'_>], timeout: Duration) -> Result<Vec<usize>> {
    if fds.is_empty() {
        std::thread::sleep(timeout);
        return Ok(Vec::new());
    }

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = u16::try_from(remaining.as_millis()).unwrap_or(u16::MAX);

        let mut poll_fds: Vec<PollFd<'_>> = fds
            .iter()
            .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
            .collect();

        match poll(&mut poll_fds, PollTimeout::from(millis)) {
            Ok(0) => {
                if Instant::now() >= deadline {
                    return Ok(Vec::new());
                }
            }
            Ok(_) => {
                let ready_mask = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                return Ok(poll_fds
                    .iter()
                    .enumerate()
                    .filter(|(_, pfd)| {
                        pfd.revents()
                            .is_some_and(|revents| revents.intersects(ready_mask))
                    })
                    .map(|(i, _)| i)
                    .collect());
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(BroadsideError::Resource(format!("poll() failed: {}", e)));
            }
        }
    }
}

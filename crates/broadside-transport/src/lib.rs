//! Process and network plumbing for the Broadside game server
//!
//! This crate provides:
//! - Anonymous pipes with exclusively owned descriptors
//! - A process-wide signal bridge (self-pipe) for readiness loops
//! - TCP endpoints for human players
//! - Subprocess channels for bot players
//! - Newline framing and a readiness wait shared by all of the above

mod fd;
pub mod endpoint;
pub mod line;
pub mod pipe;
pub mod signal;
pub mod subprocess;
pub mod transport;

pub use endpoint::{Endpoint, Role};
pub use line::{LineBuffer, MAX_FRAME_LEN};
pub use pipe::{AnonymousPipe, PipeEnd};
pub use signal::{FORWARDED_SIGNALS, SignalBridge};
pub use subprocess::{ChannelState, ChildExit, EXEC_FAILED_STATUS, IoDirection, SubprocessChannel};
pub use transport::{LineChannel, Readable, wait_readable};

pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;

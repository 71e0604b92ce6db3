//! Child processes driven over their standard streams

use crate::line::{LineBuffer, MAX_FRAME_LEN};
use crate::pipe::AnonymousPipe;
use crate::transport::{LineChannel, Readable};
use broadside_core::{BroadsideError, Result, ShutdownPolicy};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use std::ffi::{CStr, CString, OsStr};
use std::fmt;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Exit code of a child whose exec failed
pub const EXEC_FAILED_STATUS: i32 = 127;

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);
const KILL_REAP_WAIT: Duration = Duration::from_millis(100);

/// Which standard streams of the child the parent is connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    /// The parent only reads the child's stdout
    InputOnly,
    /// The parent only writes the child's stdin
    OutputOnly,
    Bidirectional,
}

impl IoDirection {
    pub fn reads(self) -> bool {
        !matches!(self, IoDirection::OutputOnly)
    }

    pub fn writes(self) -> bool {
        !matches!(self, IoDirection::InputOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unspawned,
    Running,
    Closed,
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(Signal),
    /// Teardown had to escalate to SIGKILL
    Killed,
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildExit::Exited(code) => write!(f, "exited with status {}", code),
            ChildExit::Signaled(signal) => write!(f, "terminated by {}", signal),
            ChildExit::Killed => f.write_str("killed"),
        }
    }
}

/// A spawned child process and the pipes attached to its stdin/stdout.
///
/// Lifecycle is `Unspawned -> Running -> Closed`. Closing (explicitly or on
/// drop) releases the pipes first so the child sees EOF, then waits for it
/// and escalates to SIGTERM and finally SIGKILL per the [`ShutdownPolicy`].
#[derive(Debug)]
pub struct SubprocessChannel {
    /// Which of the child's stdin and stdout are piped to the parent
    direction: IoDirection,
    /// Name used in logs and errors
    alias: String,
    /// Program name or path handed to execvp
    executable: String,
    /// Arguments after argv[0]
    arguments: Vec<String>,
    /// Waits used by `close`
    policy: ShutdownPolicy,
    /// Lifecycle position: unspawned, running or closed
    state: ChannelState,
    /// PID while the child may still need reaping
    child: Option<Pid>,
    /// How the last child ended, once reaped
    exit: Option<ChildExit>,
    /// Parent reads the child's stdout here
    child_stdout: AnonymousPipe,
    /// Parent writes the child's stdin here
    child_stdin: AnonymousPipe,
    /// Partial lines read from `child_stdout`
    buffer: LineBuffer,
}

impl SubprocessChannel {
    /// Build a channel from a whitespace separated command line
    pub fn new(direction: IoDirection, alias: impl Into<String>, command_line: &str) -> Self {
        let mut words = command_line.split_whitespace().map(str::to_string);
        let executable = words.next().unwrap_or_default();
        Self::with_args(direction, alias, executable, words.collect())
    }

    pub fn with_args(
        direction: IoDirection,
        alias: impl Into<String>,
        executable: impl Into<String>,
        arguments: Vec<String>,
    ) -> Self {
        Self {
            direction,
            alias: alias.into(),
            executable: executable.into(),
            arguments,
            policy: ShutdownPolicy::default(),
            state: ChannelState::Unspawned,
            child: None,
            exit: None,
            child_stdout: AnonymousPipe::new(),
            child_stdin: AnonymousPipe::new(),
            buffer: LineBuffer::new(),
        }
    }

    pub fn with_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn direction(&self) -> IoDirection {
        self.direction
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.child
    }

    pub fn exit_status(&self) -> Option<ChildExit> {
        self.exit
    }

    /// Executable followed by its arguments, quoting any containing spaces
    pub fn command_line(&self) -> String {
        let mut line = self.executable.clone();
        for arg in &self.arguments {
            line.push(' ');
            if arg.contains(' ') {
                line.push('"');
                line.push_str(arg);
                line.push('"');
            } else {
                line.push_str(arg);
            }
        }
        line
    }

    pub fn validate(&self) -> Result<()> {
        if self.alias.is_empty() {
            return Err(BroadsideError::InvalidArgument(
                "subprocess alias is empty".into(),
            ));
        }
        if self.executable.is_empty() {
            return Err(BroadsideError::InvalidArgument(format!(
                "no executable given for '{}'",
                self.alias
            )));
        }
        Ok(())
    }

    /// Spawn the child with its streams attached per the [`IoDirection`]
    pub fn run(&mut self) -> Result<()> {
        match self.state {
            ChannelState::Running => {
                let pid = self.child.map_or(-1, Pid::as_raw);
                return Err(BroadsideError::State(format!(
                    "'{}' is already running on PID {}",
                    self.alias, pid
                )));
            }
            ChannelState::Closed => {
                return Err(BroadsideError::State(format!(
                    "'{}' has been closed",
                    self.alias
                )));
            }
            ChannelState::Unspawned => {}
        }
        self.validate()?;

        // Everything the child needs is prepared before fork; the executable
        // is looked up on PATH by execvp
        let program = to_cstring(OsStr::new(&self.executable))?;
        let argv: Vec<CString> = std::iter::once(self.executable.as_str())
            .chain(self.arguments.iter().map(String::as_str))
            .map(|arg| to_cstring(OsStr::new(arg)))
            .collect::<Result<_>>()?;
        let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());

        if self.direction.reads() {
            self.child_stdout.open()?;
        }
        if self.direction.writes() {
            if let Err(e) = self.child_stdin.open() {
                self.child_stdout.close();
                return Err(e);
            }
        }

        let stdin_source = self.child_stdin.read_handle().map(|fd| fd.as_raw_fd());
        let stdout_source = self.child_stdout.write_handle().map(|fd| fd.as_raw_fd());

        // Safety: the child only calls fcntl, dup2, close, execvp and _exit
        // before replacing its image.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                exec_child(stdin_source, stdout_source, &program, &argv_ptrs);
            }
            Ok(ForkResult::Parent { child }) => {
                self.child_stdout.close_write();
                self.child_stdin.close_read();
                self.child = Some(child);
                self.exit = None;
                self.state = ChannelState::Running;
                self.buffer.clear();
                info!(
                    alias = %self.alias,
                    pid = child.as_raw(),
                    command = %self.command_line(),
                    "Spawned subprocess"
                );
                Ok(())
            }
            Err(e) => {
                self.child_stdout.close();
                self.child_stdin.close();
                Err(BroadsideError::Resource(format!(
                    "fork for '{}' failed: {}",
                    self.alias, e
                )))
            }
        }
    }

    /// Wait up to `timeout` for the child to exit, reaping it.
    ///
    /// Returns `true` once no child remains to wait for.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let Some(pid) = self.child else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.record_exit(ChildExit::Exited(code));
                    return true;
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    self.record_exit(ChildExit::Signaled(signal));
                    return true;
                }
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    warn!(alias = %self.alias, pid = pid.as_raw(), "Child already reaped elsewhere");
                    self.child = None;
                    return true;
                }
                Err(e) => {
                    error!(alias = %self.alias, pid = pid.as_raw(), error = %e, "waitpid failed");
                    return false;
                }
            }

            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(REAP_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    fn record_exit(&mut self, exit: ChildExit) {
        if let Some(pid) = self.child.take() {
            debug!(alias = %self.alias, pid = pid.as_raw(), %exit, "Subprocess exited");
        }
        self.exit = Some(exit);
    }

    /// Whether the child exists and has not exited
    pub fn is_running(&mut self) -> bool {
        match self.child {
            Some(pid) => !self.wait_for_exit(Duration::ZERO) && kill(pid, None).is_ok(),
            None => false,
        }
    }

    /// Close the pipes and make sure the child is gone
    pub fn close(&mut self) {
        self.child_stdout.close();
        self.child_stdin.close();
        self.buffer.clear();
        if self.state == ChannelState::Running {
            self.state = ChannelState::Closed;
        }

        let Some(pid) = self.child else {
            return;
        };
        if self.wait_for_exit(self.policy.exit_wait) {
            return;
        }

        info!(alias = %self.alias, pid = pid.as_raw(), "Subprocess still running, sending SIGTERM");
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            warn!(alias = %self.alias, pid = pid.as_raw(), error = %e, "SIGTERM failed");
        }
        if self.wait_for_exit(self.policy.terminate_wait) {
            return;
        }

        warn!(alias = %self.alias, pid = pid.as_raw(), "Subprocess ignored SIGTERM, sending SIGKILL");
        if let Err(e) = kill(pid, Signal::SIGKILL) {
            warn!(alias = %self.alias, pid = pid.as_raw(), error = %e, "SIGKILL failed");
        }
        if !self.wait_for_exit(KILL_REAP_WAIT) {
            error!(alias = %self.alias, pid = pid.as_raw(), "Could not confirm subprocess exit");
            self.child = None;
        }
        self.exit = Some(ChildExit::Killed);
    }

    pub fn read_handle(&self) -> Option<BorrowedFd<'_>> {
        self.child_stdout.read_handle()
    }

    /// Write one line to the child's stdin.
    ///
    /// A single trailing newline is allowed; any other newline would split
    /// the text into several frames and is rejected.
    pub fn send_line(&self, text: &str) -> Result<()> {
        if self.state != ChannelState::Running {
            return Err(BroadsideError::State(format!(
                "'{}' is not running",
                self.alias
            )));
        }
        if !self.direction.writes() {
            return Err(BroadsideError::State(format!(
                "'{}' was opened input only",
                self.alias
            )));
        }
        let line = text.strip_suffix('\n').unwrap_or(text);
        if line.contains('\n') {
            return Err(BroadsideError::InvalidArgument(format!(
                "line for '{}' contains a newline",
                self.alias
            )));
        }
        if line.len() >= MAX_FRAME_LEN {
            return Err(BroadsideError::InvalidArgument(format!(
                "line for '{}' is {} bytes, limit is {}",
                self.alias,
                line.len(),
                MAX_FRAME_LEN - 1
            )));
        }
        self.child_stdin.write_line(line)
    }

    /// Read one line from the child's stdout, waiting at most `timeout`
    pub fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        if self.state != ChannelState::Running {
            return Err(BroadsideError::State(format!(
                "'{}' is not running",
                self.alias
            )));
        }
        if !self.direction.reads() {
            return Err(BroadsideError::State(format!(
                "'{}' was opened output only",
                self.alias
            )));
        }
        let fd = self.child_stdout.read_handle().ok_or_else(|| {
            BroadsideError::State(format!("'{}' has no readable stream", self.alias))
        })?;
        self.buffer.read_line(fd, timeout, &self.alias)
    }
}

impl Drop for SubprocessChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for SubprocessChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pid = self.child.map_or(-1, Pid::as_raw);
        write!(
            f,
            "SubprocessChannel({},pid={},command={})",
            self.alias,
            pid,
            self.command_line()
        )
    }
}

impl Readable for SubprocessChannel {
    fn readable_fd(&self) -> Option<BorrowedFd<'_>> {
        self.read_handle()
    }
}

impl LineChannel for SubprocessChannel {
    fn label(&self) -> &str {
        &self.alias
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        SubprocessChannel::read_line(self, timeout)
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.send_line(line)
    }
}

fn to_cstring(value: &OsStr) -> Result<CString> {
    CString::new(value.as_bytes()).map_err(|_| {
        BroadsideError::InvalidArgument(format!("argument contains a NUL byte: {:?}", value))
    })
}

/// Child side of `run`.
///
/// Runs between fork and exec, so it allocates nothing and only makes raw
/// descriptor calls. Both sources are first copied above the standard
/// slots so redirecting one stream can never overwrite the other's source.
fn exec_child(
    stdin: Option<RawFd>,
    stdout: Option<RawFd>,
    program: &CStr,
    argv: &[*const libc::c_char],
) -> ! {
    // Safety: the copies are close-on-exec and owned by this process only;
    // argv is null terminated and outlives execvp.
    unsafe {
        let stdin = stdin.map(|fd| libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3));
        let stdout = stdout.map(|fd| libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3));
        if redirect(stdin, libc::STDIN_FILENO) && redirect(stdout, libc::STDOUT_FILENO) {
            libc::execvp(program.as_ptr(), argv.as_ptr());
        }
        libc::_exit(EXEC_FAILED_STATUS)
    }
}

/// Point `target` at `source`, or close it when the stream is not wired
fn redirect(source: Option<RawFd>, target: RawFd) -> bool {
    match source {
        Some(fd) if fd < 0 => false,
        // Safety: dup2 onto a standard slot of the forked child
        Some(fd) => unsafe { libc::dup2(fd, target) == target },
        None => {
            // Safety: see above
            unsafe { libc::close(target) };
            true
        }
    }
}

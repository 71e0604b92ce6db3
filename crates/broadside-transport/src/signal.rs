//! Self-pipe bridge turning asynchronous signals into readable lines

use crate::fd;
use crate::pipe::AnonymousPipe;
use crate::transport::Readable;
use broadside_core::{BroadsideError, Result};
use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::{debug, info, warn};

/// Signals routed into the bridge once it is initialized
pub const FORWARDED_SIGNALS: [Signal; 4] = [
    Signal::SIGCHLD,
    Signal::SIGALRM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

static INIT_LOCK: Mutex<()> = Mutex::new(());
static BRIDGE: OnceLock<SignalBridge> = OnceLock::new();
/// Write end seen by the handler; -1 until the bridge is live
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Process-wide self-pipe.
///
/// Each forwarded signal writes its number followed by a newline into a
/// non-blocking pipe. The read end can sit in the same readiness wait as
/// sockets and subprocess pipes, so child exits and timers are observed
/// without racing a blocking call.
#[derive(Debug)]
pub struct SignalBridge {
    pipe: AnonymousPipe,
}

impl SignalBridge {
    /// Initialize the bridge on first call and return it.
    ///
    /// Later calls return the same instance. Initialization is serialized so
    /// concurrent callers can never install two competing pipes.
    pub fn init() -> Result<&'static SignalBridge> {
        if let Some(bridge) = BRIDGE.get() {
            return Ok(bridge);
        }

        let _guard = INIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bridge) = BRIDGE.get() {
            return Ok(bridge);
        }

        let bridge = Self::install()?;
        Ok(BRIDGE.get_or_init(move || bridge))
    }

    /// The bridge if it has been initialized
    pub fn get() -> Option<&'static SignalBridge> {
        BRIDGE.get()
    }

    fn install() -> Result<SignalBridge> {
        let mut pipe = AnonymousPipe::new();
        pipe.open()?;
        pipe.set_nonblocking()?;

        let write_fd = pipe
            .write_handle()
            .map(|fd| fd.as_raw_fd())
            .ok_or_else(|| BroadsideError::Resource("signal pipe has no write end".into()))?;
        WRITE_FD.store(write_fd, Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in FORWARDED_SIGNALS {
            // Safety: the handler only touches an atomic, a stack buffer and
            // write(2), all async-signal-safe.
            if let Err(e) = unsafe { sigaction(signal, &action) } {
                WRITE_FD.store(-1, Ordering::SeqCst);
                return Err(BroadsideError::Resource(format!(
                    "failed to install handler for {}: {}",
                    signal, e
                )));
            }
        }

        info!(
            read_fd = pipe.read_handle().map(|fd| fd.as_raw_fd()),
            write_fd, "Signal bridge installed"
        );
        Ok(SignalBridge { pipe })
    }

    pub fn read_handle(&self) -> Option<BorrowedFd<'_>> {
        self.pipe.read_handle()
    }

    /// Consume every pending notification in arrival order
    pub fn drain(&self) -> Result<Vec<Signal>> {
        let read = self
            .pipe
            .read_handle()
            .ok_or_else(|| BroadsideError::State("signal bridge is closed".into()))?;

        let mut raw = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            match fd::read(read, &mut chunk) {
                Ok(0) => break,
                Ok(n) => raw.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(BroadsideError::Resource(format!(
                        "signal pipe read failed: {}",
                        e
                    )));
                }
            }
        }

        let mut signals = Vec::new();
        for line in raw.split(|&b| b == b'\n').filter(|l| !l.is_empty()) {
            let number = std::str::from_utf8(line)
                .ok()
                .and_then(|text| text.parse::<i32>().ok());
            match number.map(Signal::try_from) {
                Some(Ok(signal)) => signals.push(signal),
                _ => warn!(line = %String::from_utf8_lossy(line), "Unrecognized signal record"),
            }
        }
        if !signals.is_empty() {
            debug!(?signals, "Drained signal bridge");
        }
        Ok(signals)
    }
}

impl Readable for SignalBridge {
    fn readable_fd(&self) -> Option<BorrowedFd<'_>> {
        self.read_handle()
    }
}

extern "C" fn forward_signal(signum: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let saved = Errno::last_raw();

    let mut buf = [0u8; 12];
    let mut pos = buf.len() - 1;
    buf[pos] = b'\n';
    let mut n = signum.unsigned_abs();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }

    // Safety: write(2) is async-signal-safe; a full pipe drops the record.
    unsafe {
        libc::write(fd, buf[pos..].as_ptr().cast(), buf.len() - pos);
    }
    Errno::set_raw(saved);
}

//! TCP endpoints: outbound clients, listening servers and accepted peers

use crate::line::{LineBuffer, MAX_FRAME_LEN};
use crate::transport::{LineChannel, Readable};
use broadside_core::{BroadsideError, Result};
use nix::sys::socket::{Backlog, MsgFlags, listen, send};
use std::fmt;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

/// What an endpoint is currently used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unbound,
    Client,
    Server,
    AcceptedRemote,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Unbound => "Unbound",
            Role::Client => "Client",
            Role::Server => "Server",
            Role::AcceptedRemote => "AcceptedRemote",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
enum Socket {
    Listener(TcpListener),
    Stream(TcpStream),
}

impl Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Socket::Listener(listener) => listener.as_fd(),
            Socket::Stream(stream) => stream.as_fd(),
        }
    }
}

/// A TCP connection or listening socket with exclusive ownership of its
/// descriptor.
///
/// An endpoint starts [`Role::Unbound`] and becomes a client through
/// [`connect`](Endpoint::connect), a server through
/// [`listen`](Endpoint::listen), or an accepted peer when returned from a
/// server's [`accept`](Endpoint::accept). Dropping it shuts down and closes
/// the socket.
#[derive(Debug)]
pub struct Endpoint {
    /// Current use of the socket; `Unbound` exactly when `socket` is `None`
    role: Role,
    /// Display name used in logs
    label: String,
    /// Peer IP for connected endpoints, bound IP for servers
    address: String,
    /// Remote port for clients, bound port for servers and accepted peers
    port: u16,
    /// Owned socket, closed on drop
    socket: Option<Socket>,
    /// Partial input between `read_line` calls
    buffer: LineBuffer,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new("")
    }
}

impl Endpoint {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            role: Role::Unbound,
            label: label.into(),
            address: String::new(),
            port: 0,
            socket: None,
            buffer: LineBuffer::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn handle(&self) -> Option<BorrowedFd<'_>> {
        self.socket.as_ref().map(Socket::as_fd)
    }

    /// Connect to `host:port`, trying each resolved address in order
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        if self.is_open() {
            return Err(BroadsideError::State(format!(
                "endpoint '{}' is already open as {}",
                self.label, self.role
            )));
        }
        if host.is_empty() {
            return Err(BroadsideError::InvalidArgument(
                "host address is empty".into(),
            ));
        }
        if port == 0 {
            return Err(BroadsideError::InvalidArgument(format!(
                "port {} is out of range",
                port
            )));
        }

        let candidates = (host, port).to_socket_addrs().map_err(|e| {
            BroadsideError::Connection(format!("failed to resolve {}: {}", host, e))
        })?;

        let mut last_error = None;
        for candidate in candidates {
            match TcpStream::connect(candidate) {
                Ok(stream) => {
                    self.role = Role::Client;
                    self.address = candidate.ip().to_string();
                    self.port = port;
                    self.buffer.clear();
                    info!(
                        label = %self.label,
                        address = %candidate,
                        fd = stream.as_raw_fd(),
                        "Connected"
                    );
                    self.socket = Some(Socket::Stream(stream));
                    return Ok(());
                }
                Err(e) => {
                    debug!(address = %candidate, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(BroadsideError::Connection(match last_error {
            Some(e) => format!("failed to connect to {}:{}: {}", host, port, e),
            None => format!("no addresses found for {}", host),
        }))
    }

    /// Bind and listen; an empty or `0.0.0.0` address binds every interface.
    ///
    /// Port 0 asks the OS for a free port; [`port`](Endpoint::port) reports
    /// the one actually bound.
    pub fn listen(&mut self, address: &str, port: u16, backlog: i32) -> Result<()> {
        if self.is_open() {
            return Err(BroadsideError::State(format!(
                "endpoint '{}' is already open as {}",
                self.label, self.role
            )));
        }
        if backlog < 1 {
            return Err(BroadsideError::InvalidArgument(format!(
                "backlog must be positive, got {}",
                backlog
            )));
        }
        let backlog = Backlog::new(backlog)
            .map_err(|e| BroadsideError::InvalidArgument(format!("invalid backlog: {}", e)))?;

        let bind_addr = if address.is_empty() || address == "0.0.0.0" {
            warn!(label = %self.label, port, "Listening on all interfaces");
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
        } else {
            (address, port)
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
                .ok_or_else(|| {
                    BroadsideError::InvalidArgument(format!("invalid bind address: {}", address))
                })?
        };

        // std enables SO_REUSEADDR before bind on Unix
        let listener = TcpListener::bind(bind_addr).map_err(|e| {
            BroadsideError::Resource(format!("bind to {} failed: {}", bind_addr, e))
        })?;
        listen(&listener, backlog)
            .map_err(|e| BroadsideError::Resource(format!("listen failed: {}", e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| BroadsideError::Resource(format!("getsockname failed: {}", e)))?;

        self.role = Role::Server;
        self.address = local.ip().to_string();
        self.port = local.port();
        info!(
            label = %self.label,
            address = %local,
            fd = listener.as_raw_fd(),
            "Listening"
        );
        self.socket = Some(Socket::Listener(listener));
        Ok(())
    }

    /// Accept one pending connection.
    ///
    /// Returns `Ok(None)` when the listener is non-blocking and nothing is
    /// pending. The accepted endpoint reports the peer's IP and this
    /// listener's port.
    pub fn accept(&self) -> Result<Option<Endpoint>> {
        let listener = match (&self.role, &self.socket) {
            (Role::Server, Some(Socket::Listener(listener))) => listener,
            _ => {
                return Err(BroadsideError::State(format!(
                    "accept on endpoint '{}' in role {}",
                    self.label, self.role
                )));
            }
        };

        let (stream, peer) = loop {
            match listener.accept() {
                Ok(accepted) => break accepted,
                Err(e) if e.kind() == ErrorKind::Interrupted => {
                    debug!(label = %self.label, "accept interrupted, retrying");
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => {
                    return Err(BroadsideError::Connection(format!("accept failed: {}", e)));
                }
            }
        };

        if stream.as_raw_fd() == libc::STDIN_FILENO {
            return Err(BroadsideError::Connection(
                "accept returned the standard input descriptor".into(),
            ));
        }

        let mut remote = Endpoint::new(format!("{}#{}", self.label, stream.as_raw_fd()));
        remote.role = Role::AcceptedRemote;
        remote.address = peer.ip().to_string();
        remote.port = self.port;
        info!(
            label = %self.label,
            peer = %peer,
            fd = stream.as_raw_fd(),
            "Accepted connection"
        );
        remote.socket = Some(Socket::Stream(stream));
        Ok(Some(remote))
    }

    /// Send one line; returns `false` instead of failing.
    ///
    /// The message must be non-empty, contain no newline and leave room for
    /// the terminator within the frame limit.
    pub fn send(&self, message: &str) -> bool {
        let stream = match (&self.role, &self.socket) {
            (Role::Client | Role::AcceptedRemote, Some(Socket::Stream(stream))) => stream,
            _ => {
                error!(label = %self.label, role = %self.role, "Send on endpoint that cannot send");
                return false;
            }
        };
        if message.is_empty() {
            error!(label = %self.label, "Refusing to send empty message");
            return false;
        }
        if message.len() >= MAX_FRAME_LEN {
            error!(
                label = %self.label,
                len = message.len(),
                "Refusing to send oversized message"
            );
            return false;
        }
        if message.contains('\n') {
            error!(label = %self.label, "Refusing to send message containing a newline");
            return false;
        }

        let mut frame = Vec::with_capacity(message.len() + 1);
        frame.extend_from_slice(message.as_bytes());
        frame.push(b'\n');

        match send(stream.as_raw_fd(), &frame, SEND_FLAGS) {
            Ok(sent) if sent == frame.len() => true,
            Ok(sent) => {
                warn!(label = %self.label, sent, expected = frame.len(), "Short send");
                false
            }
            Err(e) => {
                warn!(label = %self.label, error = %e, "Send failed");
                false
            }
        }
    }

    /// Read one line from a connected endpoint
    pub fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        let fd = match (&self.role, &self.socket) {
            (Role::Client | Role::AcceptedRemote, Some(Socket::Stream(stream))) => stream.as_fd(),
            _ => {
                return Err(BroadsideError::State(format!(
                    "read on endpoint '{}' in role {}",
                    self.label, self.role
                )));
            }
        };
        self.buffer.read_line(fd, timeout, &self.label)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let result = match &self.socket {
            Some(Socket::Listener(listener)) => listener.set_nonblocking(nonblocking),
            Some(Socket::Stream(stream)) => stream.set_nonblocking(nonblocking),
            None => {
                return Err(BroadsideError::State(format!(
                    "endpoint '{}' is not open",
                    self.label
                )));
            }
        };
        result.map_err(|e| BroadsideError::Resource(format!("failed to set O_NONBLOCK: {}", e)))
    }

    /// Shut down and close the socket; failures are logged only
    pub fn close(&mut self) {
        let Some(socket) = self.socket.take() else {
            return;
        };

        let raw = socket.as_fd().as_raw_fd();
        if let Socket::Stream(stream) = &socket {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                if e.kind() == ErrorKind::NotConnected {
                    debug!(label = %self.label, "Peer already disconnected");
                } else {
                    warn!(label = %self.label, error = %e, "Socket shutdown failed");
                }
            }
        }
        drop(socket);

        debug!(label = %self.label, role = %self.role, fd = raw, "Endpoint closed");
        self.role = Role::Unbound;
        self.address.clear();
        self.port = 0;
        self.buffer.clear();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handle = self.handle().map_or(-1, |fd| fd.as_raw_fd());
        write!(
            f,
            "Endpoint({},label={},address={}:{},handle={})",
            self.role, self.label, self.address, self.port, handle
        )
    }
}

impl Readable for Endpoint {
    fn readable_fd(&self) -> Option<BorrowedFd<'_>> {
        self.handle()
    }
}

impl LineChannel for Endpoint {
    fn label(&self) -> &str {
        &self.label
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        Endpoint::read_line(self, timeout)
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        if self.send(line) {
            Ok(())
        } else {
            Err(BroadsideError::Connection(format!(
                "failed to send to '{}'",
                self.label
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::wait_readable;
    use std::io::{BufRead, BufReader, Write};

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn server() -> Endpoint {
        let mut server = Endpoint::new("server");
        server.listen("127.0.0.1", 0, 8).unwrap();
        server
    }

    fn connected_pair() -> (Endpoint, Endpoint, Endpoint) {
        let server = server();
        let mut client = Endpoint::new("client");
        client.connect("127.0.0.1", server.port()).unwrap();
        let remote = server.accept().unwrap().unwrap();
        (server, client, remote)
    }

    #[test]
    fn test_listen_records_bound_port() {
        let server = server();
        assert_eq!(server.role(), Role::Server);
        assert_eq!(server.address(), "127.0.0.1");
        assert_ne!(server.port(), 0);
        assert!(server.is_open());
    }

    #[test]
    fn test_send_and_read_both_directions() {
        let (_server, mut client, mut remote) = connected_pair();
        assert_eq!(client.role(), Role::Client);
        assert_eq!(remote.role(), Role::AcceptedRemote);
        assert_eq!(remote.address(), "127.0.0.1");

        assert!(client.send("J|alice"));
        assert_eq!(remote.read_line(TIMEOUT).unwrap().as_deref(), Some("J|alice"));

        assert!(remote.send("N|alice"));
        assert!(remote.send("K|bob|timeout"));
        assert_eq!(client.read_line(TIMEOUT).unwrap().as_deref(), Some("N|alice"));
        assert_eq!(client.read_line(TIMEOUT).unwrap().as_deref(), Some("K|bob|timeout"));
    }

    #[test]
    fn test_send_rejects_bad_payloads() {
        let (server, client, _remote) = connected_pair();
        assert!(!client.send(""));
        assert!(!client.send("two\nlines"));
        assert!(!client.send(&"x".repeat(MAX_FRAME_LEN)));
        assert!(!server.send("servers never send"));
        assert!(!Endpoint::new("idle").send("hello"));
    }

    #[test]
    fn test_largest_frame_is_delivered() {
        let (_server, client, remote) = connected_pair();
        let payload = "y".repeat(MAX_FRAME_LEN - 1);
        assert!(client.send(&payload));

        let stream = match remote.socket.as_ref().unwrap() {
            Socket::Stream(stream) => stream.try_clone().unwrap(),
            Socket::Listener(_) => unreachable!(),
        };
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).unwrap();
        assert_eq!(line.trim_end_matches('\n'), payload);
    }

    #[test]
    fn test_connect_validates_arguments() {
        let mut client = Endpoint::new("client");
        let err = client.connect("", 4000).unwrap_err();
        assert!(matches!(err, BroadsideError::InvalidArgument(_)));
        let err = client.connect("127.0.0.1", 0).unwrap_err();
        assert!(matches!(err, BroadsideError::InvalidArgument(_)));
        assert_eq!(client.role(), Role::Unbound);
    }

    #[test]
    fn test_connect_without_listener_fails() {
        let port = {
            let spare = TcpListener::bind("127.0.0.1:0").unwrap();
            spare.local_addr().unwrap().port()
        };
        let mut client = Endpoint::new("client");
        let err = client.connect("127.0.0.1", port).unwrap_err();
        assert!(matches!(err, BroadsideError::Connection(_)));
        assert!(!client.is_open());
    }

    #[test]
    fn test_connect_twice_is_state_error() {
        let (_server, mut client, _remote) = connected_pair();
        let err = client.connect("127.0.0.1", 1).unwrap_err();
        assert!(err.is_state());
        assert_eq!(client.role(), Role::Client);
    }

    #[test]
    fn test_listen_rejects_non_positive_backlog() {
        let mut server = Endpoint::new("server");
        let err = server.listen("127.0.0.1", 0, 0).unwrap_err();
        assert!(matches!(err, BroadsideError::InvalidArgument(_)));
        assert!(!server.is_open());
    }

    #[test]
    fn test_listen_rejects_unparseable_address() {
        let mut server = Endpoint::new("server");
        let err = server.listen("not an address", 0, 4).unwrap_err();
        assert!(matches!(err, BroadsideError::InvalidArgument(_)));
    }

    #[test]
    fn test_listen_on_busy_port_is_resource_error() {
        let first = server();
        let mut second = Endpoint::new("second");
        let err = second.listen("127.0.0.1", first.port(), 4).unwrap_err();
        assert!(matches!(err, BroadsideError::Resource(_)));
    }

    #[test]
    fn test_nonblocking_accept_returns_none() {
        let server = server();
        server.set_nonblocking(true).unwrap();
        assert!(server.accept().unwrap().is_none());
    }

    #[test]
    fn test_accept_requires_server_role() {
        let (_server, client, _remote) = connected_pair();
        assert!(client.accept().unwrap_err().is_state());
        assert!(Endpoint::new("idle").accept().unwrap_err().is_state());
    }

    #[test]
    fn test_read_on_server_is_state_error() {
        let mut server = server();
        assert!(server.read_line(TIMEOUT).unwrap_err().is_state());
    }

    #[test]
    fn test_close_is_idempotent_and_resets_identity() {
        let (_server, mut client, mut remote) = connected_pair();
        client.close();
        client.close();
        assert_eq!(client.role(), Role::Unbound);
        assert!(client.handle().is_none());
        assert_eq!(client.port(), 0);

        // Peer observes end of stream
        assert_eq!(remote.read_line(TIMEOUT).unwrap(), None);
        assert!(!client.send("gone"));
    }

    #[test]
    fn test_display_shows_role_and_address() {
        let server = server();
        let text = server.to_string();
        assert!(text.starts_with("Endpoint(Server,label=server,address=127.0.0.1:"));

        let idle = Endpoint::new("idle");
        assert_eq!(idle.to_string(), "Endpoint(Unbound,label=idle,address=:0,handle=-1)");
    }

    #[test]
    fn test_endpoint_as_line_channel() {
        let (_server, client, remote) = connected_pair();
        let mut channels: Vec<Box<dyn LineChannel>> = vec![Box::new(client), Box::new(remote)];

        channels[0].write_line("M|alice|hi|all\n").unwrap();
        let line = channels[1].read_line(TIMEOUT).unwrap();
        assert_eq!(line.as_deref(), Some("M|alice|hi|all"));
        assert_eq!(channels[0].label(), "client");
    }

    #[test]
    fn test_wait_readable_sees_pending_connection() {
        let server = server();
        let idle = wait_readable(&[&server], Duration::from_millis(20)).unwrap();
        assert!(idle.is_empty());

        let mut raw = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
        let ready = wait_readable(&[&server], TIMEOUT).unwrap();
        assert_eq!(ready, vec![0]);

        let mut remote = server.accept().unwrap().unwrap();
        raw.write_all(b"hello\n").unwrap();
        assert_eq!(remote.read_line(TIMEOUT).unwrap().as_deref(), Some("hello"));
    }
}

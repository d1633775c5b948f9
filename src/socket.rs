//! Socket objects: lifecycle state machine, option flags, address caches and
//! the buffered I/O plumbing shared by the TCP and UDP specializations.

use std::cmp;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use libc;
use socket2::{SockAddr, Socket as SysSocket};

use address::{self, Family};
use event::{self, EventId};
use sys;
use tcp;
use udp;

/// Default capacity of the buffered inbound byte window.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;
/// Default capacity of the buffered outbound byte window.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 8192;

pub(crate) const SOCKETFLAG_BLOCKING: u32 = 0x0000_0001;
pub(crate) const SOCKETFLAG_TCPDELAY: u32 = 0x0000_0002;
pub(crate) const SOCKETFLAG_REUSE_ADDR: u32 = 0x0000_0004;
pub(crate) const SOCKETFLAG_REUSE_PORT: u32 = 0x0000_0008;
pub(crate) const SOCKETFLAG_POLLED: u32 = 0x0000_0010;
pub(crate) const SOCKETFLAG_CONNECTION_PENDING: u32 = 0x0000_0020;
pub(crate) const SOCKETFLAG_HANGUP_PENDING: u32 = 0x0000_0040;
pub(crate) const SOCKETFLAG_ERROR_PENDING: u32 = 0x0000_0080;
pub(crate) const SOCKETFLAG_REFLUSH: u32 = 0x0000_0100;

const PENDING_FLAGS: u32 =
    SOCKETFLAG_CONNECTION_PENDING | SOCKETFLAG_HANGUP_PENDING | SOCKETFLAG_ERROR_PENDING;

static NEXT_SOCKET_ID: AtomicUsize = AtomicUsize::new(1);

/// Shared handle to a socket object.
pub type SocketHandle = Arc<Socket>;

/// Protocol kind of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// Stream socket (TCP)
    Tcp,
    /// Datagram socket (UDP)
    Udp,
}

/// Lifecycle state of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketState {
    /// No connection; the descriptor may not even be open yet
    NotConnected,
    /// An asynchronous connect is in flight
    Connecting,
    /// Connected to a remote endpoint
    Connected,
    /// Listening for incoming connections
    Listening,
    /// Connection ended; buffered inbound bytes may remain readable
    Disconnected,
}

/// A TCP or UDP socket.
///
/// The OS descriptor is opened lazily by the first operation that fixes the
/// address family (`bind`, `connect`, `sendto`). All operations take `&self`;
/// the internal state is serialized by a per-socket mutex, so a blocking
/// operation holds the socket for its duration. Sockets registered with a
/// poller are expected to be non-blocking.
pub struct Socket {
    id: usize,
    protocol: Protocol,
    inner: Mutex<Inner>,
}

pub(crate) struct Inner {
    pub sys: Option<SysSocket>,
    pub family: Option<Family>,
    pub state: SocketState,
    pub flags: u32,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub buffer_in: Vec<u8>,
    pub buffer_out: Vec<u8>,
    pub read_in: usize,
    pub write_in: usize,
    pub write_out: usize,
    pub last_event: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl Inner {
    fn new() -> Inner {
        Inner {
            sys: None,
            family: None,
            state: SocketState::NotConnected,
            flags: SOCKETFLAG_BLOCKING,
            local: None,
            remote: None,
            buffer_in: vec![0; DEFAULT_READ_BUFFER_SIZE],
            buffer_out: vec![0; DEFAULT_WRITE_BUFFER_SIZE],
            read_in: 0,
            write_in: 0,
            write_out: 0,
            last_event: 0,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub fn sys(&self) -> io::Result<&SysSocket> {
        match self.sys {
            Some(ref sys) => Ok(sys),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket not open")),
        }
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.sys.as_ref().map(|sys| sys.as_raw_fd())
    }

    pub fn set_flag(&mut self, flag: u32, enable: bool) {
        if enable {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    /// Bytes buffered in the inbound window, over the ring wrap.
    pub fn buffered_in(&self) -> usize {
        if self.write_in >= self.read_in {
            self.write_in - self.read_in
        } else {
            (self.buffer_in.len() - self.read_in) + self.write_in
        }
    }

    /// Bytes buffered for reading plus whatever the kernel reports available.
    pub fn available_read(&self) -> usize {
        let kernel = match self.fd() {
            Some(fd) => sys::available(fd).unwrap_or(0),
            None => 0,
        };
        self.buffered_in() + kernel
    }

    pub fn store_local_address(&mut self) {
        self.local = self
            .sys
            .as_ref()
            .and_then(|sys| sys.local_addr().ok())
            .and_then(|addr| to_socket_addr(&addr));
    }

    /// Close the descriptor after a graceful shutdown attempt. Idempotent.
    /// Buffered inbound bytes stay readable after the close.
    pub fn close(&mut self, id: usize) {
        if let Some(sys) = self.sys.take() {
            debug!("Closing socket {} (fd {})", id, sys.as_raw_fd());
            let _ = sys.set_nonblocking(true);
            let _ = sys.shutdown(Shutdown::Both);
        }
        self.state = SocketState::Disconnected;
        self.flags &= !(SOCKETFLAG_POLLED | PENDING_FLAGS | SOCKETFLAG_REFLUSH);
        self.local = None;
        self.remote = None;
    }
}

impl Socket {
    /// Create a new TCP socket object.
    pub fn tcp() -> SocketHandle {
        Socket::allocate(Protocol::Tcp)
    }

    /// Create a new UDP socket object.
    pub fn udp() -> SocketHandle {
        Socket::allocate(Protocol::Udp)
    }

    pub(crate) fn allocate(protocol: Protocol) -> SocketHandle {
        let id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
        debug!("Allocated {:?} socket {}", protocol, id);
        Arc::new(Socket {
            id: id,
            protocol: protocol,
            inner: Mutex::new(Inner::new()),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<Inner> {
        self.inner.lock().unwrap()
    }

    /// Numeric identifier of this socket object, unique within the process.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Protocol kind of this socket.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Bind the socket to a local address, opening the descriptor with the
    /// address family if needed. Rebinding a bound socket fails.
    pub fn bind(&self, address: &SocketAddr) -> io::Result<()> {
        let mut inner = self.lock();
        if inner.state != SocketState::NotConnected || inner.local.is_some() {
            warn!(
                "Unable to bind socket {} in state {:?}",
                self.id, inner.state
            );
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "socket already bound"));
        }
        self.ensure_open(&mut inner, Family::of(address))?;
        {
            let sys = inner.sys()?;
            if let Err(err) = sys.bind(&SockAddr::from(*address)) {
                warn!(
                    "Unable to bind socket {} to local address {}: {}",
                    self.id,
                    address::format_address(Some(address), true),
                    err
                );
                return Err(err);
            }
        }
        inner.store_local_address();
        Ok(())
    }

    /// Connect the socket to a remote address.
    ///
    /// With `timeout` of `None` the call does not wait beyond the descriptor's
    /// own blocking behavior: a blocking socket blocks until the connect
    /// completes, a non-blocking socket advances to `Connecting` and returns
    /// immediately. With `Some(duration)` the descriptor is switched to
    /// non-blocking for a bounded writable wait (the original blocking flag
    /// is restored afterwards) and the result is `Connected` or an error.
    pub fn connect(&self, address: &SocketAddr, timeout: Option<Duration>) -> io::Result<()> {
        let mut inner = self.lock();
        if inner.state != SocketState::NotConnected {
            warn!(
                "Unable to connect socket {} in state {:?} to remote address {}",
                self.id,
                inner.state,
                address::format_address(Some(address), true)
            );
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "socket already connected",
            ));
        }
        self.ensure_open(&mut inner, Family::of(address))?;

        inner.flags &= !PENDING_FLAGS;
        inner.last_event = 0;

        match connect_fd(&mut inner, address, timeout) {
            Ok(()) => {
                inner.remote = Some(*address);
                if inner.local.is_none() {
                    inner.store_local_address();
                }
                debug!(
                    "{} socket {} to remote host {}",
                    if inner.state == SocketState::Connecting {
                        "Connecting"
                    } else {
                        "Connected"
                    },
                    self.id,
                    address::format_address(Some(address), true)
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    "Unable to connect socket {} to remote address {}: {}",
                    self.id,
                    address::format_address(Some(address), true),
                    err
                );
                Err(err)
            }
        }
    }

    /// Close the socket. Idempotent; buffered inbound bytes stay readable.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.close(self.id);
    }

    /// Current state of the socket, refined by a zero-timeout readiness probe
    /// when a connect is in flight or the remote end may have closed.
    pub fn state(&self) -> SocketState {
        let mut inner = self.lock();
        poll_state(&mut inner, self.id)
    }

    /// Whether the socket is in blocking mode.
    pub fn blocking(&self) -> bool {
        self.lock().flags & SOCKETFLAG_BLOCKING != 0
    }

    /// Switch the socket between blocking and non-blocking mode. Applied to
    /// the descriptor immediately when open, and at open time otherwise.
    pub fn set_blocking(&self, blocking: bool) {
        let mut inner = self.lock();
        inner.set_flag(SOCKETFLAG_BLOCKING, blocking);
        if let Some(ref sys) = inner.sys {
            let _ = sys.set_nonblocking(!blocking);
        }
    }

    /// Whether local address reuse is requested.
    pub fn reuse_address(&self) -> bool {
        self.lock().flags & SOCKETFLAG_REUSE_ADDR != 0
    }

    /// Request local address reuse (`SO_REUSEADDR`).
    pub fn set_reuse_address(&self, reuse: bool) {
        let mut inner = self.lock();
        inner.set_flag(SOCKETFLAG_REUSE_ADDR, reuse);
        if let Some(ref sys) = inner.sys {
            let _ = sys.set_reuse_address(reuse);
        }
    }

    /// Whether local port reuse is requested.
    pub fn reuse_port(&self) -> bool {
        self.lock().flags & SOCKETFLAG_REUSE_PORT != 0
    }

    /// Request local port reuse (`SO_REUSEPORT`).
    pub fn set_reuse_port(&self, reuse: bool) {
        let mut inner = self.lock();
        inner.set_flag(SOCKETFLAG_REUSE_PORT, reuse);
        if let Some(ref sys) = inner.sys {
            let _ = sys.set_reuse_port(reuse);
        }
    }

    /// Local address the socket is bound to, cached on bind/connect.
    pub fn address_local(&self) -> Option<SocketAddr> {
        self.lock().local
    }

    /// Remote address the socket is connected to, cached on connect/accept.
    pub fn address_remote(&self) -> Option<SocketAddr> {
        self.lock().remote
    }

    /// Total bytes read through the buffered stream interface.
    pub fn bytes_read(&self) -> u64 {
        self.lock().bytes_read
    }

    /// Total bytes written through the buffered stream interface.
    pub fn bytes_written(&self) -> u64 {
        self.lock().bytes_written
    }

    pub(crate) fn buffered_in(&self) -> usize {
        self.lock().buffered_in()
    }

    pub(crate) fn ensure_open(&self, inner: &mut Inner, family: Family) -> io::Result<()> {
        if inner.sys.is_some() {
            return Ok(());
        }
        let sys = match self.protocol {
            Protocol::Tcp => tcp::open(family, self.id),
            Protocol::Udp => udp::open(family, self.id),
        }?;
        // Carry cached option flags onto the fresh descriptor
        if inner.flags & SOCKETFLAG_BLOCKING == 0 {
            let _ = sys.set_nonblocking(true);
        }
        if inner.flags & SOCKETFLAG_REUSE_ADDR != 0 {
            let _ = sys.set_reuse_address(true);
        }
        if inner.flags & SOCKETFLAG_REUSE_PORT != 0 {
            let _ = sys.set_reuse_port(true);
        }
        if self.protocol == Protocol::Tcp {
            let _ = sys.set_nodelay(inner.flags & SOCKETFLAG_TCPDELAY == 0);
        }
        inner.family = Some(family);
        inner.sys = Some(sys);
        Ok(())
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.try_lock() {
            Ok(inner) => write!(
                f,
                "Socket {{ id: {}, protocol: {:?}, state: {:?} }}",
                self.id, self.protocol, inner.state
            ),
            Err(_) => write!(f, "Socket {{ id: {}, protocol: {:?} }}", self.id, self.protocol),
        }
    }
}

pub(crate) fn to_socket_addr(address: &SockAddr) -> Option<SocketAddr> {
    address
        .as_inet()
        .map(SocketAddr::V4)
        .or_else(|| address.as_inet6().map(SocketAddr::V6))
}

fn connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

/// The protocol-independent connect dance: issue the connect, and when it is
/// in progress either leave the socket `Connecting` (no timeout) or wait for
/// writability and check `SO_ERROR` (bounded timeout).
fn connect_fd(inner: &mut Inner, address: &SocketAddr, timeout: Option<Duration>) -> io::Result<()> {
    let blocking = inner.flags & SOCKETFLAG_BLOCKING != 0;
    let raw = SockAddr::from(*address);

    if timeout.is_some() && blocking {
        if let Ok(sys) = inner.sys() {
            let _ = sys.set_nonblocking(true);
        }
    }

    let result = {
        let sys = inner.sys()?;
        match sys.connect(&raw) {
            Ok(()) => Ok(SocketState::Connected),
            Err(ref err) if connect_in_progress(err) => match timeout {
                None => Ok(SocketState::Connecting),
                Some(duration) => match sys::await_writable(sys.as_raw_fd(), Some(duration)) {
                    Ok(true) => match sys.take_error() {
                        Ok(None) => Ok(SocketState::Connected),
                        Ok(Some(err)) => Err(err),
                        Err(err) => Err(err),
                    },
                    Ok(false) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
                    Err(err) => Err(err),
                },
            },
            Err(err) => Err(err),
        }
    };

    if timeout.is_some() && blocking {
        if let Ok(sys) = inner.sys() {
            let _ = sys.set_nonblocking(false);
        }
    }

    inner.state = result?;
    Ok(())
}

/// Refine the socket state with zero-timeout readiness probes: a pending
/// connect resolves to `Connected` or a close, a broken descriptor while
/// `Connected` resolves to `Disconnected`, and a drained `Disconnected`
/// socket drops its descriptor.
pub(crate) fn poll_state(inner: &mut Inner, id: usize) -> SocketState {
    match inner.state {
        SocketState::Connecting => {
            if let Some(fd) = inner.fd() {
                match sys::connect_probe(fd) {
                    sys::ConnectProbe::Error => {
                        debug!("Socket {}: error in state Connecting", id);
                        inner.close(id);
                    }
                    sys::ConnectProbe::Connected => {
                        debug!("Socket {}: Connecting -> Connected", id);
                        inner.state = SocketState::Connected;
                    }
                    sys::ConnectProbe::Pending => {}
                }
            }
        }
        SocketState::Connected => {
            let alive = match inner.fd() {
                Some(fd) => sys::available(fd).is_some(),
                None => false,
            };
            if !alive {
                debug!("Socket {}: hangup in state Connected", id);
                inner.state = SocketState::Disconnected;
            }
        }
        _ => {}
    }

    if inner.state == SocketState::Disconnected && inner.sys.is_some() && inner.buffered_in() == 0 {
        debug!("Socket {}: all data read in state Disconnected", id);
        inner.close(id);
    }

    inner.state
}

/// Close the socket and emit a single `Hangup` event, latched so repeated
/// failures surface only once per drain cycle.
pub(crate) fn hangup(sock: &SocketHandle, inner: &mut Inner) {
    inner.close(sock.id());
    if inner.flags & SOCKETFLAG_HANGUP_PENDING == 0 {
        inner.flags |= SOCKETFLAG_HANGUP_PENDING;
        event::post(EventId::Hangup, Some(sock.clone()));
    }
}

/// Error kinds that terminate the connection rather than backing pressure.
pub(crate) fn is_fatal_stream_error(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::TimedOut
        | io::ErrorKind::NotConnected => true,
        _ => false,
    }
}

/// Protocol dispatch for the buffered read hook.
pub(crate) fn read_buffered(sock: &SocketHandle, inner: &mut Inner, wanted: usize) -> usize {
    match sock.protocol() {
        Protocol::Tcp => tcp::read_buffered(sock, inner, wanted),
        Protocol::Udp => udp::read_buffered(sock, inner, wanted),
    }
}

/// Protocol dispatch for the buffered write hook.
pub(crate) fn write_buffered(sock: &SocketHandle, inner: &mut Inner) -> usize {
    match sock.protocol() {
        Protocol::Tcp => tcp::write_buffered(sock, inner),
        Protocol::Udp => udp::write_buffered(sock, inner),
    }
}

/// Drain the outbound buffer if there is anything to send and the socket is
/// in a state to send it.
pub(crate) fn flush_buffered(sock: &SocketHandle, inner: &mut Inner) {
    if inner.write_out == 0 {
        return;
    }
    if inner.state != SocketState::Connected {
        return;
    }
    write_buffered(sock, inner);
}

/// Fill the inbound ring buffer from the descriptor. Shared by both
/// protocol hooks; the caller has already validated the socket state.
///
/// With a non-blocking descriptor and nothing available this returns 0
/// without blocking; with a blocking descriptor and `wanted > 0` it blocks
/// for at least one receive.
pub(crate) fn read_into_buffer(sock: &SocketHandle, inner: &mut Inner, wanted: usize) -> usize {
    let capacity = inner.buffer_in.len();

    let max_read = if inner.write_in == inner.read_in {
        inner.write_in = 0;
        inner.read_in = 0;
        capacity - 1
    } else if inner.write_in > inner.read_in {
        let mut span = capacity - inner.write_in;
        if inner.read_in == 0 {
            // Keep the write offset from catching the read offset on wrap
            span -= 1;
        }
        span
    } else {
        inner.read_in - inner.write_in - 1
    };

    if max_read == 0 {
        return 0;
    }

    let blocking = inner.flags & SOCKETFLAG_BLOCKING != 0;
    let available = match inner.fd() {
        Some(fd) => sys::available(fd).unwrap_or(0),
        None => return 0,
    };
    let try_read = if available > 0 {
        cmp::min(max_read, available)
    } else {
        if wanted == 0 || !blocking {
            return 0;
        }
        max_read
    };

    let write_at = inner.write_in;
    let result = {
        let Inner {
            ref sys,
            ref mut buffer_in,
            ..
        } = *inner;
        match *sys {
            Some(ref sys) => sys.recv(&mut buffer_in[write_at..write_at + try_read]),
            None => return 0,
        }
    };

    match result {
        Ok(0) => {
            debug!(
                "Socket {} closed gracefully on remote end: {}",
                sock.id(),
                address::format_address(inner.remote.as_ref(), true)
            );
            hangup(sock, inner);
            0
        }
        Ok(read) => {
            if available == 0 && read == try_read {
                warn!(
                    "Socket {}: potential partial blocking read {} of {} bytes ({} available)",
                    sock.id(),
                    read,
                    try_read,
                    available
                );
            }
            trace!(
                "Socket {} read {} of {} bytes ({} available, {} wanted) to buffer position {}",
                sock.id(),
                read,
                try_read,
                available,
                wanted,
                write_at
            );
            inner.write_in += read;
            debug_assert!(inner.write_in <= capacity, "buffer overwrite");
            if inner.write_in >= capacity {
                inner.write_in = 0;
            }
            let mut total = read;
            // Wrapped at the end of the buffer with more data pending
            if inner.state == SocketState::Connected
                && try_read < wanted
                && available > try_read
                && inner.write_in == 0
                && inner.read_in > 1
            {
                total += read_into_buffer(sock, inner, wanted - try_read);
            }
            total
        }
        Err(err) => {
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!("Socket recv() failed on socket {}: {}", sock.id(), err);
            }
            if is_fatal_stream_error(&err) {
                hangup(sock, inner);
            }
            poll_state(inner, sock.id());
            0
        }
    }
}

/// Drain the outbound buffer to the descriptor. Shared by both protocol
/// hooks; residual bytes after a partial drain are shifted to offset 0 and
/// the reflush mark is set.
pub(crate) fn drain_out_buffer(sock: &SocketHandle, inner: &mut Inner) -> usize {
    let mut sent = 0;
    loop {
        if sent >= inner.write_out {
            inner.flags &= !SOCKETFLAG_REFLUSH;
            inner.write_out = 0;
            return sent;
        }

        let result = {
            let Inner {
                ref sys,
                ref buffer_out,
                write_out,
                ..
            } = *inner;
            match *sys {
                Some(ref sys) => sys.send(&buffer_out[sent..write_out]),
                None => break,
            }
        };

        match result {
            Ok(written) if written > 0 => {
                trace!(
                    "Socket {} wrote {} of {} bytes from buffer position {}",
                    sock.id(),
                    written,
                    inner.write_out - sent,
                    sent
                );
                sent += written;
            }
            Ok(_) => break,
            Err(err) => {
                if err.kind() == io::ErrorKind::WouldBlock {
                    warn!(
                        "Partial socket send() on {}: {} of {} bytes written",
                        sock.id(),
                        sent,
                        inner.write_out
                    );
                } else {
                    warn!("Socket send() failed on socket {}: {}", sock.id(), err);
                    if is_fatal_stream_error(&err) {
                        hangup(sock, inner);
                    }
                    if inner.state != SocketState::NotConnected {
                        poll_state(inner, sock.id());
                    }
                }
                break;
            }
        }
    }

    if sent > 0 {
        let write_out = inner.write_out;
        inner.buffer_out.copy_within(sent..write_out, 0);
        inner.write_out -= sent;
    }
    if inner.write_out > 0 {
        inner.flags |= SOCKETFLAG_REFLUSH;
    }
    sent
}

/// Size the buffered windows. Only valid while nothing is buffered.
pub(crate) fn resize_buffers(sock: &SocketHandle, inner: &mut Inner, buffer_in: usize, buffer_out: usize) {
    if inner.buffered_in() != 0 || inner.write_out != 0 {
        error!(
            "Unable to resize stream buffers on socket {} with data pending",
            sock.id()
        );
        return;
    }
    inner.read_in = 0;
    inner.write_in = 0;
    inner.buffer_in = vec![0; cmp::max(buffer_in, 16)];
    inner.buffer_out = vec![0; cmp::max(buffer_out, 16)];
}

//! TCP specialization: listen/accept, the Nagle toggle and the stream
//! parameters of a reliable in-order transport.

use std::io;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use libc;
use socket2::{Domain, Protocol as IpProtocol, Socket as SysSocket, Type};

use address::{self, Family};
use socket::{self, Inner, Protocol, Socket, SocketHandle, SocketState};
use socket::{SOCKETFLAG_BLOCKING, SOCKETFLAG_CONNECTION_PENDING, SOCKETFLAG_TCPDELAY};
use stream::StreamParams;
use sys;

/// Default TCP payload unit in bytes, a suggested segment size for
/// applications that chunk their writes.
pub const DEFAULT_TCP_PACKET_SIZE: usize = 1024;

pub(crate) fn open(family: Family, id: usize) -> io::Result<SysSocket> {
    let domain = match family {
        Family::Ipv4 => Domain::ipv4(),
        Family::Ipv6 => Domain::ipv6(),
    };
    match SysSocket::new(domain, Type::stream(), Some(IpProtocol::tcp())) {
        Ok(sys) => {
            debug!("Opened TCP/IP socket {} (fd {})", id, sys.as_raw_fd());
            Ok(sys)
        }
        Err(err) => {
            error!("Unable to open TCP/IP socket {}: {}", id, err);
            Err(err)
        }
    }
}

pub(crate) fn stream_params(sock: &SocketHandle) -> StreamParams {
    StreamParams {
        inorder: true,
        reliable: true,
        path: format!("tcp://{}", sock.id()),
    }
}

pub(crate) fn read_buffered(sock: &SocketHandle, inner: &mut Inner, wanted: usize) -> usize {
    match inner.state {
        SocketState::Connected | SocketState::Disconnected => {
            socket::read_into_buffer(sock, inner, wanted)
        }
        _ => 0,
    }
}

pub(crate) fn write_buffered(sock: &SocketHandle, inner: &mut Inner) -> usize {
    if inner.state != SocketState::Connected {
        return 0;
    }
    socket::drain_out_buffer(sock, inner)
}

impl Socket {
    /// Start listening for incoming connections. The socket must be TCP,
    /// locally bound and not yet connected; the backlog is the kernel
    /// maximum.
    pub fn listen(&self) -> io::Result<()> {
        let mut inner = self.lock();
        if self.protocol() != Protocol::Tcp {
            error!("Trying to listen on non-TCP socket {}", self.id());
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "listen requires a TCP socket"));
        }
        if inner.state != SocketState::NotConnected || inner.sys.is_none() || inner.local.is_none() {
            // Must be locally bound
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket not bound"));
        }

        {
            let sys = inner.sys()?;
            if let Err(err) = sys.listen(libc::SOMAXCONN) {
                error!(
                    "Unable to listen on TCP/IP socket {} {}: {}",
                    self.id(),
                    address::format_address(inner.local.as_ref(), true),
                    err
                );
                return Err(err);
            }
        }

        info!(
            "Listening on TCP/IP socket {} {}",
            self.id(),
            address::format_address(inner.local.as_ref(), true)
        );
        inner.state = SocketState::Listening;
        Ok(())
    }

    /// Accept a pending connection, returning a new connected TCP socket
    /// with the peer's address cached as its remote address.
    ///
    /// With `timeout` of `None` the wait follows the descriptor's blocking
    /// behavior; with `Some(duration)` the descriptor is switched to
    /// non-blocking for a bounded readable wait and the original blocking
    /// flag is restored afterwards. Accepted sockets start out blocking.
    pub fn accept(&self, timeout: Option<Duration>) -> io::Result<SocketHandle> {
        let mut inner = self.lock();
        if self.protocol() != Protocol::Tcp {
            error!("Trying to accept on non-TCP socket {}", self.id());
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "accept requires a TCP socket"));
        }
        if inner.state != SocketState::Listening || inner.sys.is_none() || inner.local.is_none() {
            error!(
                "Unable to accept on a non-listening TCP/IP socket {} in state {:?}",
                self.id(),
                inner.state
            );
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket not listening"));
        }

        let blocking = inner.flags & SOCKETFLAG_BLOCKING != 0;
        if timeout.is_some() && blocking {
            if let Ok(sys) = inner.sys() {
                let _ = sys.set_nonblocking(true);
            }
        }

        let result = {
            let sys = inner.sys()?;
            match sys.accept() {
                Ok(pair) => Ok(pair),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock && timeout.is_some() => {
                    match sys::await_readable(sys.as_raw_fd(), timeout) {
                        Ok(true) => sys.accept(),
                        Ok(false) => Err(io::Error::new(io::ErrorKind::TimedOut, "accept timed out")),
                        Err(err) => Err(err),
                    }
                }
                Err(err) => Err(err),
            }
        };

        if timeout.is_some() && blocking {
            if let Ok(sys) = inner.sys() {
                let _ = sys.set_nonblocking(false);
            }
        }

        let (accepted, peer) = match result {
            Ok(pair) => pair,
            Err(err) => {
                debug!("Accept on socket {} returned no socket: {}", self.id(), err);
                return Err(err);
            }
        };

        // Connection drained, re-arm the connection event edge
        inner.flags &= !SOCKETFLAG_CONNECTION_PENDING;

        let handle = Socket::allocate(Protocol::Tcp);
        {
            let mut accepted_inner = handle.lock();
            // Accepted descriptors do not inherit the listener's non-blocking
            // mode; they start out blocking, matching the fresh flag word
            let _ = accepted.set_nonblocking(false);
            accepted_inner.family = inner.family;
            accepted_inner.state = SocketState::Connected;
            accepted_inner.remote = socket::to_socket_addr(&peer);
            accepted_inner.sys = Some(accepted);
            accepted_inner.store_local_address();

            info!(
                "Accepted connection on TCP/IP socket {} {}: created socket {} with remote address {}",
                self.id(),
                address::format_address(inner.local.as_ref(), true),
                handle.id(),
                address::format_address(accepted_inner.remote.as_ref(), true)
            );
        }

        Ok(handle)
    }

    /// Whether the Nagle algorithm is enabled ("delay" on).
    pub fn delay(&self) -> bool {
        self.lock().flags & SOCKETFLAG_TCPDELAY != 0
    }

    /// Enable or disable the Nagle algorithm. Delay on means `TCP_NODELAY`
    /// is cleared; the default is delay off.
    pub fn set_delay(&self, delay: bool) {
        let mut inner = self.lock();
        inner.set_flag(SOCKETFLAG_TCPDELAY, delay);
        if let Some(ref sys) = inner.sys {
            let _ = sys.set_nodelay(!delay);
        }
    }
}

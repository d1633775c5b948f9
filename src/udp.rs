//! UDP specialization: datagram bind/connect semantics, buffered I/O over a
//! connected socket and unconnected `recvfrom`/`sendto`.

use std::cmp;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

use socket2::{Domain, Protocol as IpProtocol, SockAddr, Socket as SysSocket, Type};

use address::{self, Family};
use socket::{self, Inner, Protocol, Socket, SocketHandle, SocketState};
use socket::SOCKETFLAG_BLOCKING;
use stream::StreamParams;
use sys;

/// Default UDP payload unit in bytes, a suggested datagram size for
/// applications that chunk their sends.
pub const DEFAULT_UDP_PACKET_SIZE: usize = 1024;

pub(crate) fn open(family: Family, id: usize) -> io::Result<SysSocket> {
    let domain = match family {
        Family::Ipv4 => Domain::ipv4(),
        Family::Ipv6 => Domain::ipv6(),
    };
    match SysSocket::new(domain, Type::dgram(), Some(IpProtocol::udp())) {
        Ok(sys) => {
            debug!("Opened UDP socket {} (fd {})", id, sys.as_raw_fd());
            Ok(sys)
        }
        Err(err) => {
            error!("Unable to open UDP socket {}: {}", id, err);
            Err(err)
        }
    }
}

pub(crate) fn stream_params(sock: &SocketHandle) -> StreamParams {
    StreamParams {
        inorder: false,
        reliable: false,
        path: format!("udp://{}", sock.id()),
    }
}

pub(crate) fn read_buffered(sock: &SocketHandle, inner: &mut Inner, wanted: usize) -> usize {
    if inner.state != SocketState::Connected {
        // Unconnected datagram I/O must go through recvfrom
        error!(
            "Trying to stream read from an unconnected UDP socket {} in state {:?}",
            sock.id(),
            inner.state
        );
        return 0;
    }
    socket::read_into_buffer(sock, inner, wanted)
}

pub(crate) fn write_buffered(sock: &SocketHandle, inner: &mut Inner) -> usize {
    if inner.state != SocketState::Connected {
        // Unconnected datagram I/O must go through sendto
        error!(
            "Trying to stream send from an unconnected UDP socket {} in state {:?}",
            sock.id(),
            inner.state
        );
        return 0;
    }
    socket::drain_out_buffer(sock, inner)
}

impl Socket {
    /// Receive a single datagram on an unconnected, bound UDP socket.
    ///
    /// Returns the payload and the sender's address. On a non-blocking
    /// socket with nothing pending the error kind is `WouldBlock`; a
    /// blocking socket waits for a datagram. Calling this on a connected
    /// or unbound socket is a programming error and fails.
    pub fn recvfrom(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut inner = self.lock();
        if self.protocol() != Protocol::Udp {
            error!("Trying to datagram read from non-UDP socket {}", self.id());
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "recvfrom requires a UDP socket"));
        }
        if inner.state != SocketState::NotConnected {
            error!(
                "Trying to datagram read from a connected UDP socket {} in state {:?}",
                self.id(),
                inner.state
            );
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "recvfrom requires an unconnected socket",
            ));
        }
        if inner.sys.is_none() || inner.local.is_none() {
            error!("Trying to datagram read from an unbound UDP socket {}", self.id());
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket not bound"));
        }

        // Re-arm data events for polled sockets draining through this path
        inner.last_event = 0;

        let capacity = inner.buffer_in.len();
        let blocking = inner.flags & SOCKETFLAG_BLOCKING != 0;
        let available = match inner.fd() {
            Some(fd) => sys::available(fd).unwrap_or(0),
            None => 0,
        };
        let try_read = if available > 0 {
            cmp::min(capacity, available)
        } else {
            if !blocking {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "no datagram available"));
            }
            capacity
        };

        let result = {
            let Inner {
                ref sys,
                ref mut buffer_in,
                ..
            } = *inner;
            match *sys {
                Some(ref sys) => sys.recv_from(&mut buffer_in[..try_read]),
                None => return Err(io::Error::new(io::ErrorKind::NotConnected, "socket not open")),
            }
        };

        let (read, peer) = match result {
            Ok(pair) => pair,
            Err(err) => {
                if err.kind() != io::ErrorKind::WouldBlock {
                    warn!("Socket recvfrom() failed on UDP socket {}: {}", self.id(), err);
                }
                return Err(err);
            }
        };

        let peer = match socket::to_socket_addr(&peer) {
            Some(peer) => peer,
            None => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported sender address family"))
            }
        };

        if available == 0 && read == try_read {
            warn!(
                "Socket {}: potential partial blocking UDP datagram read {} of {} bytes",
                self.id(),
                read,
                try_read
            );
        }
        trace!(
            "Socket {} read {} of {} bytes from UDP socket to datagram",
            self.id(),
            read,
            try_read
        );

        // The sender is cached as the current remote peer
        inner.remote = Some(peer);

        Ok((inner.buffer_in[..read].to_vec(), peer))
    }

    /// Send a single datagram to a peer from an unconnected UDP socket,
    /// lazily opening the descriptor with the peer's family. The kernel
    /// autobinds the socket on first send and the resulting local address
    /// is cached.
    pub fn sendto(&self, data: &[u8], to: &SocketAddr) -> io::Result<usize> {
        let mut inner = self.lock();
        if self.protocol() != Protocol::Udp {
            error!("Trying to datagram send from non-UDP socket {}", self.id());
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "sendto requires a UDP socket"));
        }
        if inner.state != SocketState::NotConnected {
            error!(
                "Trying to datagram send from a connected UDP socket {} in state {:?}",
                self.id(),
                inner.state
            );
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "sendto requires an unconnected socket",
            ));
        }
        self.ensure_open(&mut inner, Family::of(to))?;

        let result = {
            let sys = inner.sys()?;
            sys.send_to(data, &SockAddr::from(*to))
        };

        let sent = match result {
            Ok(sent) => {
                if sent != data.len() {
                    warn!(
                        "Socket {}: partial UDP datagram write {} of {} bytes",
                        self.id(),
                        sent,
                        data.len()
                    );
                }
                trace!(
                    "Socket {} wrote {} of {} bytes to UDP socket at {}",
                    self.id(),
                    sent,
                    data.len(),
                    address::format_address(Some(to), true)
                );
                sent
            }
            Err(err) => {
                if err.kind() == io::ErrorKind::WouldBlock {
                    warn!("Unable to sendto() on non-blocking UDP socket {}", self.id());
                } else {
                    warn!("Socket sendto() failed on UDP socket {}: {}", self.id(), err);
                }
                return Err(err);
            }
        };

        if inner.local.is_none() {
            inner.store_local_address();
        }
        Ok(sent)
    }
}

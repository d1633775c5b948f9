//! Buffered byte stream over a connected socket.
//!
//! The stream layers the socket's fixed-size in/out buffers with an ordered
//! byte interface: reads drain the buffered window and refill it through the
//! protocol's buffered-read hook, writes fill the outbound buffer and flush
//! it synchronously when full. Streams are sequential, binary and default to
//! little-endian for any typed framing built on top.

use std::cmp;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::time::SystemTime;

use socket::{self, Protocol, SocketHandle, SocketState};
use socket::{SOCKETFLAG_BLOCKING, SOCKETFLAG_POLLED};
use sys;
use tcp;
use udp;

pub(crate) struct StreamParams {
    pub inorder: bool,
    pub reliable: bool,
    pub path: String,
}

/// Buffered byte stream over a connected socket.
///
/// The stream holds a reference to its socket for its whole lifetime. Only
/// connected sockets can be streamed; using an unconnected UDP socket
/// through a stream is a programming error and makes no progress.
#[derive(Debug)]
pub struct SocketStream {
    socket: SocketHandle,
    path: String,
    inorder: bool,
    reliable: bool,
}

impl SocketStream {
    /// Wrap a socket in a buffered stream with the socket's current buffer
    /// capacities (8 KiB each by default).
    pub fn new(socket: SocketHandle) -> SocketStream {
        let params = match socket.protocol() {
            Protocol::Tcp => tcp::stream_params(&socket),
            Protocol::Udp => udp::stream_params(&socket),
        };
        SocketStream {
            socket: socket,
            path: params.path,
            inorder: params.inorder,
            reliable: params.reliable,
        }
    }

    /// Wrap a socket in a buffered stream, sizing the in/out buffers. The
    /// buffers can only be resized while no data is buffered.
    pub fn with_capacities(socket: SocketHandle, buffer_in: usize, buffer_out: usize) -> SocketStream {
        {
            let mut inner = socket.lock();
            socket::resize_buffers(&socket, &mut inner, buffer_in, buffer_out);
        }
        SocketStream::new(socket)
    }

    /// The socket this stream wraps.
    pub fn socket(&self) -> &SocketHandle {
        &self.socket
    }

    /// Path token of the stream, `tcp://<id>` or `udp://<id>`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the transport delivers bytes in order.
    pub fn is_inorder(&self) -> bool {
        self.inorder
    }

    /// Whether the transport delivers bytes reliably.
    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    /// Bytes that can be read without blocking: buffered bytes plus whatever
    /// the kernel reports available.
    pub fn available_read(&self) -> usize {
        self.socket.lock().available_read()
    }

    /// True when the connection is gone and no bytes remain to read.
    pub fn eos(&self) -> bool {
        let mut inner = self.socket.lock();
        let state = socket::poll_state(&mut inner, self.socket.id());
        (state != SocketState::Connected || inner.sys.is_none()) && inner.available_read() == 0
    }

    /// Best-effort prefetch into the in-buffer. Only acts when the stream is
    /// not polled, the socket is connected and nothing is already buffered.
    pub fn buffer_read(&mut self) {
        let mut inner = self.socket.lock();
        if inner.state != SocketState::Connected
            || inner.flags & SOCKETFLAG_POLLED != 0
            || inner.sys.is_none()
        {
            return;
        }
        if inner.buffered_in() > 0 {
            return;
        }
        let available = match inner.fd() {
            Some(fd) => sys::available(fd).unwrap_or(0),
            None => 0,
        };
        if available > 0 {
            socket::read_buffered(&self.socket, &mut inner, available);
        }
    }

    /// Cumulative bytes read from this socket's stream interface.
    pub fn tell(&self) -> u64 {
        self.socket.lock().bytes_read
    }

    /// Streams have no size; always 0.
    pub fn size(&self) -> u64 {
        0
    }

    /// Truncation has no meaning on a socket stream.
    pub fn truncate(&mut self, _size: u64) {}

    /// Streams have no modification time beyond the current wall time.
    pub fn last_modified(&self) -> SystemTime {
        SystemTime::now()
    }

    /// Read up to `size` bytes, discarding them when `buffer` is `None`.
    fn read_bytes(&mut self, mut buffer: Option<&mut [u8]>, size: usize) -> usize {
        let mut inner = self.socket.lock();

        let polled = inner.flags & SOCKETFLAG_POLLED != 0;
        let blocking = inner.flags & SOCKETFLAG_BLOCKING != 0;

        // Re-arm data events, or poll -> read -> poll with the same amount
        // of buffered data would not produce another event
        inner.last_event = 0;

        if inner.state != SocketState::Connected && inner.state != SocketState::Disconnected {
            return 0;
        }
        if size == 0 {
            return 0;
        }

        let mut was_read = 0;
        let mut loop_counter = 0;
        loop {
            let mut try_again = false;

            // Drain buffered spans, in two steps over the ring wrap
            loop {
                let capacity = inner.buffer_in.len();
                let span = if inner.write_in >= inner.read_in {
                    inner.write_in - inner.read_in
                } else {
                    capacity - inner.read_in
                };
                let copy = cmp::min(span, size - was_read);
                if copy == 0 {
                    break;
                }
                if let Some(ref mut out) = buffer {
                    let read_in = inner.read_in;
                    out[was_read..was_read + copy]
                        .copy_from_slice(&inner.buffer_in[read_in..read_in + copy]);
                }
                was_read += copy;
                inner.read_in += copy;
                if inner.read_in == capacity {
                    inner.read_in = 0;
                }
                try_again = true;
            }
            if inner.read_in == inner.write_in {
                inner.read_in = 0;
                inner.write_in = 0;
            }

            if was_read < size {
                if (!blocking && !polled) || blocking {
                    socket::read_buffered(&self.socket, &mut inner, size - was_read);
                }
            }

            if was_read >= size {
                break;
            }
            if try_again {
                continue;
            }
            loop_counter += 1;
            if loop_counter >= 2 {
                break;
            }
        }

        if was_read < size {
            if was_read > 0 {
                warn!(
                    "Socket stream {}: partial read {} of {} bytes",
                    self.socket.id(),
                    was_read,
                    size
                );
            }
            socket::poll_state(&mut inner, self.socket.id());
        }

        inner.bytes_read += was_read as u64;
        was_read
    }

    fn write_bytes(&mut self, buffer: &[u8]) -> usize {
        let mut inner = self.socket.lock();

        if inner.state != SocketState::Connected {
            return 0;
        }
        if buffer.is_empty() {
            return 0;
        }

        let mut was_written = 0;
        let mut size = buffer.len();
        loop {
            let capacity = inner.buffer_out.len();
            let remain = capacity - inner.write_out;

            if size <= remain {
                let write_out = inner.write_out;
                inner.buffer_out[write_out..write_out + size]
                    .copy_from_slice(&buffer[was_written..]);
                inner.write_out += size;
                was_written += size;
                break;
            }

            if remain > 0 {
                let write_out = inner.write_out;
                inner.buffer_out[write_out..capacity]
                    .copy_from_slice(&buffer[was_written..was_written + remain]);
                inner.write_out = capacity;
                was_written += remain;
                size -= remain;
            }

            socket::flush_buffered(&self.socket, &mut inner);

            if inner.state != SocketState::Connected {
                warn!(
                    "Socket stream {}: partial write {} of {} bytes",
                    self.socket.id(),
                    was_written,
                    buffer.len()
                );
                break;
            }
            if inner.write_out == inner.buffer_out.len() {
                // Flush made no progress
                break;
            }
        }

        inner.bytes_written += was_written as u64;
        was_written
    }
}

impl Read for SocketStream {
    /// Read into `buf`, short reads allowed. A read that makes no progress
    /// on a live connection reports `WouldBlock`; end of stream reads 0.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = buf.len();
        let read = self.read_bytes(Some(buf), size);
        if read == 0 && size > 0 && !self.eos() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data available"));
        }
        Ok(read)
    }
}

impl Write for SocketStream {
    /// Buffer `buf`, flushing synchronously whenever the out-buffer fills.
    /// Short writes happen when the connection goes away mid-write.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.write_bytes(buf);
        if written == 0 && !buf.is_empty() {
            let kind = if self.socket.state() == SocketState::Connected {
                io::ErrorKind::WouldBlock
            } else {
                io::ErrorKind::NotConnected
            };
            return Err(io::Error::new(kind, "no bytes written"));
        }
        Ok(written)
    }

    /// Drain the out-buffer. Residual bytes after a partial drain stay
    /// buffered for the next flush.
    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self.socket.lock();
        socket::flush_buffered(&self.socket, &mut inner);
        if inner.write_out > 0 {
            let kind = if inner.state == SocketState::Connected {
                io::ErrorKind::WouldBlock
            } else {
                io::ErrorKind::NotConnected
            };
            return Err(io::Error::new(kind, "flush incomplete"));
        }
        Ok(())
    }
}

impl Seek for SocketStream {
    /// Only forward seeking from the current position is possible, by
    /// reading and discarding. The returned position is the cumulative
    /// number of bytes read.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(offset) if offset >= 0 => {
                self.read_bytes(None, offset as usize);
                Ok(self.tell())
            }
            _ => {
                error!("Invalid call, only forward seeking allowed on sockets");
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "only forward seeking allowed on sockets",
                ))
            }
        }
    }
}

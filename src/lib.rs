#![doc(html_root_url = "https://docs.rs/netlib/0.1.0")]
#![deny(missing_docs, missing_debug_implementations)]

//! A low-level networking library providing a uniform abstraction over TCP
//! and UDP sockets, IPv4/IPv6 endpoint handling, readiness-driven
//! multi-socket polling and buffered byte streams over connected sockets.
//!
//! # Goals
//!
//! * Direct control over kernel sockets without an application framework
//! * A small socket object with an explicit lifecycle state machine
//! * Level-triggered readiness polling (epoll/kqueue via mio) translated
//!   into protocol-aware events: connection, connected, data-in, error,
//!   hangup, timeout
//! * An ordered byte-stream facade with blocking and non-blocking semantics
//!
//! # Usage
//!
//! Call [`initialize`] once, create sockets, then either use them directly
//! (blocking or non-blocking) or register them with a [`NetworkPoll`] and
//! consume events from the [`event`](event/index.html) stream.
//!
//! [`initialize`]: fn.initialize.html
//! [`NetworkPoll`]: struct.NetworkPoll.html
//!
//! # Example
//!
//! ```no_run
//! extern crate netlib;
//!
//! use netlib::{address, event, NetworkPoll, Socket};
//!
//! fn main() {
//!     netlib::initialize(0);
//!
//!     // A listening TCP socket on an ephemeral port
//!     let server = Socket::tcp();
//!     server.bind(&address::resolve("127.0.0.1:0")[0]).unwrap();
//!     server.listen().unwrap();
//!
//!     // Watch it for incoming connections
//!     let poll = NetworkPoll::allocate(64, None).unwrap();
//!     poll.add(&server).unwrap();
//!
//!     loop {
//!         poll.poll().unwrap();
//!
//!         while let Some(ev) = event::poll_event() {
//!             match ev.id {
//!                 event::EventId::Connection => {
//!                     // Accept and drop the connection immediately
//!                     let _ = server.accept(None);
//!                     return;
//!                 }
//!                 _ => {}
//!             }
//!         }
//!     }
//! }
//! ```

extern crate lazycell;
extern crate mio;
extern crate socket2;

#[cfg(unix)]
extern crate libc;

#[macro_use]
extern crate log;

pub mod address;
pub mod event;

mod poll;
mod socket;
mod stream;
mod sys;
mod tcp;
mod udp;

pub use poll::{poll_loop, NetworkPoll, PollThread};
pub use socket::{Protocol, Socket, SocketHandle, SocketState};
pub use socket::{DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_BUFFER_SIZE};
pub use stream::SocketStream;
pub use tcp::DEFAULT_TCP_PACKET_SIZE;
pub use udp::DEFAULT_UDP_PACKET_SIZE;

use std::cmp;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default maximum number of sockets when none is configured.
pub const DEFAULT_MAX_SOCKETS: usize = 128;

static MAX_SOCKETS: AtomicUsize = AtomicUsize::new(0);

/// Initialize network services.
///
/// `max_sockets` becomes the default poller capacity; 0 selects the
/// built-in default of 128 and the value is clamped to [8, 65535].
/// Idempotent; the event stream is created on the first call.
pub fn initialize(max_sockets: usize) {
    let clamped = clamp_max_sockets(max_sockets);
    if MAX_SOCKETS
        .compare_exchange(0, clamped, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        debug!("Initializing network services ({} max sockets)", clamped);
        event::initialize();
    }
}

/// Terminate network services, dropping any queued events.
pub fn shutdown() {
    if MAX_SOCKETS.swap(0, Ordering::SeqCst) != 0 {
        debug!("Terminating network services");
        event::shutdown();
    }
}

/// Whether [`initialize`](fn.initialize.html) has been called.
pub fn is_initialized() -> bool {
    MAX_SOCKETS.load(Ordering::SeqCst) != 0
}

pub(crate) fn clamp_max_sockets(max_sockets: usize) -> usize {
    let max_sockets = if max_sockets == 0 {
        let configured = MAX_SOCKETS.load(Ordering::SeqCst);
        if configured == 0 {
            DEFAULT_MAX_SOCKETS
        } else {
            configured
        }
    } else {
        max_sockets
    };
    cmp::max(8, cmp::min(65535, max_sockets))
}

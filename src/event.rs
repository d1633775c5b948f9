//! Process-wide network event stream.
//!
//! The poller and the buffered socket paths publish `NetworkEvent` records
//! here; consumers drain them with [`poll_event`] or [`wait_event`]. The
//! stream is created by [`initialize`](../fn.initialize.html) and lives for
//! the rest of the process.
//!
//! [`poll_event`]: fn.poll_event.html
//! [`wait_event`]: fn.wait_event.html

use std::collections::VecDeque;
use std::mem;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use lazycell::AtomicLazyCell;

use socket::SocketHandle;

/// Capacity of the event stream in bytes of queued event records.
const EVENT_STREAM_SIZE: usize = 4096;

/// Kind of a network event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventId {
    /// An inbound connection is waiting on a listening socket
    Connection = 1,
    /// An asynchronous connect completed
    Connected = 2,
    /// Data arrived on a socket
    DataIn = 3,
    /// The socket failed and has been closed
    Error = 4,
    /// The remote end hung up and the socket has been closed
    Hangup = 5,
    /// A poll pass produced no events within the configured timeout
    Timeout = 6,
}

/// A single record in the network event stream.
#[derive(Clone, Debug)]
pub struct NetworkEvent {
    /// Kind of event
    pub id: EventId,
    /// Socket the event concerns, `None` for [`Timeout`](enum.EventId.html)
    pub socket: Option<SocketHandle>,
}

#[derive(Debug)]
struct EventStream {
    queue: Mutex<VecDeque<NetworkEvent>>,
    ready: Condvar,
    max_events: usize,
}

impl EventStream {
    fn new(capacity_bytes: usize) -> EventStream {
        let max_events = capacity_bytes / mem::size_of::<NetworkEvent>();
        EventStream {
            queue: Mutex::new(VecDeque::with_capacity(max_events)),
            ready: Condvar::new(),
            max_events: max_events,
        }
    }

    fn post(&self, event: NetworkEvent) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.max_events {
            error!("Network event stream full, dropping {:?} event", event.id);
            return;
        }
        queue.push_back(event);
        self.ready.notify_one();
    }

    fn poll(&self) -> Option<NetworkEvent> {
        self.queue.lock().unwrap().pop_front()
    }

    fn wait(&self, timeout: Option<Duration>) -> Option<NetworkEvent> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(event) = queue.pop_front() {
                return Some(event);
            }
            match timeout {
                Some(duration) => {
                    let (guard, result) = self.ready.wait_timeout(queue, duration).unwrap();
                    queue = guard;
                    if result.timed_out() {
                        return queue.pop_front();
                    }
                }
                None => {
                    queue = self.ready.wait(queue).unwrap();
                }
            }
        }
    }
}

static EVENTS: AtomicLazyCell<EventStream> = AtomicLazyCell::NONE;

pub(crate) fn initialize() {
    if EVENTS.borrow().is_none() {
        let _ = EVENTS.fill(EventStream::new(EVENT_STREAM_SIZE));
    }
}

pub(crate) fn shutdown() {
    if let Some(stream) = EVENTS.borrow() {
        stream.queue.lock().unwrap().clear();
    }
}

pub(crate) fn post(id: EventId, socket: Option<SocketHandle>) {
    match EVENTS.borrow() {
        Some(stream) => stream.post(NetworkEvent {
            id: id,
            socket: socket,
        }),
        None => debug!("Network event {:?} posted before initialization, dropped", id),
    }
}

/// Take the next queued network event, if any. Never blocks.
pub fn poll_event() -> Option<NetworkEvent> {
    EVENTS.borrow().and_then(|stream| stream.poll())
}

/// Take the next queued network event, waiting up to `timeout` for one to
/// arrive (`None` waits indefinitely).
pub fn wait_event(timeout: Option<Duration>) -> Option<NetworkEvent> {
    EVENTS.borrow().and_then(|stream| stream.wait(timeout))
}

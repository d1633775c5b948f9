//! Readiness poller: aggregates many sockets, translates level-triggered OS
//! readiness into protocol-aware network events and supports concurrent
//! add/remove from other threads through small pending queues.
//!
//! One thread drives [`NetworkPoll::poll`]; any thread may call
//! [`add`](struct.NetworkPoll.html#method.add),
//! [`remove`](struct.NetworkPoll.html#method.remove) and
//! [`has`](struct.NetworkPoll.html#method.has). Queued changes are applied
//! in the pending-sync step at the top of every poll pass.
//!
//! [`NetworkPoll::poll`]: struct.NetworkPoll.html#method.poll

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::{Events, Poll, PollOpt, Ready, Token};
use mio::unix::{EventedFd, UnixReady};

use address;
use event::{self, EventId};
use socket::{self, SocketHandle, SocketState};
use socket::{
    SOCKETFLAG_CONNECTION_PENDING, SOCKETFLAG_ERROR_PENDING, SOCKETFLAG_HANGUP_PENDING,
    SOCKETFLAG_POLLED,
};

/// Number of slots in each of the pending add/remove queues.
const POLL_QUEUE_SIZE: usize = 32;
/// Retry attempts when all pending queue slots are contended.
const QUEUE_RETRY_LIMIT: usize = 32;
/// Pause between queue retries when the poller has no finite timeout.
const QUEUE_RETRY_PAUSE_MS: u64 = 10;

const TIMEOUT_INFINITE: u64 = u64::max_value();

/// A slot set with coalesce-on-collide semantics: inserting a socket into
/// one queue removes it from the other at the call site.
struct SlotQueue {
    slots: Mutex<Vec<Option<SocketHandle>>>,
}

impl SlotQueue {
    fn new() -> SlotQueue {
        SlotQueue {
            slots: Mutex::new(vec![None; POLL_QUEUE_SIZE]),
        }
    }

    fn insert(&self, socket: &SocketHandle) -> bool {
        let mut slots = self.slots.lock().unwrap();
        if slots.iter().any(|slot| is_same(slot, socket)) {
            return true;
        }
        for slot in slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(socket.clone());
                return true;
            }
        }
        false
    }

    fn take(&self, socket: &SocketHandle) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if is_same(slot, socket) {
                *slot = None;
            }
        }
    }

    fn contains(&self, socket: &SocketHandle) -> bool {
        self.slots.lock().unwrap().iter().any(|slot| is_same(slot, socket))
    }

    fn drain(&self) -> Vec<SocketHandle> {
        let mut slots = self.slots.lock().unwrap();
        slots.iter_mut().filter_map(|slot| slot.take()).collect()
    }
}

fn is_same(slot: &Option<SocketHandle>, socket: &SocketHandle) -> bool {
    match *slot {
        Some(ref queued) => Arc::ptr_eq(queued, socket),
        None => false,
    }
}

struct PollSlot {
    socket: SocketHandle,
    fd: RawFd,
}

/// Readiness poller over a set of sockets.
///
/// Translated events are posted to the process-wide
/// [event stream](../event/index.html): `Connection` for listeners,
/// `Connected` when an asynchronous connect completes, `DataIn` when new
/// data is available (de-duplicated per level-triggered edge), and
/// `Error`/`Hangup` when a socket dies, after which it is closed and
/// de-registered.
pub struct NetworkPoll {
    poll: Poll,
    max_sockets: usize,
    timeout_ms: AtomicU64,
    queue_add: SlotQueue,
    queue_remove: SlotQueue,
    slots: Mutex<Vec<PollSlot>>,
    events: Mutex<Events>,
}

impl NetworkPoll {
    /// Allocate a poller for up to `max_sockets` sockets (0 uses the
    /// configured default), clamped to [8, 65535]. `timeout` is the default
    /// wait of a poll pass; `None` waits indefinitely.
    pub fn allocate(max_sockets: usize, timeout: Option<Duration>) -> io::Result<NetworkPoll> {
        let max_sockets = ::clamp_max_sockets(max_sockets);
        let poll = Poll::new()?;
        Ok(NetworkPoll {
            poll: poll,
            max_sockets: max_sockets,
            timeout_ms: AtomicU64::new(encode_timeout(timeout)),
            queue_add: SlotQueue::new(),
            queue_remove: SlotQueue::new(),
            slots: Mutex::new(Vec::with_capacity(max_sockets)),
            events: Mutex::new(Events::with_capacity(max_sockets + 1)),
        })
    }

    /// Capacity of the poller.
    pub fn max_sockets(&self) -> usize {
        self.max_sockets
    }

    /// Number of sockets in active slots (pending adds not counted).
    pub fn num_sockets(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Handles of the sockets in active slots.
    pub fn sockets(&self) -> Vec<SocketHandle> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .map(|slot| slot.socket.clone())
            .collect()
    }

    /// Default wait of a poll pass. `None` waits indefinitely.
    pub fn timeout(&self) -> Option<Duration> {
        decode_timeout(self.timeout_ms.load(Ordering::Relaxed))
    }

    /// Change the default wait of a poll pass.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.timeout_ms.store(encode_timeout(timeout), Ordering::Relaxed);
    }

    /// Queue a socket for registration. The socket takes part in polling
    /// after the next poll pass has run its pending-sync step. Fails after
    /// bounded retries when every queue slot stays contended.
    pub fn add(&self, socket: &SocketHandle) -> io::Result<()> {
        for tries in 0..QUEUE_RETRY_LIMIT {
            if self.queue_add.insert(socket) {
                self.queue_remove.take(socket);
                return Ok(());
            }
            if tries == 0 {
                warn!("Unable to add socket to poll, no free queue slots");
            }
            thread::sleep(self.retry_pause());
        }
        error!("Unable to add socket to poll, no free queue slots");
        Err(io::Error::new(io::ErrorKind::Other, "no free poll queue slots"))
    }

    /// Queue a socket for removal, honored by the next poll pass. Later
    /// events for the socket are not produced.
    pub fn remove(&self, socket: &SocketHandle) -> io::Result<()> {
        for tries in 0..QUEUE_RETRY_LIMIT {
            if self.queue_remove.insert(socket) {
                self.queue_add.take(socket);
                return Ok(());
            }
            if tries == 0 {
                warn!("Unable to remove socket from poll, no free queue slots");
            }
            thread::sleep(self.retry_pause());
        }
        error!("Unable to remove socket from poll, no free queue slots");
        Err(io::Error::new(io::ErrorKind::Other, "no free poll queue slots"))
    }

    /// Whether the socket is registered or queued for registration, minus
    /// pending removals.
    pub fn has(&self, socket: &SocketHandle) -> bool {
        {
            let slots = self.slots.lock().unwrap();
            for slot in slots.iter() {
                if Arc::ptr_eq(&slot.socket, socket) {
                    return !self.queue_remove.contains(socket);
                }
            }
        }
        self.queue_add.contains(socket)
    }

    fn retry_pause(&self) -> Duration {
        match self.timeout() {
            Some(duration) if duration > Duration::new(0, 0) => duration,
            _ => Duration::from_millis(QUEUE_RETRY_PAUSE_MS),
        }
    }

    fn interest(state: SocketState) -> Ready {
        let ready = if state == SocketState::Connecting {
            Ready::writable()
        } else {
            Ready::readable()
        };
        ready | Ready::from(UnixReady::error()) | Ready::from(UnixReady::hup())
    }

    fn register_slot(&self, fd: RawFd, token: usize, state: SocketState) -> io::Result<()> {
        self.poll
            .register(&EventedFd(&fd), Token(token), NetworkPoll::interest(state), PollOpt::level())
    }

    fn reregister_slot(&self, fd: RawFd, token: usize, state: SocketState) -> io::Result<()> {
        self.poll
            .reregister(&EventedFd(&fd), Token(token), NetworkPoll::interest(state), PollOpt::level())
    }

    fn deregister_fd(&self, fd: RawFd) {
        if fd >= 0 {
            let _ = self.poll.deregister(&EventedFd(&fd));
        }
    }

    /// Apply queued removals and additions to the native readiness backend.
    /// Returns the number of events posted (hangups for dead descriptors).
    fn process_pending(&self, slots: &mut Vec<PollSlot>) -> usize {
        let mut num_events = 0;

        for socket in self.queue_remove.drain() {
            let mut index = 0;
            while index < slots.len() {
                if !Arc::ptr_eq(&slots[index].socket, &socket) {
                    index += 1;
                    continue;
                }
                let removed = slots.swap_remove(index);
                debug!(
                    "Network poll: removing queued socket {} (fd {})",
                    removed.socket.id(),
                    removed.fd
                );
                self.deregister_fd(removed.fd);
                if index < slots.len() {
                    // Keep the swapped-in slot registered under its new token
                    let state = slots[index].socket.lock().state;
                    let fd = slots[index].fd;
                    let _ = self.reregister_slot(fd, index, state);
                }
            }
            let mut inner = socket.lock();
            inner.flags &= !SOCKETFLAG_POLLED;
        }

        for socket in self.queue_add.drain() {
            if slots.len() >= self.max_sockets {
                // Out of capacity, keep it queued for a later pass
                self.queue_add.insert(&socket);
                continue;
            }
            if slots.iter().any(|slot| Arc::ptr_eq(&slot.socket, &socket)) {
                debug!("Network poll: socket {} already polled", socket.id());
                continue;
            }

            let token = slots.len();
            let (fd, state) = {
                let mut inner = socket.lock();
                inner.flags &= !(SOCKETFLAG_CONNECTION_PENDING
                    | SOCKETFLAG_ERROR_PENDING
                    | SOCKETFLAG_HANGUP_PENDING);
                inner.flags |= SOCKETFLAG_POLLED;
                inner.last_event = 0;
                if inner.state == SocketState::Connecting {
                    socket::poll_state(&mut inner, socket.id());
                }
                (inner.fd(), inner.state)
            };

            match fd {
                Some(fd) => {
                    debug!("Network poll: adding queued socket {} (fd {})", socket.id(), fd);
                    if let Err(err) = self.register_slot(fd, token, state) {
                        warn!(
                            "Network poll: unable to register socket {} with readiness backend: {}",
                            socket.id(),
                            err
                        );
                    }
                    slots.push(PollSlot { socket: socket, fd: fd });
                }
                None => {
                    // Dead on arrival, surface the hangup right away
                    debug!("Network poll: adding dead socket {}", socket.id());
                    slots.push(PollSlot {
                        socket: socket.clone(),
                        fd: -1,
                    });
                    event::post(EventId::Hangup, Some(socket));
                    num_events += 1;
                }
            }
        }

        num_events
    }

    /// Run one poll pass: apply pending changes, wait for readiness and
    /// translate it into network events.
    ///
    /// Returns the number of events produced. With no sockets registered
    /// and no events pending the error kind is `WouldBlock`, the "no work"
    /// indicator.
    pub fn poll(&self) -> io::Result<usize> {
        let mut num_events;
        let timeout;
        {
            let mut slots = self.slots.lock().unwrap();
            num_events = self.process_pending(&mut slots);

            if slots.is_empty() {
                return if num_events > 0 {
                    Ok(num_events)
                } else {
                    Err(io::Error::new(io::ErrorKind::WouldBlock, "no sockets to poll"))
                };
            }

            // Buffered inbound data cannot wait on kernel readiness
            let buffered = slots.iter().any(|slot| slot.socket.buffered_in() > 0);
            timeout = if buffered {
                Some(Duration::new(0, 0))
            } else {
                self.timeout()
            };
        }

        let wait = {
            let mut events = self.events.lock().unwrap();
            self.poll.poll(&mut events, timeout)
        };
        if let Err(err) = wait {
            warn!("Error in socket poll: {}", err);
            return Err(err);
        }

        let mut slots = self.slots.lock().unwrap();
        let mut readiness = vec![Ready::empty(); slots.len()];
        {
            let events = self.events.lock().unwrap();
            for event in events.iter() {
                let Token(index) = event.token();
                if index < readiness.len() {
                    readiness[index] = readiness[index] | event.readiness();
                }
            }
        }

        for index in 0..slots.len() {
            let socket = slots[index].socket.clone();
            let fd = slots[index].fd;
            let ready = readiness[index];
            let unix_ready = UnixReady::from(ready);

            let mut inner = socket.lock();

            if ready.is_readable() || inner.buffered_in() > 0 {
                if inner.state == SocketState::Listening {
                    if inner.flags & SOCKETFLAG_CONNECTION_PENDING == 0 {
                        inner.flags |= SOCKETFLAG_CONNECTION_PENDING;
                        debug!(
                            "Got connection on socket {} at {}",
                            socket.id(),
                            address::format_address(inner.local.as_ref(), true)
                        );
                        event::post(EventId::Connection, Some(socket.clone()));
                    }
                    num_events += 1;
                } else {
                    let available = inner.available_read();
                    let receiving = inner.state == SocketState::Connected
                        || inner.state == SocketState::NotConnected;
                    if receiving && available > 0 {
                        if available != inner.last_event {
                            inner.last_event = available;
                            event::post(EventId::DataIn, Some(socket.clone()));
                        }
                    } else if ready.is_readable() {
                        if inner.flags & SOCKETFLAG_HANGUP_PENDING == 0 {
                            inner.flags |= SOCKETFLAG_HANGUP_PENDING;
                            event::post(EventId::Hangup, Some(socket.clone()));
                        }
                    }
                    num_events += 1;
                }
            }

            if inner.state == SocketState::Connecting && ready.is_writable() {
                debug!(
                    "Socket {} connected to {}",
                    socket.id(),
                    address::format_address(inner.remote.as_ref(), true)
                );
                inner.state = SocketState::Connected;
                let _ = self.reregister_slot(fd, index, SocketState::Connected);
                event::post(EventId::Connected, Some(socket.clone()));
                num_events += 1;
            }

            if unix_ready.is_error() {
                inner.close(socket.id());
                self.deregister_fd(fd);
                if inner.flags & SOCKETFLAG_ERROR_PENDING == 0 {
                    inner.flags |= SOCKETFLAG_ERROR_PENDING;
                    event::post(EventId::Error, Some(socket.clone()));
                }
                num_events += 1;
            }

            if unix_ready.is_hup() {
                inner.close(socket.id());
                self.deregister_fd(fd);
                if inner.flags & SOCKETFLAG_HANGUP_PENDING == 0 {
                    inner.flags |= SOCKETFLAG_HANGUP_PENDING;
                    event::post(EventId::Hangup, Some(socket.clone()));
                }
                num_events += 1;
            }
        }

        Ok(num_events)
    }
}

impl Drop for NetworkPoll {
    fn drop(&mut self) {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(_) => return,
        };
        self.process_pending(&mut slots);
        for slot in slots.drain(..) {
            let mut inner = slot.socket.lock();
            inner.flags &= !SOCKETFLAG_POLLED;
        }
    }
}

impl fmt::Debug for NetworkPoll {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "NetworkPoll {{ max_sockets: {}, num_sockets: {} }}",
            self.max_sockets,
            self.num_sockets()
        )
    }
}

fn encode_timeout(timeout: Option<Duration>) -> u64 {
    match timeout {
        Some(duration) => {
            let ms = duration
                .as_secs()
                .saturating_mul(1000)
                .saturating_add(u64::from(duration.subsec_nanos()) / 1_000_000);
            if ms >= TIMEOUT_INFINITE {
                TIMEOUT_INFINITE - 1
            } else {
                ms
            }
        }
        None => TIMEOUT_INFINITE,
    }
}

fn decode_timeout(ms: u64) -> Option<Duration> {
    if ms == TIMEOUT_INFINITE {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

/// Poll repeatedly until `terminate` is set. Idle passes post a `Timeout`
/// event when the poller has a non-zero timeout configured; failed passes
/// sleep one timeout period before retrying.
pub fn poll_loop(poll: &NetworkPoll, terminate: &AtomicBool) {
    while !terminate.load(Ordering::Acquire) {
        let idle_timeout = match poll.timeout() {
            Some(duration) => duration > Duration::new(0, 0),
            None => false,
        };
        match poll.poll() {
            Ok(count) => {
                if count == 0 && idle_timeout {
                    event::post(EventId::Timeout, None);
                }
                thread::yield_now();
            }
            Err(_) => {
                if idle_timeout {
                    event::post(EventId::Timeout, None);
                }
                thread::sleep(poll.retry_pause());
            }
        }
    }
}

/// Handle to the convenience polling thread. Stopping (or dropping) the
/// handle signals termination and joins the thread.
#[derive(Debug)]
pub struct PollThread {
    terminate: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NetworkPoll {
    /// Spawn a thread running [`poll_loop`](fn.poll_loop.html) over this
    /// poller.
    pub fn spawn(poll: Arc<NetworkPoll>) -> io::Result<PollThread> {
        let terminate = Arc::new(AtomicBool::new(false));
        let thread_terminate = terminate.clone();
        let handle = thread::Builder::new()
            .name(String::from("network-poll"))
            .spawn(move || poll_loop(&poll, &thread_terminate))?;
        Ok(PollThread {
            terminate: terminate,
            handle: Some(handle),
        })
    }
}

impl PollThread {
    /// Signal termination and join the thread.
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.terminate.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PollThread {
    fn drop(&mut self) {
        self.join();
    }
}

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use netlib::event::{self, EventId};
use netlib::{NetworkPoll, Socket, SocketHandle, SocketState};

use {drain_events, localhost, setup, EVENT_LOCK};

fn count_events_for(id: EventId, socket: &SocketHandle) -> usize {
    let mut count = 0;
    while let Some(ev) = event::poll_event() {
        if ev.id != id {
            continue;
        }
        if let Some(ref subject) = ev.socket {
            if Arc::ptr_eq(subject, socket) {
                count += 1;
            }
        }
    }
    count
}

#[test]
fn datagram_produces_one_datain_event() {
    setup();
    let _guard = EVENT_LOCK.lock().unwrap();
    drain_events();

    let a = Socket::udp();
    a.bind(&localhost()).unwrap();
    let b = Socket::udp();
    b.bind(&localhost()).unwrap();

    let poll = NetworkPoll::allocate(64, None).unwrap();
    poll.add(&a).unwrap();
    poll.add(&b).unwrap();

    a.sendto(&[0x42u8; 8], &b.address_local().unwrap()).unwrap();

    assert_eq!(poll.poll().unwrap(), 1);
    assert_eq!(count_events_for(EventId::DataIn, &b), 1);
}

#[test]
fn datain_rearms_after_drain() {
    setup();
    let _guard = EVENT_LOCK.lock().unwrap();
    drain_events();

    let a = Socket::udp();
    a.bind(&localhost()).unwrap();
    let b = Socket::udp();
    b.bind(&localhost()).unwrap();
    let target = b.address_local().unwrap();

    let poll = NetworkPoll::allocate(64, None).unwrap();
    poll.add(&b).unwrap();

    a.sendto(&[1u8; 16], &target).unwrap();
    poll.poll().unwrap();
    assert_eq!(count_events_for(EventId::DataIn, &b), 1);

    // Same buffered amount again must still produce an event once the
    // previous datagram was drained
    b.recvfrom().unwrap();
    a.sendto(&[2u8; 16], &target).unwrap();
    poll.poll().unwrap();
    assert_eq!(count_events_for(EventId::DataIn, &b), 1);
}

#[test]
fn add_then_remove_socket() {
    setup();
    let poll = NetworkPoll::allocate(8, Some(Duration::from_millis(50))).unwrap();
    let sock = Socket::udp();
    sock.bind(&localhost()).unwrap();

    poll.add(&sock).unwrap();
    assert!(poll.has(&sock));
    let _ = poll.poll();
    assert!(poll.has(&sock));
    assert_eq!(poll.num_sockets(), 1);
    assert!(poll.sockets().iter().any(|s| Arc::ptr_eq(s, &sock)));

    poll.remove(&sock).unwrap();
    assert!(!poll.has(&sock));
    let _ = poll.poll();
    assert!(!poll.has(&sock));
    assert_eq!(poll.num_sockets(), 0);
}

#[test]
fn empty_poller_reports_no_work() {
    setup();
    let poll = NetworkPoll::allocate(8, Some(Duration::from_millis(10))).unwrap();
    let err = poll.poll().unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
}

#[test]
fn capacity_is_clamped() {
    setup();
    let poll = NetworkPoll::allocate(2, None).unwrap();
    assert_eq!(poll.max_sockets(), 8);
    let poll = NetworkPoll::allocate(0, None).unwrap();
    assert_eq!(poll.max_sockets(), 300);
}

#[test]
fn timeout_is_adjustable() {
    setup();
    let poll = NetworkPoll::allocate(8, Some(Duration::from_millis(100))).unwrap();
    assert_eq!(poll.timeout(), Some(Duration::from_millis(100)));
    poll.set_timeout(None);
    assert_eq!(poll.timeout(), None);
}

#[test]
fn dead_socket_surfaces_hangup() {
    setup();
    let _guard = EVENT_LOCK.lock().unwrap();
    drain_events();

    // Never opened, no descriptor to watch
    let sock = Socket::tcp();
    let poll = NetworkPoll::allocate(8, Some(Duration::from_millis(10))).unwrap();
    poll.add(&sock).unwrap();
    assert_eq!(poll.poll().unwrap(), 1);
    assert_eq!(count_events_for(EventId::Hangup, &sock), 1);
}

#[test]
fn listener_connection_events() {
    setup();
    let _guard = EVENT_LOCK.lock().unwrap();
    drain_events();

    let server = Socket::tcp();
    server.bind(&localhost()).unwrap();
    server.listen().unwrap();
    let target = server.address_local().unwrap();

    let poll = NetworkPoll::allocate(8, Some(Duration::from_millis(50))).unwrap();
    poll.add(&server).unwrap();

    let first_client = Socket::tcp();
    first_client.connect(&target, Some(Duration::from_secs(5))).unwrap();

    let mut connections = 0;
    for _ in 0..100 {
        let _ = poll.poll();
        connections += count_events_for(EventId::Connection, &server);
        if connections > 0 {
            break;
        }
    }
    assert_eq!(connections, 1);

    // Accepting drains the edge, the next connection raises it again
    let _accepted = server.accept(Some(Duration::from_secs(5))).unwrap();
    let second_client = Socket::tcp();
    second_client.connect(&target, Some(Duration::from_secs(5))).unwrap();

    let mut connections = 0;
    for _ in 0..100 {
        let _ = poll.poll();
        connections += count_events_for(EventId::Connection, &server);
        if connections > 0 {
            break;
        }
    }
    assert_eq!(connections, 1);
}

#[test]
fn pending_connect_resolves_through_poller() {
    setup();
    let _guard = EVENT_LOCK.lock().unwrap();
    drain_events();

    let server = Socket::tcp();
    server.bind(&localhost()).unwrap();
    server.listen().unwrap();
    let target = server.address_local().unwrap();

    let client = Socket::tcp();
    client.set_blocking(false);
    client.connect(&target, None).unwrap();

    let poll = NetworkPoll::allocate(8, Some(Duration::from_millis(50))).unwrap();
    poll.add(&client).unwrap();

    let mut state = SocketState::Connecting;
    for _ in 0..100 {
        let _ = poll.poll();
        state = client.state();
        if state == SocketState::Connected {
            break;
        }
    }
    assert_eq!(state, SocketState::Connected);
    drain_events();
}

#[test]
fn poll_thread_posts_timeout_events() {
    setup();
    let _guard = EVENT_LOCK.lock().unwrap();
    drain_events();

    let sock = Socket::udp();
    sock.bind(&localhost()).unwrap();

    let poll = Arc::new(NetworkPoll::allocate(8, Some(Duration::from_millis(20))).unwrap());
    poll.add(&sock).unwrap();

    let thread = NetworkPoll::spawn(poll.clone()).unwrap();
    thread::sleep(Duration::from_millis(300));
    thread.stop();

    let mut timeouts = 0;
    while let Some(ev) = event::poll_event() {
        if ev.id == EventId::Timeout {
            timeouts += 1;
        }
    }
    assert!(timeouts > 0);
}

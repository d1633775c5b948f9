use std::time::Duration;

use netlib::{Protocol, Socket, SocketState};

use {localhost, setup};

#[test]
fn lifecycle_defaults() {
    setup();
    let sock = Socket::tcp();
    assert_eq!(sock.protocol(), Protocol::Tcp);
    assert_eq!(sock.state(), SocketState::NotConnected);
    assert!(sock.blocking());
    assert!(sock.address_local().is_none());
    assert!(sock.address_remote().is_none());
    assert_eq!(sock.bytes_read(), 0);
    assert_eq!(sock.bytes_written(), 0);
}

#[test]
fn socket_ids_are_unique() {
    setup();
    let first = Socket::tcp();
    let second = Socket::udp();
    assert!(first.id() != second.id());
}

#[test]
fn bind_ephemeral_assigns_port() {
    setup();
    let sock = Socket::tcp();
    sock.bind(&localhost()).unwrap();
    let local = sock.address_local().unwrap();
    assert!(local.port() != 0);
    assert_eq!(local.ip().to_string(), "127.0.0.1");
}

#[test]
fn rebind_fails() {
    setup();
    let sock = Socket::udp();
    sock.bind(&localhost()).unwrap();
    assert!(sock.bind(&localhost()).is_err());
}

#[test]
fn close_is_idempotent() {
    setup();
    let sock = Socket::tcp();
    sock.bind(&localhost()).unwrap();
    sock.close();
    assert_eq!(sock.state(), SocketState::Disconnected);
    assert!(sock.address_local().is_none());
    sock.close();
    assert_eq!(sock.state(), SocketState::Disconnected);
}

#[test]
fn blocking_toggle_roundtrip() {
    setup();
    let sock = Socket::tcp();
    sock.bind(&localhost()).unwrap();
    sock.set_blocking(true);
    sock.set_blocking(false);
    assert!(!sock.blocking());
    sock.set_blocking(true);
    assert!(sock.blocking());
}

#[test]
fn reuse_flags_roundtrip() {
    setup();
    let sock = Socket::udp();
    sock.set_reuse_address(true);
    sock.set_reuse_port(true);
    assert!(sock.reuse_address());
    assert!(sock.reuse_port());
    // Flags set before open are applied to the descriptor at bind time
    sock.bind(&localhost()).unwrap();
    assert!(sock.reuse_address());
}

#[test]
fn connect_refused() {
    setup();
    // Bind and close to find a loopback port with no listener
    let probe = Socket::tcp();
    probe.bind(&localhost()).unwrap();
    let target = probe.address_local().unwrap();
    probe.close();

    let client = Socket::tcp();
    assert!(client.connect(&target, Some(Duration::from_secs(5))).is_err());
    assert_eq!(client.state(), SocketState::NotConnected);
}

#[test]
fn connect_while_connected_fails() {
    setup();
    let (client, _server) = ::tcp_pair();
    let target = client.address_remote().unwrap();
    assert!(client.connect(&target, None).is_err());
}

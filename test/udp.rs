use std::io::{Read, Write};
use std::thread;

use netlib::{Socket, SocketHandle, SocketState, SocketStream};

use {localhost, setup};

const ROUNDS: usize = 512;
const CLIENTS: usize = 4;
const DATAGRAM_SIZE: usize = 973;

#[test]
fn datagram_mirror() {
    setup();
    let server = Socket::udp();
    server.bind(&localhost()).unwrap();
    let target = server.address_local().unwrap();

    let server_thread = thread::spawn(move || {
        for _ in 0..ROUNDS * CLIENTS {
            let (payload, from) = server.recvfrom().unwrap();
            assert_eq!(payload.len(), DATAGRAM_SIZE);
            assert_eq!(server.sendto(&payload, &from).unwrap(), DATAGRAM_SIZE);
        }
    });

    let clients: Vec<_> = (0..CLIENTS)
        .map(|client| {
            thread::spawn(move || {
                let sock = Socket::udp();
                let payload = [client as u8; DATAGRAM_SIZE];
                for _ in 0..ROUNDS {
                    assert_eq!(sock.sendto(&payload, &target).unwrap(), DATAGRAM_SIZE);
                    let (echo, from) = sock.recvfrom().unwrap();
                    assert_eq!(from, target);
                    assert_eq!(&echo[..], &payload[..]);
                }
            })
        })
        .collect();

    for client in clients {
        client.join().unwrap();
    }
    server_thread.join().unwrap();
}

#[test]
fn sendto_caches_local_address() {
    setup();
    let receiver = Socket::udp();
    receiver.bind(&localhost()).unwrap();

    let sender = Socket::udp();
    assert!(sender.address_local().is_none());
    sender
        .sendto(&[1, 2, 3], &receiver.address_local().unwrap())
        .unwrap();
    let local = sender.address_local().unwrap();
    assert!(local.port() != 0);
}

#[test]
fn connect_pairs_sockets() {
    setup();
    let (a, b) = udp_pair();
    assert_eq!(a.state(), SocketState::Connected);
    assert_eq!(b.state(), SocketState::Connected);
    assert_eq!(a.address_remote().unwrap(), b.address_local().unwrap());
}

#[test]
fn connected_stream_exchange() {
    setup();
    let (a, b) = udp_pair();
    let first = stream_exchange_thread(a);
    let second = stream_exchange_thread(b);
    first.join().unwrap();
    second.join().unwrap();
}

#[test]
fn recvfrom_on_connected_socket_fails() {
    setup();
    let (a, _b) = udp_pair();
    assert!(a.recvfrom().is_err());
}

#[test]
fn sendto_on_connected_socket_fails() {
    setup();
    let (a, b) = udp_pair();
    assert!(a.sendto(&[0u8; 4], &b.address_local().unwrap()).is_err());
}

#[test]
fn recvfrom_requires_bound_socket() {
    setup();
    let sock = Socket::udp();
    assert!(sock.recvfrom().is_err());
}

#[test]
fn stream_on_unconnected_socket_makes_no_progress() {
    setup();
    let sock = Socket::udp();
    sock.bind(&localhost()).unwrap();
    let mut stream = SocketStream::new(sock);
    let mut buffer = [0u8; 16];
    // Unconnected datagram sockets cannot be streamed; the read observes
    // end-of-stream instead of data
    assert_eq!(stream.read(&mut buffer).unwrap(), 0);
    assert_eq!(stream.write(&buffer).unwrap_err().kind(), ::std::io::ErrorKind::NotConnected);
}

#[test]
fn stream_parameters() {
    setup();
    let (a, _b) = udp_pair();
    let stream = SocketStream::new(a);
    assert!(!stream.is_inorder());
    assert!(!stream.is_reliable());
    assert!(stream.path().starts_with("udp://"));
}

/// Two UDP sockets bound to ephemeral loopback ports and connected to each
/// other.
fn udp_pair() -> (SocketHandle, SocketHandle) {
    let a = Socket::udp();
    a.bind(&localhost()).unwrap();
    let b = Socket::udp();
    b.bind(&localhost()).unwrap();
    let addr_a = a.address_local().unwrap();
    let addr_b = b.address_local().unwrap();
    a.connect(&addr_b, None).unwrap();
    b.connect(&addr_a, None).unwrap();
    (a, b)
}

fn stream_exchange_thread(sock: SocketHandle) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut stream = SocketStream::new(sock);
        let mut out = [0u8; 317];
        for (index, byte) in out.iter_mut().enumerate() {
            *byte = (index % 251) as u8;
        }
        let mut input = [0u8; 317];
        for _ in 0..ROUNDS {
            assert_eq!(stream.write(&out[..127]).unwrap(), 127);
            assert_eq!(stream.write(&out[127..307]).unwrap(), 180);
            stream.flush().unwrap();
            assert_eq!(stream.write(&out[307..]).unwrap(), 10);
            stream.flush().unwrap();

            assert_eq!(stream.read(&mut input[..235]).unwrap(), 235);
            assert_eq!(stream.read(&mut input[235..]).unwrap(), 82);
            assert_eq!(&input[..], &out[..]);
            thread::yield_now();
        }
    })
}

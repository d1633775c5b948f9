extern crate env_logger;
extern crate netlib;

use std::net::SocketAddr;
use std::sync::{Mutex, Once};
use std::time::Duration;

use netlib::{Socket, SocketHandle};

mod address;
mod poll;
mod socket;
mod stream;
mod udp;

/// Serializes tests that assert on the process-wide event stream.
static EVENT_LOCK: Mutex<()> = Mutex::new(());

fn setup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::init();
        netlib::initialize(300);
    });
}

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn drain_events() {
    while netlib::event::poll_event().is_some() {}
}

/// A connected TCP socket pair over loopback: (client, accepted).
fn tcp_pair() -> (SocketHandle, SocketHandle) {
    let server = Socket::tcp();
    server.bind(&localhost()).unwrap();
    server.listen().unwrap();
    let target = server.address_local().unwrap();

    let client = Socket::tcp();
    client
        .connect(&target, Some(Duration::from_secs(5)))
        .unwrap();
    let accepted = server.accept(Some(Duration::from_secs(5))).unwrap();
    (client, accepted)
}

use std::io::{Read, Seek, SeekFrom, Write};
use std::thread;
use std::time::Duration;

use netlib::{SocketState, SocketStream};

use setup;

#[test]
fn ordered_byte_roundtrip() {
    setup();
    let (client, server) = ::tcp_pair();
    let mut out = SocketStream::new(client.clone());
    let mut input = SocketStream::new(server.clone());

    out.write(b"hello").unwrap();
    out.write(b" stream").unwrap();
    out.flush().unwrap();

    let mut buffer = [0u8; 12];
    let mut total = 0;
    while total < buffer.len() {
        total += input.read(&mut buffer[total..]).unwrap();
    }
    assert_eq!(&buffer[..], b"hello stream");

    assert_eq!(input.tell(), 12);
    assert_eq!(server.bytes_read(), 12);
    assert_eq!(client.bytes_written(), 12);
}

#[test]
fn available_read_reports_pending_bytes() {
    setup();
    let (client, server) = ::tcp_pair();
    let mut out = SocketStream::new(client);
    let input = SocketStream::new(server);

    assert_eq!(input.available_read(), 0);
    out.write(&[7u8; 64]).unwrap();
    out.flush().unwrap();

    let mut available = input.available_read();
    for _ in 0..100 {
        if available >= 64 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
        available = input.available_read();
    }
    assert_eq!(available, 64);
}

#[test]
fn buffer_read_prefetches() {
    setup();
    let (client, server) = ::tcp_pair();
    let mut out = SocketStream::new(client);
    let mut input = SocketStream::new(server);

    out.write(&[3u8; 32]).unwrap();
    out.flush().unwrap();

    for _ in 0..100 {
        input.buffer_read();
        if input.available_read() >= 32 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    let mut buffer = [0u8; 32];
    assert_eq!(input.read(&mut buffer).unwrap(), 32);
    assert_eq!(&buffer[..], &[3u8; 32][..]);
}

#[test]
fn seek_forward_discards() {
    setup();
    let (client, server) = ::tcp_pair();
    let mut out = SocketStream::new(client);
    let mut input = SocketStream::new(server);

    out.write(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap();
    out.flush().unwrap();

    assert_eq!(input.seek(SeekFrom::Current(4)).unwrap(), 4);
    let mut buffer = [0u8; 6];
    let mut total = 0;
    while total < buffer.len() {
        total += input.read(&mut buffer[total..]).unwrap();
    }
    assert_eq!(&buffer[..], &[5, 6, 7, 8, 9, 10]);
    assert_eq!(input.tell(), 10);
}

#[test]
fn backward_seek_is_rejected() {
    setup();
    let (client, _server) = ::tcp_pair();
    let mut stream = SocketStream::new(client);
    assert!(stream.seek(SeekFrom::Current(-1)).is_err());
    assert!(stream.seek(SeekFrom::Start(0)).is_err());
    assert!(stream.seek(SeekFrom::End(0)).is_err());
}

#[test]
fn trivial_stream_surface() {
    setup();
    let (client, _server) = ::tcp_pair();
    let mut stream = SocketStream::new(client);
    assert_eq!(stream.size(), 0);
    stream.truncate(0);
    let _ = stream.last_modified();
}

#[test]
fn eos_after_peer_close_and_drain() {
    setup();
    let (client, server) = ::tcp_pair();
    let mut out = SocketStream::new(client.clone());
    let mut input = SocketStream::new(server.clone());

    out.write(b"bye").unwrap();
    out.flush().unwrap();
    client.close();

    // Buffered bytes stay readable after the remote close
    let mut buffer = [0u8; 3];
    let mut total = 0;
    while total < buffer.len() {
        total += input.read(&mut buffer[total..]).unwrap();
    }
    assert_eq!(&buffer[..], b"bye");

    // The next read observes end of stream
    assert_eq!(input.read(&mut buffer).unwrap(), 0);
    assert!(input.eos());
    assert_eq!(server.state(), SocketState::Disconnected);
}

#[test]
fn small_buffers_flush_mid_write() {
    setup();
    let (client, server) = ::tcp_pair();
    let mut out = SocketStream::with_capacities(client, 512, 512);
    let mut input = SocketStream::new(server);

    let payload: Vec<u8> = (0..2000u32).map(|value| (value % 256) as u8).collect();
    let writer = thread::spawn(move || {
        assert_eq!(out.write(&payload).unwrap(), 2000);
        out.flush().unwrap();
        payload
    });

    let mut received = vec![0u8; 2000];
    let mut total = 0;
    while total < received.len() {
        let read = input.read(&mut received[total..]).unwrap();
        assert!(read > 0);
        total += read;
    }
    let payload = writer.join().unwrap();
    assert_eq!(received, payload);
}

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use muxio::TcpConnectionPtr;

mod util;

use util::ServerHarness;

#[test]
fn single_worker_echo() {
    let server = ServerHarness::start(0, |server| {
        server.set_message_callback(|conn, input, _at| {
            let bytes = input.consume_all_as_bytes();
            conn.send(&bytes);
            conn.shutdown();
        });
    });

    let mut client = TcpStream::connect(server.addr).unwrap();
    client.write_all(b"hello\n").unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).unwrap();
    assert_eq!(response, b"hello\n");
}

#[test]
fn round_robin_dispatch_over_three_workers() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let server = ServerHarness::start(3, move |server| {
        server.set_message_callback(move |conn, input, _at| {
            record.lock().unwrap().push(thread::current().id());
            let bytes = input.consume_all_as_bytes();
            conn.send(&bytes);
        });
    });

    // Sequential connects: each waits for its echo, so accept order is
    // deterministic.
    for _ in 0..6 {
        let mut client = TcpStream::connect(server.addr).unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 6);
    // Workers repeat with period three.
    assert_eq!(seen[0], seen[3]);
    assert_eq!(seen[1], seen[4]);
    assert_eq!(seen[2], seen[5]);
    // And the three workers are distinct threads.
    assert_ne!(seen[0], seen[1]);
    assert_ne!(seen[1], seen[2]);
    assert_ne!(seen[0], seen[2]);
}

#[test]
fn high_water_mark_fires_once_per_upward_crossing() {
    const PAYLOAD_LEN: usize = 8 * 1024 * 1024;
    const MARK: usize = 1024;

    let payload = Arc::new(vec![0x42u8; PAYLOAD_LEN]);
    let marks = Arc::new(Mutex::new(Vec::new()));
    let connection_slot: Arc<Mutex<Option<TcpConnectionPtr>>> = Arc::new(Mutex::new(None));

    let send_payload = Arc::clone(&payload);
    let record_marks = Arc::clone(&marks);
    let record_connection = Arc::clone(&connection_slot);
    let server = ServerHarness::start(1, move |server| {
        server.set_high_water_mark_callback(
            move |_conn, queued| {
                record_marks.lock().unwrap().push(queued);
            },
            MARK,
        );
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                *record_connection.lock().unwrap() = Some(Arc::clone(conn));
                conn.send(&send_payload);
            }
        });
        server.set_write_complete_callback(|conn| {
            conn.shutdown();
        });
    });

    let mut client = TcpStream::connect(server.addr).unwrap();
    // Do not read yet: the server must hit EWOULDBLOCK and buffer the rest.
    thread::sleep(Duration::from_millis(300));

    {
        let marks = marks.lock().unwrap();
        assert_eq!(marks.len(), 1, "high-water mark fired {} times", marks.len());
        assert!(marks[0] >= MARK && marks[0] <= PAYLOAD_LEN);
    }
    let connection = connection_slot.lock().unwrap().clone().unwrap();
    assert!(connection.output_queue_len() > 0);

    let mut received = Vec::new();
    client.read_to_end(&mut received).unwrap();
    assert_eq!(received.len(), PAYLOAD_LEN);
    // Still exactly one crossing after the drain.
    assert_eq!(marks.lock().unwrap().len(), 1);
}

#[test]
fn graceful_shutdown_flushes_the_output_queue() {
    let mut rng = rand::rng();
    let payload_len = 4 * 1024 * 1024 + rng.random_range(0..1024usize);
    let payload: Arc<Vec<u8>> = Arc::new((0..payload_len).map(|i| (i % 251) as u8).collect());

    let send_payload = Arc::clone(&payload);
    let server = ServerHarness::start(1, move |server| {
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                // The direct write is partial; shutdown must wait for the
                // buffered remainder to drain.
                conn.send(&send_payload);
                conn.shutdown();
            }
        });
    });

    let mut client = TcpStream::connect(server.addr).unwrap();
    let mut received = Vec::new();
    client.read_to_end(&mut received).unwrap();
    assert_eq!(received.len(), payload.len());
    assert_eq!(&received[..], &payload[..]);
}

#[test]
fn cross_thread_send_matches_on_thread_send() {
    let connection_slot: Arc<Mutex<Option<TcpConnectionPtr>>> = Arc::new(Mutex::new(None));

    let record_connection = Arc::clone(&connection_slot);
    let server = ServerHarness::start(1, move |server| {
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                *record_connection.lock().unwrap() = Some(Arc::clone(conn));
            }
        });
    });

    let mut client = TcpStream::connect(server.addr).unwrap();

    let connection = {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(connection) = connection_slot.lock().unwrap().clone() {
                break connection;
            }
            assert!(Instant::now() < deadline, "connection never established");
            thread::sleep(Duration::from_millis(10));
        }
    };

    // This thread is not the owning loop; both calls marshal over.
    connection.send(b"sent from afar");
    connection.shutdown();

    let mut received = Vec::new();
    client.read_to_end(&mut received).unwrap();
    assert_eq!(received, b"sent from afar");
}

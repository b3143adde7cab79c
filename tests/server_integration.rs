// End-to-end TCP tests against an in-process server on an ephemeral port.
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use linespool::api::{Error, ServeConfig, Server, ShutdownHandle};

struct RunningServer {
    addr: SocketAddr,
    handle: ShutdownHandle,
    thread: JoinHandle<Result<(), Error>>,
}

impl RunningServer {
    fn start(config: ServeConfig) -> Self {
        let server = Server::bind(config).expect("bind server");
        let addr = server.local_addr().expect("local addr");
        let handle = server.shutdown_handle();
        let thread = thread::spawn(move || server.run());
        Self {
            addr,
            handle,
            thread,
        }
    }

    fn start_default() -> Self {
        Self::start(ServeConfig {
            port: 0,
            ..ServeConfig::default()
        })
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        stream
    }

    fn stop(self) {
        self.handle.shutdown();
        self.thread
            .join()
            .expect("server thread join")
            .expect("server run result");
    }
}

fn send(stream: &mut TcpStream, bytes: &[u8]) {
    stream.write_all(bytes).expect("send");
}

fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).expect("read reply");
    buf
}

/// Reads until the accumulated reply ends with `suffix` or the deadline hits.
fn read_until_suffix(stream: &mut TcpStream, suffix: &[u8]) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut out = Vec::new();
    let mut chunk = [0u8; 1024];
    while !out.ends_with(suffix) {
        assert!(Instant::now() < deadline, "timed out waiting for reply");
        match stream.read(&mut chunk) {
            Ok(0) => panic!("connection closed before reply completed"),
            Ok(read) => out.extend_from_slice(&chunk[..read]),
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(err) => panic!("read failed: {err}"),
        }
    }
    out
}

#[test]
fn append_replays_full_log() {
    let server = RunningServer::start_default();
    let mut client = server.connect();

    send(&mut client, b"hello\n");
    assert_eq!(read_exact(&mut client, 6), b"hello\n");

    send(&mut client, b"world\n");
    assert_eq!(read_exact(&mut client, 12), b"hello\nworld\n");

    server.stop();
}

#[test]
fn multiple_records_in_one_write_replay_in_order() {
    let server = RunningServer::start_default();
    let mut client = server.connect();

    // One reply per record: "a\n" after the first, "a\nb\n" after the second.
    send(&mut client, b"a\nb\n");
    assert_eq!(read_exact(&mut client, 6), b"a\na\nb\n");

    server.stop();
}

#[test]
fn record_split_across_writes_is_one_append() {
    let server = RunningServer::start_default();
    let mut client = server.connect();

    send(&mut client, b"hel");
    send(&mut client, b"lo\n");
    assert_eq!(read_exact(&mut client, 6), b"hello\n");

    server.stop();
}

#[test]
fn appends_are_visible_across_connections() {
    let server = RunningServer::start_default();

    let mut first = server.connect();
    send(&mut first, b"shared\n");
    assert_eq!(read_exact(&mut first, 7), b"shared\n");

    let mut second = server.connect();
    send(&mut second, b"more\n");
    assert_eq!(read_exact(&mut second, 12), b"shared\nmore\n");

    server.stop();
}

#[test]
fn eviction_drops_oldest_from_replay() {
    let server = RunningServer::start(ServeConfig {
        port: 0,
        capacity: 3,
        timestamp_interval: None,
    });
    let mut client = server.connect();

    send(&mut client, b"one\n");
    read_exact(&mut client, 4);
    send(&mut client, b"two\n");
    read_exact(&mut client, 8);
    send(&mut client, b"three\n");
    read_exact(&mut client, 14);

    // Fourth append evicts "one\n".
    send(&mut client, b"four\n");
    assert_eq!(read_exact(&mut client, 15), b"two\nthree\nfour\n");

    server.stop();
}

#[test]
fn seek_replays_from_offset_then_resets() {
    let server = RunningServer::start_default();

    let mut writer = server.connect();
    send(&mut writer, b"aa\n");
    read_exact(&mut writer, 3);
    send(&mut writer, b"bbbb\n");
    read_exact(&mut writer, 8);
    send(&mut writer, b"c\n");
    read_exact(&mut writer, 10);

    let mut seeker = server.connect();
    // Command 1 is "bbbb\n"; intra-offset 2 lands at global offset 5.
    send(&mut seeker, b"SEEKTO:1,2\n");
    send(&mut seeker, b"zz\n");
    assert_eq!(read_exact(&mut seeker, 8), b"bb\nc\nzz\n");

    // The cursor is back at 0, so the next replay is the full log.
    send(&mut seeker, b"w\n");
    assert_eq!(read_exact(&mut seeker, 15), b"aa\nbbbb\nc\nzz\nw\n");

    server.stop();
}

#[test]
fn out_of_range_seek_is_ignored() {
    let server = RunningServer::start_default();
    let mut client = server.connect();

    send(&mut client, b"hello\n");
    read_exact(&mut client, 6);

    send(&mut client, b"SEEKTO:9,9\n");
    send(&mut client, b"x\n");
    assert_eq!(read_exact(&mut client, 8), b"hello\nx\n");

    server.stop();
}

#[test]
fn malformed_seek_is_rejected_without_append_or_replay() {
    let server = RunningServer::start_default();
    let mut client = server.connect();

    send(&mut client, b"SEEKTO:nope\n");
    send(&mut client, b"x\n");
    // Only the data record was appended; the malformed request produced
    // neither an entry nor a reply.
    assert_eq!(read_exact(&mut client, 2), b"x\n");

    server.stop();
}

#[test]
fn concurrent_appends_never_interleave() {
    let server = RunningServer::start_default();

    let writers: Vec<JoinHandle<()>> = [b"x\n".as_slice(), b"y\n"]
        .into_iter()
        .map(|record| {
            let addr = server.addr;
            thread::spawn(move || {
                let mut client = TcpStream::connect(addr).expect("connect");
                client
                    .set_read_timeout(Some(Duration::from_millis(200)))
                    .expect("read timeout");
                send(&mut client, record);
                // The reply snapshot is taken atomically with the append, so
                // it always ends with this connection's own record.
                read_until_suffix(&mut client, record);
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer thread");
    }

    let mut verifier = server.connect();
    send(&mut verifier, b"z\n");
    let reply = read_exact(&mut verifier, 6);
    let mut lines: Vec<&[u8]> = reply.split_inclusive(|byte| *byte == b'\n').collect();
    assert_eq!(lines.pop(), Some(b"z\n".as_slice()));
    lines.sort();
    assert_eq!(lines, vec![b"x\n".as_slice(), b"y\n"]);

    server.stop();
}

#[test]
fn timestamp_worker_appends_records() {
    let server = RunningServer::start(ServeConfig {
        port: 0,
        capacity: 10,
        timestamp_interval: Some(Duration::from_millis(200)),
    });
    thread::sleep(Duration::from_millis(700));

    let mut client = server.connect();
    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .expect("read timeout");
    send(&mut client, b"x\n");
    let reply = read_until_suffix(&mut client, b"x\n");
    let timestamps = reply
        .split_inclusive(|byte| *byte == b'\n')
        .filter(|line| line.starts_with(b"timestamp:"))
        .count();
    assert!(timestamps >= 1, "expected at least one timestamp record");

    server.stop();
}

#[test]
fn shutdown_with_open_connection_is_graceful() {
    let server = RunningServer::start_default();
    let mut client = server.connect();

    send(&mut client, b"a\n");
    assert_eq!(read_exact(&mut client, 2), b"a\n");

    // The worker is idle in its read poll; stop() must still join it.
    server.stop();
}

//! End-to-end protocol tests against an in-process mock RSP device: both
//! ends of a real loopback TCP socket, exercising the wire framing, the
//! ACK/NAK retry path, and the high-level file/directory operations.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use spx::codec;
use spx::{Connection, EntryKind};

fn spawn_mock(f: impl FnOnce(TcpStream) + Send + 'static) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock listener");
    let addr = listener.local_addr().expect("listener addr");
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept client connection");
        f(stream);
    });
    (addr.to_string(), handle)
}

/// Reads one client-sent command frame, ACKs it, and returns its payload.
fn recv_command(stream: &mut TcpStream) -> Vec<u8> {
    recv_command_after_naks(stream, 0)
}

/// Like [`recv_command`], but NAKs the first `naks` deliveries of the same
/// command before ACKing the final one, exercising the sender's retry path.
fn recv_command_after_naks(stream: &mut TcpStream, naks: usize) -> Vec<u8> {
    let mut payload = Vec::new();
    for attempt in 0..=naks {
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).expect("read byte");
            if byte[0] == b'$' {
                break;
            }
        }
        let mut raw = Vec::new();
        loop {
            stream.read_exact(&mut byte).expect("read byte");
            raw.push(byte[0]);
            if byte[0] == b'#' {
                let mut cksum = [0u8; 2];
                stream.read_exact(&mut cksum).expect("read checksum");
                raw.extend_from_slice(&cksum);
                break;
            }
        }
        payload = codec::parse_frame(&raw).expect("well-formed frame from client").to_vec();
        if attempt < naks {
            stream.write_all(b"-").expect("write nak");
        } else {
            stream.write_all(b"+").expect("write ack");
        }
    }
    payload
}

/// Sends a framed response and consumes the client's ACK of it.
fn send_response(stream: &mut TcpStream, payload: &[u8]) {
    let framed = codec::frame(payload);
    stream.write_all(&framed).expect("write response frame");
    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack).expect("read client ack of response");
    assert_eq!(ack[0], b'+', "client must ack a clean response frame");
}

/// Sends a corrupted copy of `payload`'s frame, expects the client to NAK
/// it, then sends the clean frame and expects an ACK.
fn send_corrupted_then_clean(stream: &mut TcpStream, payload: &[u8]) {
    let mut framed = codec::frame(payload);
    framed[1] ^= 0xff;
    stream.write_all(&framed).expect("write corrupted frame");
    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack).expect("read client nak");
    assert_eq!(ack[0], b'-', "client must nak a corrupted frame");

    send_response(stream, payload);
}

#[test]
fn connect_negotiates_packet_size_with_no_extra_packets() {
    let (addr, handle) = spawn_mock(|mut stream| {
        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"qSupported");
        send_response(&mut stream, b"PacketSize=400;vSpectranext+");

        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .expect("set read timeout");
        let mut buf = [0u8; 1];
        match stream.read(&mut buf) {
            Ok(0) => {}
            Ok(_) => panic!("client sent an extra packet during construction"),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => panic!("unexpected socket error: {e}"),
        }
    });

    let conn = Connection::open(Some(&addr), false, false).expect("connect over tcp");
    assert_eq!(conn.max_packet_size(), 1024, "0x400 PacketSize decodes to 1024");

    handle.join().expect("mock thread panicked");
}

#[test]
fn ls_root_returns_entries_in_arrival_order() {
    let (addr, handle) = spawn_mock(|mut stream| {
        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"qSupported");
        send_response(&mut stream, b"vSpectranext+");

        let payload = recv_command(&mut stream);
        assert_eq!(
            payload,
            format!("vSpectranext:opendir:{}", codec::hex_encode(b"/")).into_bytes()
        );
        send_response(&mut stream, b"OK");

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vSpectranext:readdir");
        let entry = format!("FOK,{},F,2a", codec::hex_encode(b"a.bas"));
        send_response(&mut stream, entry.as_bytes());

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vSpectranext:readdir");
        let entry = format!("FOK,{},D,0", codec::hex_encode(b"dir"));
        send_response(&mut stream, entry.as_bytes());

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vSpectranext:readdir");
        send_response(&mut stream, b"");

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vSpectranext:closedir");
        send_response(&mut stream, b"OK");
    });

    let mut conn = Connection::open(Some(&addr), false, false).expect("connect over tcp");
    let entries = conn.ls("/").expect("ls");

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "a.bas");
    assert_eq!(entries[0].kind, EntryKind::File);
    assert_eq!(entries[0].size, 42);
    assert_eq!(entries[1].name, "dir");
    assert_eq!(entries[1].kind, EntryKind::Directory);
    assert_eq!(entries[1].size, 0);

    handle.join().expect("mock thread panicked");
}

#[test]
fn ls_on_empty_directory_returns_immediately() {
    let (addr, handle) = spawn_mock(|mut stream| {
        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"qSupported");
        send_response(&mut stream, b"vSpectranext+");

        let payload = recv_command(&mut stream);
        assert_eq!(
            payload,
            format!("vSpectranext:opendir:{}", codec::hex_encode(b"/empty")).into_bytes()
        );
        send_response(&mut stream, b"OK");

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vSpectranext:readdir");
        send_response(&mut stream, b"");

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vSpectranext:closedir");
        send_response(&mut stream, b"OK");
    });

    let mut conn = Connection::open(Some(&addr), false, false).expect("connect over tcp");
    let entries = conn.ls("/empty").expect("ls empty dir");
    assert!(entries.is_empty());

    handle.join().expect("mock thread panicked");
}

#[test]
fn put_sends_exactly_open_pwrite_close() {
    let (addr, handle) = spawn_mock(|mut stream| {
        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"qSupported");
        send_response(&mut stream, b"vSpectranext+");

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vFile:open:0,201,0,2f682e62");
        send_response(&mut stream, b"F5");

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vFile:pwrite:5,48454c4c4f");
        send_response(&mut stream, b"F5");

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vFile:close:5");
        send_response(&mut stream, b"F0");
    });

    let mut conn = Connection::open(Some(&addr), false, false).expect("connect over tcp");
    let local = tempfile::NamedTempFile::new().expect("temp file");
    std::fs::write(local.path(), b"HELLO").expect("write fixture");

    conn.put(local.path(), "/h.b").expect("put");

    handle.join().expect("mock thread panicked");
}

#[test]
fn get_round_trips_a_put_file() {
    let (addr, handle) = spawn_mock(|mut stream| {
        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"qSupported");
        send_response(&mut stream, b"vSpectranext+");

        let payload = recv_command(&mut stream);
        assert_eq!(
            payload,
            format!("vFile:size:{}", codec::hex_encode(b"/h.b")).into_bytes()
        );
        send_response(&mut stream, b"F5");

        let payload = recv_command(&mut stream);
        assert_eq!(
            payload,
            format!("vFile:open:0,0,0,{}", codec::hex_encode(b"/h.b")).into_bytes()
        );
        send_response(&mut stream, b"F7");

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vFile:pread:7,5");
        send_response(&mut stream, codec::hex_encode(b"HELLO").as_bytes());

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vFile:close:7");
        send_response(&mut stream, b"F0");
    });

    let mut conn = Connection::open(Some(&addr), false, false).expect("connect over tcp");
    let dir = tempfile::tempdir().expect("temp dir");
    let local = dir.path().join("h.b");

    conn.get("/h.b", &local).expect("get");
    assert_eq!(std::fs::read(&local).expect("read downloaded file"), b"HELLO");

    handle.join().expect("mock thread panicked");
}

#[test]
fn nak_retry_succeeds_on_the_third_attempt() {
    let (addr, handle) = spawn_mock(|mut stream| {
        let payload = recv_command_after_naks(&mut stream, 2);
        assert_eq!(payload, b"qSupported");
        send_response(&mut stream, b"vSpectranext+");
    });

    let conn = Connection::open(Some(&addr), false, false).expect("connect despite two naks");
    assert_eq!(conn.max_packet_size(), 1024);

    handle.join().expect("mock thread panicked");
}

#[test]
fn exhausting_nak_retries_surfaces_an_io_error() {
    let (addr, handle) = spawn_mock(|mut stream| {
        // Four attempts, every one NAKed: the fourth exceeds the client's
        // retry budget and it must give up without sending a fifth.
        for _ in 0..4 {
            let mut byte = [0u8; 1];
            loop {
                stream.read_exact(&mut byte).expect("read byte");
                if byte[0] == b'$' {
                    break;
                }
            }
            let mut raw = Vec::new();
            loop {
                stream.read_exact(&mut byte).expect("read byte");
                raw.push(byte[0]);
                if byte[0] == b'#' {
                    let mut cksum = [0u8; 2];
                    stream.read_exact(&mut cksum).expect("read checksum");
                    raw.extend_from_slice(&cksum);
                    break;
                }
            }
            let _ = codec::parse_frame(&raw).expect("well-formed frame");
            stream.write_all(b"-").expect("write nak");
        }
    });

    let err = Connection::open(Some(&addr), false, false).expect_err("all attempts naked");
    assert!(matches!(err, spx::Error::Io(_)));

    handle.join().expect("mock thread panicked");
}

#[test]
fn checksum_corruption_triggers_nak_and_retransmit() {
    let (addr, handle) = spawn_mock(|mut stream| {
        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"qSupported");
        send_response(&mut stream, b"vSpectranext+");

        let payload = recv_command(&mut stream);
        assert_eq!(
            payload,
            format!("vSpectranext:opendir:{}", codec::hex_encode(b"/")).into_bytes()
        );
        send_response(&mut stream, b"OK");

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vSpectranext:readdir");
        let entry = format!("FOK,{},F,2a", codec::hex_encode(b"a.bas"));
        send_corrupted_then_clean(&mut stream, entry.as_bytes());

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vSpectranext:readdir");
        send_response(&mut stream, b"");

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vSpectranext:closedir");
        send_response(&mut stream, b"OK");
    });

    let mut conn = Connection::open(Some(&addr), false, false).expect("connect over tcp");
    let entries = conn.ls("/").expect("ls despite one corrupted frame");

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "a.bas");
    assert_eq!(entries[0].size, 42);

    handle.join().expect("mock thread panicked");
}

#[test]
fn get_of_a_zero_byte_file_never_issues_a_pread() {
    let (addr, handle) = spawn_mock(|mut stream| {
        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"qSupported");
        send_response(&mut stream, b"vSpectranext+");

        let payload = recv_command(&mut stream);
        assert_eq!(
            payload,
            format!("vFile:size:{}", codec::hex_encode(b"/empty.bin")).into_bytes()
        );
        send_response(&mut stream, b"F0");

        let payload = recv_command(&mut stream);
        assert_eq!(
            payload,
            format!("vFile:open:0,0,0,{}", codec::hex_encode(b"/empty.bin")).into_bytes()
        );
        send_response(&mut stream, b"F3");

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vFile:close:3");
        send_response(&mut stream, b"F0");
    });

    let mut conn = Connection::open(Some(&addr), false, false).expect("connect over tcp");
    let dir = tempfile::tempdir().expect("temp dir");
    let local = dir.path().join("empty.bin");

    // A zero-byte remote file never issues a pread at all: `get` stops the
    // moment `received == total` (0 == 0), so this exercises a different
    // path than an actual EOF response from the device (see
    // `pread_at_eof_yields_empty_payload_without_error` below).
    conn.get("/empty.bin", &local).expect("get of zero-byte file");
    assert_eq!(std::fs::read(&local).expect("read"), Vec::<u8>::new());

    handle.join().expect("mock thread panicked");
}

#[test]
fn pread_at_eof_yields_empty_payload_without_error() {
    let (addr, handle) = spawn_mock(|mut stream| {
        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"qSupported");
        send_response(&mut stream, b"vSpectranext+");

        // The device reports a 5-byte file, but only ever has 3 bytes to
        // give: the first `pread` returns a short, non-EOF read and the
        // second hits genuine EOF with an empty payload. `get` must accept
        // the early EOF without treating it as an error, even though
        // `received` (3) never reaches the advertised `total` (5).
        let payload = recv_command(&mut stream);
        assert_eq!(
            payload,
            format!("vFile:size:{}", codec::hex_encode(b"/short.bin")).into_bytes()
        );
        send_response(&mut stream, b"F5");

        let payload = recv_command(&mut stream);
        assert_eq!(
            payload,
            format!("vFile:open:0,0,0,{}", codec::hex_encode(b"/short.bin")).into_bytes()
        );
        send_response(&mut stream, b"F9");

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vFile:pread:9,5");
        send_response(&mut stream, codec::hex_encode(b"HEL").as_bytes());

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vFile:pread:9,2");
        send_response(&mut stream, b"");

        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"vFile:close:9");
        send_response(&mut stream, b"F0");
    });

    let mut conn = Connection::open(Some(&addr), false, false).expect("connect over tcp");
    let dir = tempfile::tempdir().expect("temp dir");
    let local = dir.path().join("short.bin");

    conn.get("/short.bin", &local)
        .expect("get stops cleanly on an EOF pread, not an error");
    assert_eq!(std::fs::read(&local).expect("read"), b"HEL");

    handle.join().expect("mock thread panicked");
}

#[test]
fn unmapped_errno_surfaces_as_io_with_code_preserved() {
    let (addr, handle) = spawn_mock(|mut stream| {
        let payload = recv_command(&mut stream);
        assert_eq!(payload, b"qSupported");
        send_response(&mut stream, b"vSpectranext+");

        let payload = recv_command(&mut stream);
        assert_eq!(
            payload,
            format!("vFile:unlink:{}", codec::hex_encode(b"/weird")).into_bytes()
        );
        send_response(&mut stream, b"F-1,99");
    });

    let mut conn = Connection::open(Some(&addr), false, false).expect("connect over tcp");
    let err = conn.rm("/weird").expect_err("unmapped errno is surfaced");
    assert!(matches!(err, spx::Error::Io(_)));
    assert!(err.to_string().contains("99"));

    handle.join().expect("mock thread panicked");
}

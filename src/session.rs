//! The session layer: a background reader thread, ACK/NAK exchange with
//! retries, `qSupported` capability negotiation, and the `O`-packet sink.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::codec;
use crate::io_err;
use crate::transport::{Endpoint, RawPort, Transport};
use crate::Error;

const ACK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_SEND_ATTEMPTS: u32 = 4;
const CLOSE_READ_TIMEOUT: Duration = Duration::from_millis(10);
const CLOSE_JOIN_WAIT: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_MAX_PACKET_SIZE: usize = 1024;

enum Inbound {
    Ack,
    Nak,
    Data(Vec<u8>),
}

type SinkFn = Box<dyn FnMut(&[u8]) + Send>;
type Sink = Arc<Mutex<SinkFn>>;

fn default_sink() -> SinkFn {
    Box::new(|chunk: &[u8]| {
        eprintln!("[LOG] {}", String::from_utf8_lossy(chunk));
    })
}

/// Restores the previously installed `O`-packet sink when dropped, per the
/// scoped-cleanup pattern follow-mode `exec` relies on.
pub(crate) struct SinkGuard {
    sink: Sink,
    previous: Option<SinkFn>,
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        if let Some(prev) = self.previous.take() {
            *self.sink.lock().unwrap() = prev;
        }
    }
}

pub(crate) struct Session {
    _transport: Transport,
    write_handle: RawPort,
    inbound_rx: Receiver<Inbound>,
    stop: Arc<AtomicBool>,
    done_rx: Receiver<()>,
    reader: Option<JoinHandle<()>>,
    sink: Sink,
    pub(crate) max_packet_size: usize,
}

impl Session {
    pub(crate) fn open(endpoint: &Endpoint) -> Result<Self, Error> {
        let transport = Transport::open(endpoint)?;
        transport.drain_stale()?;

        let reader_port = transport.handle();
        let write_handle = transport.handle();
        let (data_tx, data_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let sink: Sink = Arc::new(Mutex::new(default_sink()));

        let reader_stop = Arc::clone(&stop);
        let reader_sink = Arc::clone(&sink);
        let reader = std::thread::spawn(move || {
            reader_loop(reader_port, data_tx, reader_stop, reader_sink);
            let _ = done_tx.send(());
        });

        let mut session = Session {
            _transport: transport,
            write_handle,
            inbound_rx: data_rx,
            stop,
            done_rx,
            reader: Some(reader),
            sink,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        };
        session.negotiate()?;
        Ok(session)
    }

    fn negotiate(&mut self) -> Result<(), Error> {
        let response = self.send_command(b"qSupported", Some(DEFAULT_RESPONSE_TIMEOUT))?;
        let text = std::str::from_utf8(&response)?;
        let mut supported = false;
        for part in text.split(';') {
            if part == "vSpectranext+" {
                supported = true;
            } else if let Some(hex) = part.strip_prefix("PacketSize=") {
                if let Ok(size) = usize::from_str_radix(hex, 16) {
                    if size > self.max_packet_size {
                        self.max_packet_size = size;
                    }
                }
            }
        }
        if !supported {
            return Err(Error::NotSupported);
        }
        Ok(())
    }

    /// Sends `payload` as a framed data packet, waits for ACK (retrying up
    /// to three times on NAK), then waits for the response with
    /// `response_timeout` (`None` waits indefinitely).
    pub(crate) fn send_command(
        &mut self,
        payload: &[u8],
        response_timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Error> {
        self.send_until_acked(payload)?;
        self.recv_response(response_timeout)
    }

    /// Like [`send_command`](Self::send_command), but polls for the
    /// response at a fixed 100ms interval so the caller can observe a
    /// cancellation flag and an elapsed-time deadline — the shape
    /// follow-mode `exec` needs. Returns `Ok(None)` if cancelled or the
    /// deadline expires before a response arrives.
    pub(crate) fn send_command_polling(
        &mut self,
        payload: &[u8],
        cancel: &AtomicBool,
        follow_seconds: Option<u64>,
    ) -> Result<Option<Vec<u8>>, Error> {
        self.send_until_acked(payload)?;
        let start = Instant::now();
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Ok(None);
            }
            if let Some(secs) = follow_seconds {
                if start.elapsed() >= Duration::from_secs(secs) {
                    return Ok(None);
                }
            }
            match self.inbound_rx.recv_timeout(POLL_INTERVAL) {
                Ok(Inbound::Data(d)) => return Ok(Some(d)),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Io(io_err("reader thread terminated")))
                }
            }
        }
    }

    fn send_until_acked(&mut self, payload: &[u8]) -> Result<(), Error> {
        let framed = codec::frame(payload);
        for attempt in 1..=MAX_SEND_ATTEMPTS {
            self.write_handle.write_all(&framed).map_err(Error::Io)?;
            self.write_handle.flush().map_err(Error::Io)?;
            loop {
                match self.inbound_rx.recv_timeout(ACK_TIMEOUT) {
                    Ok(Inbound::Ack) => return Ok(()),
                    Ok(Inbound::Nak) => {
                        // No client-side drain here: the reader thread is
                        // the transport's sole reader once spawned (see
                        // `Session::open`) and already discards anything
                        // that isn't `+`/`-`/a well-formed frame as noise
                        // in its own loop. Reading from a second handle
                        // here would race the reader byte-for-byte on the
                        // same stream and could split a frame between the
                        // two readers.
                        if attempt == MAX_SEND_ATTEMPTS {
                            return Err(Error::Io(io_err("NAK after retries")));
                        }
                        break;
                    }
                    Ok(Inbound::Data(_)) => continue,
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(Error::Io(io_err("ACK timeout")))
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(Error::Io(io_err("reader thread terminated")))
                    }
                }
            }
        }
        Err(Error::Io(io_err("NAK after retries")))
    }

    fn recv_response(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, Error> {
        loop {
            let received = match timeout {
                Some(t) => self.inbound_rx.recv_timeout(t).map_err(|e| match e {
                    RecvTimeoutError::Timeout => Error::Io(io_err("response timeout")),
                    RecvTimeoutError::Disconnected => {
                        Error::Io(io_err("reader thread terminated"))
                    }
                })?,
                None => self
                    .inbound_rx
                    .recv()
                    .map_err(|_| Error::Io(io_err("reader thread terminated")))?,
            };
            match received {
                Inbound::Data(d) => return Ok(d),
                Inbound::Ack | Inbound::Nak => continue,
            }
        }
    }

    /// Blocks, without sending anything, until `cancel` is set or
    /// `follow_seconds` elapses. `O`-packets keep streaming to whatever
    /// sink is installed via the reader thread in the background.
    pub(crate) fn wait_following(&self, cancel: &AtomicBool, follow_seconds: Option<u64>) {
        let start = Instant::now();
        loop {
            if cancel.load(Ordering::Relaxed) {
                return;
            }
            if let Some(secs) = follow_seconds {
                if start.elapsed() >= Duration::from_secs(secs) {
                    return;
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Installs `new_sink` for the duration of the returned guard; dropping
    /// the guard restores whatever sink was previously installed.
    pub(crate) fn install_sink(&self, new_sink: SinkFn) -> SinkGuard {
        let previous = std::mem::replace(&mut *self.sink.lock().unwrap(), new_sink);
        SinkGuard {
            sink: Arc::clone(&self.sink),
            previous: Some(previous),
        }
    }

    /// Signals the reader to stop, shrinks its read timeout so it wakes
    /// promptly, waits briefly for it to exit, then returns regardless.
    pub(crate) fn close(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.write_handle.set_read_timeout(CLOSE_READ_TIMEOUT);
        let _ = self.done_rx.recv_timeout(CLOSE_JOIN_WAIT);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.reader.take() {
            // Best-effort: the thread has almost certainly already exited
            // by now (close() shrank its timeout and waited); detach
            // otherwise rather than block a destructor indefinitely.
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

fn reader_loop(mut port: RawPort, tx: Sender<Inbound>, stop: Arc<AtomicBool>, sink: Sink) {
    let mut byte = [0u8; 1];
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        match io::Read::read(&mut port, &mut byte) {
            Ok(0) => return,
            Ok(_) => {}
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(_) => return,
        }
        match byte[0] {
            b'+' => {
                let _ = tx.send(Inbound::Ack);
            }
            b'-' => {
                let _ = tx.send(Inbound::Nak);
            }
            b'$' => match read_frame_body(&mut port, &stop) {
                Ok(Some(raw)) => handle_frame(&mut port, &tx, &sink, &raw),
                Ok(None) => return,
                Err(_) => return,
            },
            _ => {}
        }
    }
}

fn read_frame_body(port: &mut RawPort, stop: &AtomicBool) -> io::Result<Option<Vec<u8>>> {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(None);
        }
        match io::Read::read(port, &mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => return Err(e),
        }
        raw.push(byte[0]);
        if byte[0] == b'#' {
            let mut got = 0usize;
            let mut cksum = [0u8; 2];
            while got < 2 {
                match io::Read::read(port, &mut cksum[got..got + 1]) {
                    Ok(0) => return Ok(None),
                    Ok(_) => got += 1,
                    Err(ref e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        continue
                    }
                    Err(e) => return Err(e),
                }
            }
            raw.extend_from_slice(&cksum);
            break;
        }
    }
    Ok(Some(raw))
}

fn handle_frame(port: &mut RawPort, tx: &Sender<Inbound>, sink: &Sink, raw: &[u8]) {
    match codec::parse_frame(raw) {
        Ok(payload) => {
            let _ = port.write_all(b"+");
            match decode_log_chunk(&payload) {
                Some(decoded) => (sink.lock().unwrap())(&decoded),
                None => {
                    let _ = tx.send(Inbound::Data(payload.to_vec()));
                }
            }
        }
        Err(_) => {
            let _ = port.write_all(b"-");
        }
    }
}

/// A payload is an `O`-packet only if everything after the leading `O`
/// decodes as hex; `OK` and other plain responses fall through to the
/// response queue instead of being silently swallowed.
fn decode_log_chunk(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.first() != Some(&b'O') {
        return None;
    }
    let text = std::str::from_utf8(&payload[1..]).ok()?;
    codec::hex_decode(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_well_formed_log_chunk() {
        let payload = format!("O{}", codec::hex_encode(b"hello\n"));
        assert_eq!(
            decode_log_chunk(payload.as_bytes()),
            Some(b"hello\n".to_vec())
        );
    }

    #[test]
    fn ok_response_is_not_mistaken_for_a_log_chunk() {
        assert_eq!(decode_log_chunk(b"OK"), None);
    }

    #[test]
    fn non_o_payload_is_not_a_log_chunk() {
        assert_eq!(decode_log_chunk(b"F5"), None);
    }
}

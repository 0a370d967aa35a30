//! Transport endpoints: byte-level I/O over a serial port or a TCP socket,
//! exclusive device locking, and endpoint selection.

mod lock;

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use serial2::SerialPort;

use crate::discovery;
use crate::Error;
use lock::DeviceLock;

const DEFAULT_BAUD: u32 = 115_200;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// A transport endpoint: a serial device or a TCP host/port, constructed
/// once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Serial {
        path: String,
        baud: u32,
        timeout: Duration,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

impl Endpoint {
    /// Parses a caller-supplied endpoint string. A string containing `:` is
    /// a `host:port` pair; a string composed only of digits is a bare port
    /// on localhost; anything else is a serial device path.
    pub fn parse(s: &str) -> Result<Endpoint, Error> {
        if let Some((host, port)) = s.rsplit_once(':') {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::Invalid(format!("bad port in endpoint '{s}'")))?;
            return Ok(Endpoint::Tcp {
                host: host.to_string(),
                port,
            });
        }
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            let port: u16 = s
                .parse()
                .map_err(|_| Error::Invalid(format!("bad port in endpoint '{s}'")))?;
            return Ok(Endpoint::Tcp {
                host: "localhost".to_string(),
                port,
            });
        }
        Ok(Endpoint::Serial {
            path: s.to_string(),
            baud: DEFAULT_BAUD,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Resolves the endpoint to use: explicit argument, then
    /// `SPECTRANEXT_CLI`, then USB discovery, then `localhost:1337`.
    pub fn resolve(explicit: Option<&str>) -> Result<Endpoint, Error> {
        if let Some(e) = explicit {
            return Endpoint::parse(e);
        }
        if let Ok(v) = std::env::var("SPECTRANEXT_CLI") {
            if !v.is_empty() {
                return Endpoint::parse(&v);
            }
        }
        if let Some(dev) = discovery::find_device() {
            log::info!("discovered device at {}", dev.path);
            return Endpoint::parse(&dev.path);
        }
        Ok(Endpoint::Tcp {
            host: "localhost".to_string(),
            port: 1337,
        })
    }
}

/// The concrete byte-level handle for an open endpoint. Cloning shares the
/// same underlying port: both variants wrap their handle in an `Arc` so
/// the reader thread and the client each hold their own `RawPort` onto the
/// same socket/port rather than splitting ownership. `TcpStream` itself
/// isn't `Clone` (unlike `serial2::SerialPort`, which is already `Sync`),
/// hence the `Arc` here rather than a bare `TcpStream`.
#[derive(Clone)]
pub(crate) enum RawPort {
    Serial(Arc<SerialPort>),
    Tcp(Arc<TcpStream>),
}

impl RawPort {
    pub(crate) fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        match self {
            RawPort::Serial(p) => p.set_read_timeout(timeout),
            RawPort::Tcp(s) => s.set_read_timeout(Some(timeout)),
        }
    }

    fn discard_input(&self) -> io::Result<()> {
        match self {
            RawPort::Serial(p) => p.discard_input_buffer(),
            RawPort::Tcp(_) => Ok(()),
        }
    }
}

impl Read for RawPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            RawPort::Serial(p) => (&**p).read(buf),
            RawPort::Tcp(s) => (&**s).read(buf),
        }
    }
}

impl Write for RawPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            RawPort::Serial(p) => (&**p).write(buf),
            RawPort::Tcp(s) => (&**s).write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            RawPort::Serial(p) => (&**p).flush(),
            RawPort::Tcp(s) => (&**s).flush(),
        }
    }
}

/// An open transport: the byte-level port plus, for serial endpoints, the
/// exclusive device lock held for the transport's lifetime.
pub(crate) struct Transport {
    port: RawPort,
    _lock: Option<DeviceLock>,
}

impl Transport {
    pub(crate) fn open(endpoint: &Endpoint) -> Result<Self, Error> {
        let (port, lock) = match endpoint {
            Endpoint::Serial { path, baud, timeout } => {
                let lock = DeviceLock::acquire(path)?;
                let serial = SerialPort::open(path, *baud).map_err(Error::Io)?;
                serial.set_read_timeout(*timeout).map_err(Error::Io)?;
                (RawPort::Serial(Arc::new(serial)), Some(lock))
            }
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).map_err(Error::Io)?;
                stream
                    .set_read_timeout(Some(DEFAULT_TIMEOUT))
                    .map_err(Error::Io)?;
                (RawPort::Tcp(Arc::new(stream)), None)
            }
        };
        Ok(Transport { port, _lock: lock })
    }

    /// Returns a handle sharing the same underlying port, for the reader
    /// thread or the client side to hold independently.
    pub(crate) fn handle(&self) -> RawPort {
        self.port.clone()
    }

    /// Reads and discards bytes with a short timeout until an empty read,
    /// clearing console banners or residue left by a prior session.
    pub(crate) fn drain_stale(&self) -> Result<(), Error> {
        let mut handle = self.port.clone();
        handle.set_read_timeout(DRAIN_TIMEOUT).map_err(Error::Io)?;
        let _ = handle.discard_input();
        let mut buf = [0u8; 256];
        loop {
            match handle.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    break
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_as_tcp() {
        assert_eq!(
            Endpoint::parse("127.0.0.1:1337").unwrap(),
            Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: 1337
            }
        );
    }

    #[test]
    fn parses_bare_digits_as_localhost_tcp() {
        assert_eq!(
            Endpoint::parse("1337").unwrap(),
            Endpoint::Tcp {
                host: "localhost".to_string(),
                port: 1337
            }
        );
    }

    #[test]
    fn parses_other_strings_as_serial_path() {
        assert_eq!(
            Endpoint::parse("/dev/ttyUSB0").unwrap(),
            Endpoint::Serial {
                path: "/dev/ttyUSB0".to_string(),
                baud: DEFAULT_BAUD,
                timeout: DEFAULT_TIMEOUT,
            }
        );
    }
}

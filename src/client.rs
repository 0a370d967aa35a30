//! The high-level client API: directory listing, file transfer, and
//! control operations, with packet-size-derived chunking and progress.

use std::fs::File;
use std::io::{IsTerminal, Read, Write};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};

use crate::ops;
use crate::session::Session;
use crate::transport::Endpoint;
use crate::Error;

/// One entry returned by [`Connection::ls`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EntryKind::File => "F",
            EntryKind::Directory => "D",
        })
    }
}

/// A live connection to the Spectranext RAMFS over RSP.
pub struct Connection {
    session: Session,
    progress: bool,
}

impl Connection {
    /// Opens a connection. `endpoint` selects the transport explicitly;
    /// `None` falls back to `SPECTRANEXT_CLI`, USB discovery, then
    /// `localhost:1337`. `progress` enables transfer progress bars, gated
    /// on the output being a terminal.
    pub fn open(endpoint: Option<&str>, progress: bool, _verbose: bool) -> Result<Self, Error> {
        let endpoint = Endpoint::resolve(endpoint)?;
        let session = Session::open(&endpoint)?;
        Ok(Connection { session, progress })
    }

    /// The negotiated packet-size ceiling (default 1024, raised by
    /// `qSupported` if the device advertises a larger `PacketSize`).
    pub fn max_packet_size(&self) -> usize {
        self.session.max_packet_size
    }

    fn read_chunk_limit(&self) -> usize {
        (self.session.max_packet_size.saturating_sub(1)) / 2
    }

    fn write_chunk_limit(&self) -> usize {
        (self.session.max_packet_size.saturating_sub(25)) / 2
    }

    /// Lists `path`. `closedir` is issued on every exit path, even when
    /// the listing itself failed partway through.
    pub fn ls(&mut self, path: &str) -> Result<Vec<DirEntry>, Error> {
        ops::opendir(&mut self.session, path)?;
        let result = (|| -> Result<Vec<DirEntry>, Error> {
            let mut entries = Vec::new();
            while let Some(raw) = ops::readdir(&mut self.session)? {
                let kind = if raw.kind == 'D' {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                entries.push(DirEntry {
                    name: raw.name,
                    kind,
                    size: raw.size,
                });
            }
            Ok(entries)
        })();
        if let Err(e) = ops::closedir(&mut self.session) {
            log::warn!("closedir failed: {e}");
        }
        result
    }

    /// Downloads `remote` to `local`. The remote file handle is closed on
    /// every exit path, success or failure.
    pub fn get(&mut self, remote: &str, local: &Path) -> Result<(), Error> {
        let total = ops::size(&mut self.session, remote)?;
        let fd = ops::open(&mut self.session, remote, ops::O_RDONLY, 0)?;
        let result = (|| -> Result<(), Error> {
            let mut file = File::create(local).map_err(Error::Io)?;
            let bar = self.progress_bar(total, "get");
            let chunk = self.read_chunk_limit().max(1);
            let mut received = 0u64;
            while received < total {
                let want = chunk.min((total - received) as usize);
                let data = ops::pread(&mut self.session, fd, want)?;
                if data.is_empty() {
                    break;
                }
                file.write_all(&data).map_err(Error::Io)?;
                received += data.len() as u64;
                if let Some(bar) = &bar {
                    bar.set_position(received.min(total));
                }
            }
            if let Some(bar) = bar {
                bar.finish_and_clear();
            }
            Ok(())
        })();
        if let Err(e) = ops::close(&mut self.session, fd) {
            if result.is_ok() {
                log::warn!("close failed after get: {e}");
            }
        }
        result
    }

    /// Uploads `local` to `remote`. The remote file handle is closed on
    /// every exit path, success or failure.
    pub fn put(&mut self, local: &Path, remote: &str) -> Result<(), Error> {
        let mut file = File::open(local).map_err(Error::Io)?;
        let total = file.metadata().map_err(Error::Io)?.len();
        let fd = ops::open(
            &mut self.session,
            remote,
            ops::O_WRONLY_TRUNC_CREAT,
            0,
        )?;
        let result = (|| -> Result<(), Error> {
            let bar = self.progress_bar(total, "put");
            let chunk_limit = self.write_chunk_limit().max(1);
            let mut buf = vec![0u8; chunk_limit];
            let mut sent = 0u64;
            loop {
                let n = file.read(&mut buf).map_err(Error::Io)?;
                if n == 0 {
                    break;
                }
                let mut offset = 0;
                while offset < n {
                    let accepted = ops::pwrite(&mut self.session, fd, &buf[offset..n])?;
                    if accepted == 0 {
                        return Err(Error::Protocol(
                            "device accepted 0 bytes on pwrite".to_string(),
                        ));
                    }
                    offset += accepted;
                    sent += accepted as u64;
                    if let Some(bar) = &bar {
                        bar.set_position(sent.min(total));
                    }
                }
            }
            if let Some(bar) = bar {
                bar.finish_and_clear();
            }
            Ok(())
        })();
        if let Err(e) = ops::close(&mut self.session, fd) {
            if result.is_ok() {
                log::warn!("close failed after put: {e}");
            }
        }
        result
    }

    pub fn rm(&mut self, path: &str) -> Result<(), Error> {
        ops::unlink(&mut self.session, path)
    }

    pub fn mv(&mut self, old: &str, new: &str) -> Result<(), Error> {
        ops::mv(&mut self.session, old, new)
    }

    pub fn mkdir(&mut self, path: &str) -> Result<(), Error> {
        ops::mkdir(&mut self.session, path)
    }

    pub fn rmdir(&mut self, path: &str) -> Result<(), Error> {
        ops::rmdir(&mut self.session, path)
    }

    pub fn reboot(&mut self) -> Result<(), Error> {
        ops::reboot(&mut self.session)
    }

    pub fn autoboot(&mut self) -> Result<(), Error> {
        ops::autoboot(&mut self.session)
    }

    /// Runs `command` on the device. With `follow=false`, returns as soon
    /// as the command is acknowledged; any `O`-packets are not displayed.
    /// With `follow=true`, streams decoded `O`-packets to stdout until the
    /// device replies `OK`, `cancel` is set, or `follow_seconds` elapses.
    pub fn exec(
        &mut self,
        command: &str,
        follow: bool,
        follow_seconds: Option<u64>,
        cancel: Arc<AtomicBool>,
    ) -> Result<(), Error> {
        if !follow {
            return ops::exec(&mut self.session, command);
        }
        let guard = self.session.install_sink(Box::new(|chunk: &[u8]| {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(chunk);
            let _ = stdout.flush();
        }));
        let completed = ops::exec_following(&mut self.session, command, &cancel, follow_seconds)?;
        drop(guard);
        if !completed {
            log::info!("exec follow ended by cancellation or timeout");
        }
        Ok(())
    }

    /// Streams decoded `O`-packets to stdout without issuing a command,
    /// for the duration of `autoboot --follow` observing the device's
    /// post-reset console output.
    pub fn follow(&mut self, follow_seconds: Option<u64>, cancel: Arc<AtomicBool>) {
        let guard = self.session.install_sink(Box::new(|chunk: &[u8]| {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(chunk);
            let _ = stdout.flush();
        }));
        self.session.wait_following(&cancel, follow_seconds);
        drop(guard);
    }

    fn progress_bar(&self, total: u64, verb: &str) -> Option<ProgressBar> {
        if !self.progress || !std::io::stdout().is_terminal() {
            return None;
        }
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template("{msg} [{bar:40}] {bytes}/{total_bytes} ({eta})")
                .unwrap()
                .progress_chars("=> "),
        );
        bar.set_message(verb.to_string());
        Some(bar)
    }
}

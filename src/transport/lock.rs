//! Exclusive advisory locking of the serial device, cross-platform via `fs2`.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Holds the exclusive lock for the lifetime of a `Connection`. Release is
/// unconditional and swallows errors — best-effort teardown.
pub(crate) struct DeviceLock {
    file: File,
    temp_path: Option<PathBuf>,
}

impl DeviceLock {
    /// Acquires an exclusive lock on `path`. On POSIX the device node itself
    /// is locked; on Windows a sanitized stand-in file in the temp directory
    /// is locked instead, since `flock`-style semantics on a serial device
    /// node aren't available there.
    pub(crate) fn acquire(path: &str) -> Result<Self, Error> {
        let (file, temp_path) = if cfg!(windows) {
            let sanitized: String = path
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            let temp_path = std::env::temp_dir().join(format!("spx-{sanitized}.lock"));
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&temp_path)?;
            (file, Some(temp_path))
        } else {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            (file, None)
        };

        let deadline = Instant::now() + LOCK_TIMEOUT;
        let mut warned = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(DeviceLock { file, temp_path }),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned {
                        log::info!("waiting for device lock on {path}");
                        warned = true;
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::Locked(path.to_string()));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        if let Some(p) = &self.temp_path {
            let _ = std::fs::remove_file(p);
        }
    }
}

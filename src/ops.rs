//! Typed wrappers over the `vFile:`, `vSpectranext:`, and `qRcmd` packet
//! families, and the errno-to-`Error` translation shared by all of them.

use crate::codec;
use crate::session::Session;
use crate::Error;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Maps a POSIX errno, as carried in `F-1,<errno>` and `E<errno>`
/// responses, to the closed error taxonomy.
pub(crate) fn errno_to_error(errno: i64) -> Error {
    match errno {
        2 => Error::NotFound,
        5 => Error::Io(crate::io_err("device I/O error")),
        13 => Error::PermissionDenied,
        17 => Error::Exists,
        22 => Error::Invalid("invalid argument".to_string()),
        other => Error::Io(crate::io_err(format!("device errno {other}"))),
    }
}

fn qrcmd_error(code: &str) -> Error {
    let msg = match code {
        "E01" => "invalid hex in qRcmd command",
        "E02" => "qRcmd command too long",
        "E03" => "qRcmd too many arguments",
        "E04" => "qRcmd unknown command",
        _ => "qRcmd error",
    };
    Error::Invalid(msg.to_string())
}

fn hex_path(path: &str) -> String {
    codec::hex_encode(path.as_bytes())
}

/// Parses an `F<value>` or `F-1,<errno>` response payload.
fn parse_f_response(payload: &str) -> Result<&str, Error> {
    let rest = payload
        .strip_prefix('F')
        .ok_or_else(|| Error::Protocol(format!("expected F-response, got '{payload}'")))?;
    if let Some(errno_str) = rest.strip_prefix("-1,") {
        let errno: i64 = errno_str
            .parse()
            .map_err(|_| Error::Protocol(format!("bad errno in '{payload}'")))?;
        return Err(errno_to_error(errno));
    }
    Ok(rest)
}

fn expect_ok(payload: &str) -> Result<(), Error> {
    if payload == "OK" {
        return Ok(());
    }
    if let Some(errno_str) = payload.strip_prefix('E') {
        if let Ok(errno) = errno_str.parse::<i64>() {
            return Err(errno_to_error(errno));
        }
        return Err(qrcmd_error(payload));
    }
    Err(Error::Protocol(format!("expected OK, got '{payload}'")))
}

pub(crate) const O_RDONLY: u32 = 0x0000;
pub(crate) const O_WRONLY_TRUNC_CREAT: u32 = 0x0201;

pub(crate) fn open(session: &mut Session, path: &str, flags: u32, mode: u32) -> Result<u32, Error> {
    let cmd = format!("vFile:open:0,{:x},{:x},{}", flags, mode, hex_path(path));
    let response = session.send_command(cmd.as_bytes(), Some(DEFAULT_TIMEOUT))?;
    let text = std::str::from_utf8(&response)?;
    let fd_hex = parse_f_response(text)?;
    u32::from_str_radix(fd_hex, 16)
        .map_err(|_| Error::Protocol(format!("bad file descriptor '{fd_hex}'")))
}

pub(crate) fn close(session: &mut Session, fd: u32) -> Result<(), Error> {
    let cmd = format!("vFile:close:{:x}", fd);
    let response = session.send_command(cmd.as_bytes(), Some(DEFAULT_TIMEOUT))?;
    let text = std::str::from_utf8(&response)?;
    parse_f_response(text)?;
    Ok(())
}

/// Reads up to `count` bytes at the file's current device-side position.
/// Returns the decoded bytes; an empty result means EOF.
pub(crate) fn pread(session: &mut Session, fd: u32, count: usize) -> Result<Vec<u8>, Error> {
    let cmd = format!("vFile:pread:{:x},{:x}", fd, count);
    let response = session.send_command(cmd.as_bytes(), Some(DEFAULT_TIMEOUT))?;
    let text = std::str::from_utf8(&response)?;
    if text.starts_with('F') {
        parse_f_response(text)?;
    }
    codec::hex_decode(text)
}

/// Writes `data` and returns the number of bytes the device accepted.
pub(crate) fn pwrite(session: &mut Session, fd: u32, data: &[u8]) -> Result<usize, Error> {
    let cmd = format!("vFile:pwrite:{:x},{}", fd, codec::hex_encode(data));
    let response = session.send_command(cmd.as_bytes(), Some(DEFAULT_TIMEOUT))?;
    let text = std::str::from_utf8(&response)?;
    let n_hex = parse_f_response(text)?;
    usize::from_str_radix(n_hex, 16)
        .map_err(|_| Error::Protocol(format!("bad byte count '{n_hex}'")))
}

pub(crate) fn size(session: &mut Session, path: &str) -> Result<u64, Error> {
    let cmd = format!("vFile:size:{}", hex_path(path));
    let response = session.send_command(cmd.as_bytes(), Some(DEFAULT_TIMEOUT))?;
    let text = std::str::from_utf8(&response)?;
    let size_hex = parse_f_response(text)?;
    u64::from_str_radix(size_hex, 16)
        .map_err(|_| Error::Protocol(format!("bad size '{size_hex}'")))
}

pub(crate) fn exists(session: &mut Session, path: &str) -> Result<bool, Error> {
    let cmd = format!("vFile:exists:{}", hex_path(path));
    let response = session.send_command(cmd.as_bytes(), Some(DEFAULT_TIMEOUT))?;
    let text = std::str::from_utf8(&response)?;
    match text {
        "F,1" => Ok(true),
        "F,0" => Ok(false),
        other => {
            parse_f_response(other)?;
            Err(Error::Protocol(format!("unexpected exists response '{other}'")))
        }
    }
}

pub(crate) fn unlink(session: &mut Session, path: &str) -> Result<(), Error> {
    let cmd = format!("vFile:unlink:{}", hex_path(path));
    let response = session.send_command(cmd.as_bytes(), Some(DEFAULT_TIMEOUT))?;
    let text = std::str::from_utf8(&response)?;
    parse_f_response(text)?;
    Ok(())
}

pub(crate) fn opendir(session: &mut Session, path: &str) -> Result<(), Error> {
    let cmd = format!("vSpectranext:opendir:{}", hex_path(path));
    let response = session.send_command(cmd.as_bytes(), Some(DEFAULT_TIMEOUT))?;
    expect_ok(std::str::from_utf8(&response)?)
}

/// One raw directory entry, or `None` at end of listing.
pub(crate) struct RawEntry {
    pub(crate) name: String,
    pub(crate) kind: char,
    pub(crate) size: u64,
}

pub(crate) fn readdir(session: &mut Session) -> Result<Option<RawEntry>, Error> {
    let response = session.send_command(b"vSpectranext:readdir", Some(DEFAULT_TIMEOUT))?;
    let text = std::str::from_utf8(&response)?;
    if text.is_empty() {
        return Ok(None);
    }
    if let Some(rest) = text.strip_prefix("FOK,") {
        let mut parts = rest.splitn(3, ',');
        let name_hex = parts
            .next()
            .ok_or_else(|| Error::Protocol("readdir missing name".to_string()))?;
        let kind_str = parts
            .next()
            .ok_or_else(|| Error::Protocol("readdir missing kind".to_string()))?;
        let size_hex = parts
            .next()
            .ok_or_else(|| Error::Protocol("readdir missing size".to_string()))?;
        let name = String::from_utf8(codec::hex_decode(name_hex)?)
            .map_err(|e| Error::Protocol(format!("non-UTF-8 entry name: {e}")))?;
        let kind = kind_str
            .chars()
            .next()
            .ok_or_else(|| Error::Protocol("readdir empty kind".to_string()))?;
        let size = u64::from_str_radix(size_hex, 16)
            .map_err(|_| Error::Protocol(format!("bad size '{size_hex}'")))?;
        return Ok(Some(RawEntry { name, kind, size }));
    }
    if let Some(errno_str) = text.strip_prefix('E') {
        if let Ok(errno) = errno_str.parse::<i64>() {
            return Err(errno_to_error(errno));
        }
    }
    Err(Error::Protocol(format!(
        "unexpected readdir response '{text}'"
    )))
}

pub(crate) fn closedir(session: &mut Session) -> Result<(), Error> {
    let response = session.send_command(b"vSpectranext:closedir", Some(DEFAULT_TIMEOUT))?;
    expect_ok(std::str::from_utf8(&response)?)
}

pub(crate) fn mkdir(session: &mut Session, path: &str) -> Result<(), Error> {
    let cmd = format!("vSpectranext:mkdir:{}", hex_path(path));
    let response = session.send_command(cmd.as_bytes(), Some(DEFAULT_TIMEOUT))?;
    expect_ok(std::str::from_utf8(&response)?)
}

pub(crate) fn rmdir(session: &mut Session, path: &str) -> Result<(), Error> {
    let cmd = format!("vSpectranext:rmdir:{}", hex_path(path));
    let response = session.send_command(cmd.as_bytes(), Some(DEFAULT_TIMEOUT))?;
    expect_ok(std::str::from_utf8(&response)?)
}

pub(crate) fn mv(session: &mut Session, old: &str, new: &str) -> Result<(), Error> {
    let cmd = format!("vSpectranext:mv:{},{}", hex_path(old), hex_path(new));
    let response = session.send_command(cmd.as_bytes(), Some(DEFAULT_TIMEOUT))?;
    expect_ok(std::str::from_utf8(&response)?)
}

pub(crate) fn reboot(session: &mut Session) -> Result<(), Error> {
    let response = session.send_command(b"vSpectranext:reboot", Some(DEFAULT_TIMEOUT))?;
    expect_ok(std::str::from_utf8(&response)?)
}

pub(crate) fn autoboot(session: &mut Session) -> Result<(), Error> {
    let response = session.send_command(b"vSpectranext:autoboot", Some(DEFAULT_TIMEOUT))?;
    expect_ok(std::str::from_utf8(&response)?)
}

/// Issues `qRcmd,<hex-command>` without waiting past the acknowledged
/// success; `O`-packets after this call are not collected.
pub(crate) fn exec(session: &mut Session, command: &str) -> Result<(), Error> {
    let cmd = format!("qRcmd,{}", codec::hex_encode(command.as_bytes()));
    let response = session.send_command(cmd.as_bytes(), Some(DEFAULT_TIMEOUT))?;
    expect_ok(std::str::from_utf8(&response)?)
}

/// Issues `qRcmd,<hex-command>` and polls for the success response,
/// observing `cancel` and `follow_seconds`. `O`-packets stream to whatever
/// sink the caller installed before this call.
pub(crate) fn exec_following(
    session: &mut Session,
    command: &str,
    cancel: &std::sync::atomic::AtomicBool,
    follow_seconds: Option<u64>,
) -> Result<bool, Error> {
    let cmd = format!("qRcmd,{}", codec::hex_encode(command.as_bytes()));
    match session.send_command_polling(cmd.as_bytes(), cancel, follow_seconds)? {
        Some(response) => {
            expect_ok(std::str::from_utf8(&response)?)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

//! GDB Remote Serial Protocol framing: escaping, checksums, and packet
//! assembly/decomposition. Pure, allocation-light functions operating on
//! byte buffers — no I/O here.

use bytes::{BufMut, BytesMut};

use crate::Error;

const ESCAPE: u8 = b'}';
const ESCAPE_XOR: u8 = 0x20;

/// Bytes that must be escaped when they appear in a packet payload.
fn needs_escape(b: u8) -> bool {
    matches!(b, b'}' | b'#' | b'$' | b'*')
}

/// Escapes `payload` per the RSP binary escaping rule: `}` followed by the
/// byte XORed with 0x20.
pub fn escape(payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(payload.len());
    for &b in payload {
        if needs_escape(b) {
            out.put_u8(ESCAPE);
            out.put_u8(b ^ ESCAPE_XOR);
        } else {
            out.put_u8(b);
        }
    }
    out
}

/// Reverses [`escape`]. Returns an error if a trailing escape byte has no
/// following byte to unescape.
pub fn unescape(payload: &[u8]) -> Result<BytesMut, Error> {
    let mut out = BytesMut::with_capacity(payload.len());
    let mut iter = payload.iter().copied();
    while let Some(b) = iter.next() {
        if b == ESCAPE {
            let next = iter
                .next()
                .ok_or_else(|| Error::Protocol("truncated escape sequence".into()))?;
            out.put_u8(next ^ ESCAPE_XOR);
        } else {
            out.put_u8(b);
        }
    }
    Ok(out)
}

/// Modulo-256 checksum over the unescaped payload bytes, as used in the
/// `#cc` trailer.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Assembles a complete `$payload#cc` frame, escaping the payload first.
pub fn frame(payload: &[u8]) -> BytesMut {
    let escaped = escape(payload);
    let cksum = checksum(payload);
    let mut out = BytesMut::with_capacity(escaped.len() + 4);
    out.put_u8(b'$');
    out.extend_from_slice(&escaped);
    out.put_u8(b'#');
    out.extend_from_slice(format!("{:02x}", cksum).as_bytes());
    out
}

/// Splits a raw `$payload#cc` frame into its unescaped payload, validating
/// the checksum. `raw` must not include the leading `$`.
pub fn parse_frame(raw: &[u8]) -> Result<BytesMut, Error> {
    let hash_pos = raw
        .iter()
        .rposition(|&b| b == b'#')
        .ok_or_else(|| Error::Protocol("frame missing '#' trailer".into()))?;
    if raw.len() != hash_pos + 3 {
        return Err(Error::Protocol("frame has trailing garbage".into()));
    }
    let payload_raw = &raw[..hash_pos];
    let cksum_hex = std::str::from_utf8(&raw[hash_pos + 1..])?;
    let given = u8::from_str_radix(cksum_hex, 16)
        .map_err(|_| Error::Protocol(format!("bad checksum hex: {cksum_hex}")))?;
    let payload = unescape(payload_raw)?;
    let computed = checksum(&payload);
    if computed != given {
        return Err(Error::Protocol(format!(
            "checksum mismatch: computed {computed:02x}, frame said {given:02x}"
        )));
    }
    Ok(payload)
}

/// Encodes `data` as lowercase ASCII hex, the encoding `vFile:pwrite` and
/// `qRcmd` use for binary payloads.
pub fn hex_encode(data: &[u8]) -> String {
    hex::encode(data)
}

/// Decodes an ASCII hex string back to bytes.
pub fn hex_decode(s: &str) -> Result<Vec<u8>, Error> {
    hex::decode(s).map_err(|e| Error::Protocol(format!("bad hex payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trip() {
        let payload = b"hello $world# with}special*chars";
        let escaped = escape(payload);
        let unescaped = unescape(&escaped).unwrap();
        assert_eq!(&unescaped[..], payload);
    }

    #[test]
    fn escape_is_idempotent_on_plain_bytes() {
        let payload = b"vFile:open:2f746d70,0,1a4";
        let escaped = escape(payload);
        assert_eq!(&escaped[..], payload);
    }

    #[test]
    fn checksum_known_value() {
        // "OK" -> 'O' (0x4f) + 'K' (0x4b) = 0x9a
        assert_eq!(checksum(b"OK"), 0x9a);
    }

    #[test]
    fn frame_and_parse_round_trip() {
        let payload = b"vFile:close:0";
        let framed = frame(payload);
        assert!(framed.starts_with(b"$"));
        let hash = framed.iter().rposition(|&b| b == b'#').unwrap();
        let parsed = parse_frame(&framed[1..]).unwrap();
        assert_eq!(&parsed[..], payload);
        assert_eq!(framed.len(), 1 + payload.len() + 1 + 2);
        let _ = hash;
    }

    #[test]
    fn parse_frame_rejects_bad_checksum() {
        let mut framed = frame(b"vFile:close:0");
        let len = framed.len();
        framed[len - 1] = b'0';
        framed[len - 2] = b'0';
        let err = parse_frame(&framed[1..]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn hex_round_trip() {
        let data = b"\x00\x01\xffspectranext";
        let encoded = hex_encode(data);
        let decoded = hex_decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }
}

//! # RESP2 Encoding and Decoding
//!
//! Purpose: Encode commands for the backing store and decode its replies from
//! a growing read buffer, without tying the codec to any socket type.
//!
//! ## Design Principles
//! 1. **Sans-IO Decoding**: `decode` inspects bytes and reports how many it
//!    consumed; the caller owns reading and buffer advancement.
//! 2. **Incomplete Is Not An Error**: a partial frame yields `Ok(None)` so the
//!    caller reads more and retries.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing and excessive nesting return protocol
//!    errors immediately.
//! 5. **Resumable**: `decode_frame` reports how many bytes an incomplete
//!    frame needs, so a growing buffer is not re-parsed on every read.

use bytes::{BufMut, Bytes, BytesMut};

use cachegw_common::{BackendError, BackendResult};

/// Largest bulk string accepted from the backend (512 MiB, the Redis limit).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Deepest array nesting accepted from the backend. GET/SET/PING replies are
/// flat; the cap keeps hostile input from exhausting the stack.
const MAX_NESTING: usize = 32;

/// RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style replies.
    Simple(Bytes),
    /// -ERR ... replies.
    Error(Bytes),
    /// :123 replies.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Bytes>),
    /// *... arrays, with a null array decoded as empty.
    Array(Vec<RespValue>),
}

/// Appends a RESP2 array command to `out`.
pub fn encode_command(args: &[&[u8]], out: &mut BytesMut) {
    let payload: usize = args.iter().map(|arg| arg.len() + 16).sum();
    out.reserve(payload + 16);

    out.put_u8(b'*');
    put_decimal(out, args.len());
    out.put_slice(b"\r\n");
    for arg in args {
        out.put_u8(b'$');
        put_decimal(out, arg.len());
        out.put_slice(b"\r\n");
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
}

/// Result of decoding the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete reply and the number of bytes it occupied.
    Frame(RespValue, usize),
    /// The buffer must hold at least this many bytes before decoding can
    /// make progress.
    Incomplete(usize),
}

/// Decodes one reply from the front of `buf`.
///
/// Returns the value and the number of bytes it occupied, or `None` when the
/// buffer does not yet hold a complete frame.
pub fn decode(buf: &[u8]) -> BackendResult<Option<(RespValue, usize)>> {
    Ok(match decode_frame(buf)? {
        Decoded::Frame(value, used) => Some((value, used)),
        Decoded::Incomplete(_) => None,
    })
}

/// Like `decode`, but an incomplete frame reports a lower bound on the bytes
/// it needs so callers can skip re-parsing until that much has arrived.
pub fn decode_frame(buf: &[u8]) -> BackendResult<Decoded> {
    decode_value(buf, 0)
}

fn decode_value(buf: &[u8], depth: usize) -> BackendResult<Decoded> {
    if depth > MAX_NESTING {
        return Err(BackendError::Protocol);
    }
    let line_end = match find_crlf(buf) {
        Some(pos) => pos,
        None => return Ok(Decoded::Incomplete(buf.len() + 1)),
    };
    if line_end == 0 {
        return Err(BackendError::Protocol);
    }

    let line = &buf[1..line_end];
    let header_len = line_end + 2;

    match buf[0] {
        b'+' => Ok(Decoded::Frame(
            RespValue::Simple(Bytes::copy_from_slice(line)),
            header_len,
        )),
        b'-' => Ok(Decoded::Frame(
            RespValue::Error(Bytes::copy_from_slice(line)),
            header_len,
        )),
        b':' => Ok(Decoded::Frame(RespValue::Integer(parse_i64(line)?), header_len)),
        b'$' => decode_bulk(buf, parse_i64(line)?, header_len),
        b'*' => decode_array(buf, parse_i64(line)?, header_len, depth),
        _ => Err(BackendError::Protocol),
    }
}

fn decode_bulk(buf: &[u8], len: i64, header_len: usize) -> BackendResult<Decoded> {
    if len < 0 {
        return Ok(Decoded::Frame(RespValue::Bulk(None), header_len));
    }
    if len > MAX_BULK_LEN {
        return Err(BackendError::Protocol);
    }

    let end = header_len + len as usize;
    if buf.len() < end + 2 {
        return Ok(Decoded::Incomplete(end + 2));
    }
    if &buf[end..end + 2] != b"\r\n" {
        return Err(BackendError::Protocol);
    }

    let data = Bytes::copy_from_slice(&buf[header_len..end]);
    Ok(Decoded::Frame(RespValue::Bulk(Some(data)), end + 2))
}

fn decode_array(buf: &[u8], len: i64, header_len: usize, depth: usize) -> BackendResult<Decoded> {
    if len <= 0 {
        return Ok(Decoded::Frame(RespValue::Array(Vec::new()), header_len));
    }

    let mut consumed = header_len;
    let mut items = Vec::with_capacity(len.min(1024) as usize);
    for _ in 0..len {
        match decode_value(&buf[consumed..], depth + 1)? {
            Decoded::Frame(item, used) => {
                items.push(item);
                consumed += used;
            }
            Decoded::Incomplete(needed) => return Ok(Decoded::Incomplete(consumed + needed)),
        }
    }
    Ok(Decoded::Frame(RespValue::Array(items), consumed))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

fn parse_i64(data: &[u8]) -> BackendResult<i64> {
    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        Some(_) => (false, data),
        None => return Err(BackendError::Protocol),
    };
    if digits.is_empty() {
        return Err(BackendError::Protocol);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(BackendError::Protocol);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as i64))
            .ok_or(BackendError::Protocol)?;
    }

    Ok(if negative { -value } else { value })
}

fn put_decimal(out: &mut BytesMut, mut value: usize) {
    // Digits are produced least-significant first into a stack buffer.
    let mut digits = [0u8; 20];
    let mut start = digits.len();
    loop {
        start -= 1;
        digits[start] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    out.put_slice(&digits[start..]);
}

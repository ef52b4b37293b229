//! Primitive encoders and decoders for the batch protocol.
//!
//! Unsigned integers are LEB128, signed ones zigzag LEB128. Byte strings are
//! length-prefixed. Every reader fails with [`AgentError::Protocol`] on
//! malformed input and with [`AgentError::Io`] on a short read.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::codes::ControlCode;
use crate::utils::errors::{AgentError, Result};

/// Upper bound for any length-prefixed field (paths, link targets, messages, tokens).
pub const MAX_FIELD_LEN: u64 = 1 << 20;

/// A LEB128 u64 never needs more than ten bytes.
const MAX_VARINT_BYTES: usize = 10;

pub fn encode_uvarint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn encode_varint(value: i64, out: &mut Vec<u8>) {
    encode_uvarint(((value << 1) ^ (value >> 63)) as u64, out);
}

pub async fn write_uvarint<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, value: u64) -> Result<()> {
    let mut buf = Vec::with_capacity(MAX_VARINT_BYTES);
    encode_uvarint(value, &mut buf);
    w.write_all(&buf).await?;
    Ok(())
}

pub async fn write_varint<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, value: i64) -> Result<()> {
    let mut buf = Vec::with_capacity(MAX_VARINT_BYTES);
    encode_varint(value, &mut buf);
    w.write_all(&buf).await?;
    Ok(())
}

pub async fn read_uvarint<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<u64> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_BYTES {
        let byte = r.read_u8().await?;
        let bits = u64::from(byte & 0x7f);
        // The tenth byte may only carry the top bit of a u64.
        if i == MAX_VARINT_BYTES - 1 && bits > 1 {
            return Err(AgentError::Protocol("varint overflows 64 bits".into()));
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(AgentError::Protocol("varint longer than 10 bytes".into()))
}

pub async fn read_varint<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<i64> {
    let raw = read_uvarint(r).await?;
    Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
}

pub async fn write_bool<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, value: bool) -> Result<()> {
    w.write_u8(u8::from(value)).await?;
    Ok(())
}

/// Only `0` and `1` are booleans on the wire.
pub async fn read_bool<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<bool> {
    match r.read_u8().await? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(AgentError::Protocol(format!("invalid boolean byte 0x{:02x}", other))),
    }
}

pub async fn write_bytes<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, bytes: &[u8]) -> Result<()> {
    write_uvarint(w, bytes.len() as u64).await?;
    w.write_all(bytes).await?;
    Ok(())
}

pub async fn read_bytes<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_uvarint(r).await?;
    if len > MAX_FIELD_LEN {
        return Err(AgentError::Protocol(format!(
            "field length {} exceeds limit of {} bytes",
            len, MAX_FIELD_LEN
        )));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_str<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, value: &str) -> Result<()> {
    write_bytes(w, value.as_bytes()).await
}

pub async fn read_str<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<String> {
    let bytes = read_bytes(r).await?;
    String::from_utf8(bytes).map_err(|_| AgentError::Protocol("string is not valid UTF-8".into()))
}

pub async fn write_control<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, code: ControlCode) -> Result<()> {
    w.write_u8(code.to_byte()).await?;
    Ok(())
}

pub async fn read_control<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<ControlCode> {
    ControlCode::from_byte(r.read_u8().await?)
}

/// Report a failure to the peer, choosing the status code from the error kind.
pub async fn write_error<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, err: &AgentError) -> Result<()> {
    let code = match err {
        AgentError::Validation(_) | AgentError::Unauthorized(_) | AgentError::Protocol(_) => {
            ControlCode::ValidationError
        }
        _ => ControlCode::IoError,
    };
    write_control(w, code).await?;
    write_str(w, &err.to_string()).await?;
    w.flush().await?;
    Ok(())
}

/// Read a status reply and require it to be `expected`.
///
/// Error codes carry a message and become [`AgentError::Remote`] or
/// [`AgentError::Validation`]; any other code is a protocol violation.
pub async fn expect_reply<R: AsyncRead + Unpin + ?Sized>(r: &mut R, expected: ControlCode) -> Result<()> {
    match read_control(r).await? {
        code if code == expected => Ok(()),
        ControlCode::IoError => Err(AgentError::Remote(read_str(r).await?)),
        ControlCode::ValidationError => Err(AgentError::Validation(read_str(r).await?)),
        other => Err(AgentError::Protocol(format!(
            "expected {:?}, peer sent {:?}",
            expected, other
        ))),
    }
}

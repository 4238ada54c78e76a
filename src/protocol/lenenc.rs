//! Length-encoded integers and strings

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ProtocolError;

/// Marker byte for a NULL column value in a text row
pub const NULL_MARKER: u8 = 0xFB;

/// Encode a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xFD);
        buf.put_u8((value & 0xFF) as u8);
        buf.put_u8(((value >> 8) & 0xFF) as u8);
        buf.put_u8(((value >> 16) & 0xFF) as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Encode a length-encoded string
pub fn put_lenenc_bytes(buf: &mut BytesMut, value: &[u8]) {
    put_lenenc_int(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// Read a length-encoded integer, advancing the cursor
pub fn get_lenenc_int(buf: &mut Bytes) -> Result<u64, ProtocolError> {
    let first = get_u8(buf)?;
    match first {
        0x00..=0xFA => Ok(first as u64),
        0xFC => {
            ensure(buf, 2)?;
            Ok(buf.get_u16_le() as u64)
        }
        0xFD => {
            ensure(buf, 3)?;
            let lo = buf.get_u16_le() as u64;
            let hi = buf.get_u8() as u64;
            Ok(lo | (hi << 16))
        }
        0xFE => {
            ensure(buf, 8)?;
            Ok(buf.get_u64_le())
        }
        other => Err(ProtocolError::Malformed(format!(
            "invalid length-encoded integer prefix 0x{other:02X}"
        ))),
    }
}

/// Read a length-encoded string, advancing the cursor
pub fn get_lenenc_bytes(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = get_lenenc_int(buf)? as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

/// Read a text-row column: `None` for NULL, otherwise the raw value
pub fn get_lenenc_value(buf: &mut Bytes) -> Result<Option<Bytes>, ProtocolError> {
    if buf.first() == Some(&NULL_MARKER) {
        buf.advance(1);
        return Ok(None);
    }
    get_lenenc_bytes(buf).map(Some)
}

pub(crate) fn get_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn ensure(buf: &Bytes, len: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated {
            needed: len,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

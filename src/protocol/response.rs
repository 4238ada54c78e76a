use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::lenenc::{ensure, get_lenenc_int, get_u8, put_lenenc_int};
use super::packet::{capabilities::CLIENT_PROTOCOL_41, status, Packet};
use super::ProtocolError;

pub const OK_HEADER: u8 = 0x00;
pub const EOF_HEADER: u8 = 0xFE;
pub const ERR_HEADER: u8 = 0xFF;
pub const LOCAL_INFILE_HEADER: u8 = 0xFB;

/// Error codes emitted by the proxy itself
pub mod error_code {
    /// Backend connection closed while serving a statement
    pub const ER_ERROR_ON_CLOSE: u16 = 1023;
    /// Unexpected data from a backend
    pub const ER_HANDLE_DATA: u16 = 3002;
    /// A backend connection could not be obtained for a node
    pub const ER_DB_INSTANCE_ABORTING_CONNECTION: u16 = 3009;
}

/// OK packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub message: Option<Bytes>,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: status::SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
            message: None,
        }
    }

    /// Parse from packet payload (protocol 4.1 layout)
    pub fn parse(payload: &Bytes) -> Result<Self, ProtocolError> {
        let mut buf = payload.clone();
        let header = get_u8(&mut buf)?;
        if header != OK_HEADER && header != EOF_HEADER {
            return Err(ProtocolError::UnexpectedHeader {
                expected: "OK",
                found: header,
            });
        }

        let affected_rows = get_lenenc_int(&mut buf)?;
        let last_insert_id = get_lenenc_int(&mut buf)?;
        ensure(&buf, 4)?;
        let status_flags = buf.get_u16_le();
        let warnings = buf.get_u16_le();
        let message = if buf.is_empty() { None } else { Some(buf) };

        Ok(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            message,
        })
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(OK_HEADER);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        }
        if let Some(ref message) = self.message {
            buf.extend_from_slice(message);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

impl Default for OkPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(ERR_HEADER);
        buf.put_u16_le(self.error_code);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.extend_from_slice(self.sql_state.as_bytes());
        }

        buf.extend_from_slice(self.error_message.as_bytes());

        Packet::new(sequence_id, buf.freeze())
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.is_empty() || payload[0] != ERR_HEADER {
            return None;
        }

        let mut buf = &payload[1..];
        if buf.len() < 2 {
            return None;
        }

        let error_code = buf.get_u16_le();

        let (sql_state, error_message) = if !buf.is_empty() && buf[0] == b'#' && buf.len() >= 6 {
            let sql_state = String::from_utf8_lossy(&buf[1..6]).to_string();
            (sql_state, String::from_utf8_lossy(&buf[6..]).to_string())
        } else {
            ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
        };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

/// EOF packet (pre-DEPRECATE_EOF protocol)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.first() != Some(&EOF_HEADER) {
            return Err(ProtocolError::UnexpectedHeader {
                expected: "EOF",
                found: payload.first().copied().unwrap_or(0),
            });
        }
        // Pre-4.1 EOF packets carry no status
        if payload.len() < 5 {
            return Ok(Self {
                warnings: 0,
                status_flags: 0,
            });
        }
        let mut buf = &payload[1..];
        Ok(Self {
            warnings: buf.get_u16_le(),
            status_flags: buf.get_u16_le(),
        })
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(EOF_HEADER);
        buf.put_u16_le(self.warnings);
        buf.put_u16_le(self.status_flags);
        Packet::new(sequence_id, buf.freeze())
    }
}

/// Check if payload is an OK packet
pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_HEADER)
}

/// Check if payload is an ERR packet
pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_HEADER)
}

/// Check if payload is an EOF packet
pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_HEADER) && payload.len() < 9
}

pub mod codec;
pub mod field;
pub mod handshake;
pub mod lenenc;
pub mod packet;
pub mod response;
pub mod row;

pub use codec::PacketCodec;
pub use field::{column_type, FieldPacket};
pub use handshake::{compute_auth_response, HandshakeResponse, InitialHandshake};
pub use packet::{capabilities, status, Command, Packet, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};
pub use response::{
    error_code, is_eof_packet, is_err_packet, is_ok_packet, EofPacket, ErrPacket, OkPacket,
};
pub use row::{BinaryRowDataPacket, RowDataPacket};

/// Wire decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("truncated packet: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("expected {expected} packet, found header 0x{found:02X}")]
    UnexpectedHeader { expected: &'static str, found: u8 },
}

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload size (16MB - 1)
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL wire protocol packet
///
/// `payload` is the logical payload. When it is longer than
/// [`MAX_PACKET_SIZE`] it travels as several physical packets, see
/// [`Packet::encode_split`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Total bytes this packet occupies on the wire as a single frame
    pub fn wire_len(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    /// First payload byte (packet type marker), if any
    pub fn marker(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Encode packet to bytes (header + payload) as one frame
    pub fn encode(&self, dst: &mut BytesMut) {
        put_header(dst, self.payload.len(), self.sequence_id);
        dst.extend_from_slice(&self.payload);
    }

    /// Encode into a freshly allocated buffer
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode(&mut buf);
        buf
    }

    /// Encode a payload of any size, splitting it into physical packets.
    ///
    /// The first frame carries `sequence_id`, each following frame the next
    /// sequence byte. A payload that is an exact multiple of
    /// [`MAX_PACKET_SIZE`] is terminated by an empty frame. Returns the
    /// sequence id of the last frame written.
    pub fn encode_split(&self, dst: &mut BytesMut) -> u8 {
        let mut seq = self.sequence_id;
        let mut rest = &self.payload[..];
        loop {
            let chunk = rest.len().min(MAX_PACKET_SIZE);
            put_header(dst, chunk, seq);
            dst.extend_from_slice(&rest[..chunk]);
            rest = &rest[chunk..];
            if chunk < MAX_PACKET_SIZE {
                return seq;
            }
            seq = seq.wrapping_add(1);
        }
    }

    /// Try to decode one physical packet from bytes, returns None if not enough data
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        let len = src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);

        let total_len = PACKET_HEADER_SIZE + len;
        if src.len() < total_len {
            return None;
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }
}

fn put_header(dst: &mut BytesMut, len: usize, sequence_id: u8) {
    dst.put_u8((len & 0xFF) as u8);
    dst.put_u8(((len >> 8) & 0xFF) as u8);
    dst.put_u8(((len >> 16) & 0xFF) as u8);
    dst.put_u8(sequence_id);
}

/// MySQL capability flags
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities requested from backends.
    ///
    /// CLIENT_DEPRECATE_EOF is left out: the response reader relies on the
    /// EOF marker after column definitions and after the last row.
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_LOCAL_FILES
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH;
}

/// Server status flags carried by OK and EOF packets
pub mod status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
}

/// MySQL command bytes used towards backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    Ping = 0x0e,
}

impl Command {
    /// Build a command packet (sequence 0) carrying `arg`
    pub fn packet(self, arg: &[u8]) -> Packet {
        let mut payload = BytesMut::with_capacity(arg.len() + 1);
        payload.put_u8(self as u8);
        payload.extend_from_slice(arg);
        Packet::new(0, payload.freeze())
    }
}

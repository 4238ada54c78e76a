//! Column definition packets

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::lenenc::{ensure, get_lenenc_bytes, get_lenenc_int, put_lenenc_bytes};
use super::packet::Packet;
use super::ProtocolError;

/// Column type codes
#[allow(dead_code)]
pub mod column_type {
    pub const DECIMAL: u8 = 0x00;
    pub const TINY: u8 = 0x01;
    pub const SHORT: u8 = 0x02;
    pub const LONG: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const DOUBLE: u8 = 0x05;
    pub const NULL: u8 = 0x06;
    pub const TIMESTAMP: u8 = 0x07;
    pub const LONGLONG: u8 = 0x08;
    pub const INT24: u8 = 0x09;
    pub const DATE: u8 = 0x0a;
    pub const TIME: u8 = 0x0b;
    pub const DATETIME: u8 = 0x0c;
    pub const YEAR: u8 = 0x0d;
    pub const VARCHAR: u8 = 0x0f;
    pub const NEWDECIMAL: u8 = 0xf6;
    pub const BLOB: u8 = 0xfc;
    pub const VAR_STRING: u8 = 0xfd;
    pub const STRING: u8 = 0xfe;
}

/// Column flag: numeric column is unsigned
pub const UNSIGNED_FLAG: u16 = 0x0020;

/// Column definition (protocol 4.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPacket {
    pub catalog: Bytes,
    pub db: Bytes,
    pub table: Bytes,
    pub org_table: Bytes,
    pub name: Bytes,
    pub org_name: Bytes,
    pub charset: u16,
    pub length: u32,
    pub column_type: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl FieldPacket {
    /// Column with default metadata, mostly for building result sets by hand
    pub fn new(name: &str, column_type: u8) -> Self {
        Self {
            catalog: Bytes::from_static(b"def"),
            db: Bytes::new(),
            table: Bytes::new(),
            org_table: Bytes::new(),
            name: Bytes::copy_from_slice(name.as_bytes()),
            org_name: Bytes::copy_from_slice(name.as_bytes()),
            charset: 0x21,
            length: 255,
            column_type,
            flags: 0,
            decimals: 0,
        }
    }

    pub fn parse(payload: &Bytes) -> Result<Self, ProtocolError> {
        let mut buf = payload.clone();

        let catalog = get_lenenc_bytes(&mut buf)?;
        let db = get_lenenc_bytes(&mut buf)?;
        let table = get_lenenc_bytes(&mut buf)?;
        let org_table = get_lenenc_bytes(&mut buf)?;
        let name = get_lenenc_bytes(&mut buf)?;
        let org_name = get_lenenc_bytes(&mut buf)?;

        // Length of the fixed-size block, always 0x0c
        let fixed = get_lenenc_int(&mut buf)? as usize;
        ensure(&buf, fixed.max(12))?;

        let charset = buf.get_u16_le();
        let length = buf.get_u32_le();
        let column_type = buf.get_u8();
        let flags = buf.get_u16_le();
        let decimals = buf.get_u8();

        Ok(Self {
            catalog,
            db,
            table,
            org_table,
            name,
            org_name,
            charset,
            length,
            column_type,
            flags,
            decimals,
        })
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::with_capacity(
            self.catalog.len()
                + self.db.len()
                + self.table.len()
                + self.org_table.len()
                + self.name.len()
                + self.org_name.len()
                + 19,
        );

        put_lenenc_bytes(&mut buf, &self.catalog);
        put_lenenc_bytes(&mut buf, &self.db);
        put_lenenc_bytes(&mut buf, &self.table);
        put_lenenc_bytes(&mut buf, &self.org_table);
        put_lenenc_bytes(&mut buf, &self.name);
        put_lenenc_bytes(&mut buf, &self.org_name);
        buf.put_u8(0x0c);
        buf.put_u16_le(self.charset);
        buf.put_u32_le(self.length);
        buf.put_u8(self.column_type);
        buf.put_u16_le(self.flags);
        buf.put_u8(self.decimals);
        buf.put_u16_le(0);

        Packet::new(sequence_id, buf.freeze())
    }

    pub fn set_db(&mut self, db: &str) {
        self.db = Bytes::copy_from_slice(db.as_bytes());
    }

    pub fn set_table(&mut self, table: &str) {
        self.table = Bytes::copy_from_slice(table.as_bytes());
    }

    pub fn set_org_table(&mut self, org_table: &str) {
        self.org_table = Bytes::copy_from_slice(org_table.as_bytes());
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags & UNSIGNED_FLAG != 0
    }
}

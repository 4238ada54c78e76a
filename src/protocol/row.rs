//! Result set rows in text and binary protocol

use bytes::{BufMut, Bytes, BytesMut};

use super::field::{column_type, FieldPacket};
use super::lenenc::{get_lenenc_value, put_lenenc_bytes, NULL_MARKER};
use super::packet::Packet;
use super::ProtocolError;

/// Text protocol row: one optional value per column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDataPacket {
    pub values: Vec<Option<Bytes>>,
}

impl RowDataPacket {
    pub fn parse(payload: &Bytes, field_count: usize) -> Result<Self, ProtocolError> {
        let mut buf = payload.clone();
        let mut values = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            values.push(get_lenenc_value(&mut buf)?);
        }
        Ok(Self { values })
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();
        for value in &self.values {
            match value {
                Some(v) => put_lenenc_bytes(&mut buf, v),
                None => buf.put_u8(NULL_MARKER),
            }
        }
        Packet::new(sequence_id, buf.freeze())
    }
}

/// Binary protocol row, as sent for prepared statement results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRowDataPacket {
    null_bitmap: Vec<u8>,
    values: BytesMut,
}

/// Null bitmap bit offset for result set rows
const NULL_BITMAP_OFFSET: usize = 2;

impl BinaryRowDataPacket {
    /// Re-encode a text row with the column types captured from the field packets
    pub fn from_text(fields: &[FieldPacket], row: &RowDataPacket) -> Self {
        let count = row.values.len();
        let mut null_bitmap = vec![0u8; (count + 7 + NULL_BITMAP_OFFSET) / 8];
        let mut values = BytesMut::new();

        for (i, value) in row.values.iter().enumerate() {
            let Some(value) = value else {
                let bit = i + NULL_BITMAP_OFFSET;
                null_bitmap[bit / 8] |= 1 << (bit % 8);
                continue;
            };
            let ty = fields.get(i).map_or(column_type::VAR_STRING, |f| f.column_type);
            put_binary_value(&mut values, ty, value);
        }

        Self {
            null_bitmap,
            values,
        }
    }

    pub fn is_null(&self, column: usize) -> bool {
        let bit = column + NULL_BITMAP_OFFSET;
        self.null_bitmap
            .get(bit / 8)
            .is_some_and(|b| b & (1 << (bit % 8)) != 0)
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::with_capacity(1 + self.null_bitmap.len() + self.values.len());
        buf.put_u8(0x00);
        buf.extend_from_slice(&self.null_bitmap);
        buf.extend_from_slice(&self.values);
        Packet::new(sequence_id, buf.freeze())
    }
}

fn put_binary_value(buf: &mut BytesMut, ty: u8, text: &[u8]) {
    let s = std::str::from_utf8(text).unwrap_or("").trim();
    match ty {
        column_type::TINY => buf.put_u8(parse_int(s) as u8),
        column_type::SHORT | column_type::YEAR => buf.put_u16_le(parse_int(s) as u16),
        column_type::LONG | column_type::INT24 => buf.put_u32_le(parse_int(s) as u32),
        column_type::LONGLONG => buf.put_u64_le(parse_int(s) as u64),
        column_type::FLOAT => buf.put_f32_le(s.parse().unwrap_or(0.0)),
        column_type::DOUBLE => buf.put_f64_le(s.parse().unwrap_or(0.0)),
        column_type::DATE | column_type::DATETIME | column_type::TIMESTAMP => {
            put_datetime(buf, s)
        }
        column_type::TIME => put_time(buf, s),
        _ => put_lenenc_bytes(buf, text),
    }
}

/// Integer text as a two's complement bit pattern; unsigned values above
/// `i64::MAX` keep their bits. Unparseable text encodes as zero.
fn parse_int(s: &str) -> i64 {
    s.parse::<i64>()
        .or_else(|_| s.parse::<u64>().map(|v| v as i64))
        .unwrap_or(0)
}

/// `YYYY-MM-DD[ HH:MM:SS[.ffffff]]`
fn put_datetime(buf: &mut BytesMut, s: &str) {
    let (date, time) = s.split_once(' ').unwrap_or((s, ""));
    let mut d = date.splitn(3, '-').map(|p| p.parse::<u32>().unwrap_or(0));
    let (year, month, day) = (
        d.next().unwrap_or(0),
        d.next().unwrap_or(0),
        d.next().unwrap_or(0),
    );
    let (hour, minute, second, micros) = parse_clock(time);

    if year == 0 && month == 0 && day == 0 && hour == 0 && minute == 0 && second == 0 && micros == 0 {
        buf.put_u8(0);
        return;
    }

    let len: u8 = if micros != 0 {
        11
    } else if hour != 0 || minute != 0 || second != 0 {
        7
    } else {
        4
    };
    buf.put_u8(len);
    buf.put_u16_le(year as u16);
    buf.put_u8(month as u8);
    buf.put_u8(day as u8);
    if len >= 7 {
        buf.put_u8(hour as u8);
        buf.put_u8(minute as u8);
        buf.put_u8(second as u8);
    }
    if len == 11 {
        buf.put_u32_le(micros);
    }
}

/// `[-]HHH:MM:SS[.ffffff]`, hours past 24 roll into days
fn put_time(buf: &mut BytesMut, s: &str) {
    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (hours, minute, second, micros) = parse_clock(rest);

    if hours == 0 && minute == 0 && second == 0 && micros == 0 {
        buf.put_u8(0);
        return;
    }

    buf.put_u8(if micros != 0 { 12 } else { 8 });
    buf.put_u8(negative as u8);
    buf.put_u32_le(hours / 24);
    buf.put_u8((hours % 24) as u8);
    buf.put_u8(minute as u8);
    buf.put_u8(second as u8);
    if micros != 0 {
        buf.put_u32_le(micros);
    }
}

fn parse_clock(s: &str) -> (u32, u32, u32, u32) {
    if s.is_empty() {
        return (0, 0, 0, 0);
    }
    let (clock, fraction) = s.split_once('.').unwrap_or((s, ""));
    let mut parts = clock.splitn(3, ':').map(|p| p.parse::<u32>().unwrap_or(0));
    let hour = parts.next().unwrap_or(0);
    let minute = parts.next().unwrap_or(0);
    let second = parts.next().unwrap_or(0);

    // Scale the fraction to microseconds
    let digits: String = fraction.chars().take(6).collect();
    let micros = if digits.is_empty() {
        0
    } else {
        digits.parse::<u32>().unwrap_or(0) * 10u32.pow(6 - digits.len() as u32)
    };
    (hour, minute, second, micros)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_row(values: &[Option<&str>]) -> RowDataPacket {
        RowDataPacket {
            values: values
                .iter()
                .map(|v| v.map(|s| Bytes::copy_from_slice(s.as_bytes())))
                .collect(),
        }
    }

    #[test]
    fn test_text_row_with_null() {
        let row = text_row(&[Some("1"), None, Some("abc")]);
        let packet = row.encode(4);
        assert_eq!(&packet.payload[..], &[1, b'1', 0xFB, 3, b'a', b'b', b'c']);
        assert_eq!(RowDataPacket::parse(&packet.payload, 3).unwrap(), row);
    }

    #[test]
    fn test_binary_integers_and_null_bitmap() {
        let fields = vec![
            FieldPacket::new("a", column_type::TINY),
            FieldPacket::new("b", column_type::LONG),
            FieldPacket::new("c", column_type::LONGLONG),
            FieldPacket::new("d", column_type::VAR_STRING),
        ];
        let row = text_row(&[Some("-1"), None, Some("18446744073709551615"), Some("hi")]);
        let bin = BinaryRowDataPacket::from_text(&fields, &row);
        assert!(bin.is_null(1));
        assert!(!bin.is_null(0));

        let payload = bin.encode(5).payload;
        // header, one bitmap byte, tiny, longlong, lenenc string
        assert_eq!(payload[0], 0x00);
        assert_eq!(payload[1], 0b0000_1000);
        assert_eq!(payload[2], 0xFF);
        assert_eq!(&payload[3..11], &[0xFF; 8]);
        assert_eq!(&payload[11..], &[2, b'h', b'i']);
    }

    #[test]
    fn test_binary_datetime_lengths() {
        let fields = vec![FieldPacket::new("t", column_type::DATETIME)];
        let cases = [
            ("0000-00-00 00:00:00", 0u8),
            ("2024-02-29", 4),
            ("2024-02-29 13:45:01", 7),
            ("2024-02-29 13:45:01.5", 11),
        ];
        for (text, len) in cases {
            let bin = BinaryRowDataPacket::from_text(&fields, &text_row(&[Some(text)]));
            let payload = bin.encode(1).payload;
            assert_eq!(payload[2], len, "{text}");
            assert_eq!(payload.len(), 3 + len as usize);
        }

        let bin = BinaryRowDataPacket::from_text(&fields, &text_row(&[Some("2024-02-29 13:45:01.5")]));
        let payload = bin.encode(1).payload;
        assert_eq!(&payload[3..5], &2024u16.to_le_bytes());
        assert_eq!(&payload[10..14], &500_000u32.to_le_bytes());
    }

    #[test]
    fn test_binary_time_rolls_days() {
        let fields = vec![FieldPacket::new("t", column_type::TIME)];
        let bin = BinaryRowDataPacket::from_text(&fields, &text_row(&[Some("-49:30:00")]));
        let payload = bin.encode(1).payload;
        assert_eq!(payload[2], 8);
        assert_eq!(payload[3], 1);
        assert_eq!(&payload[4..8], &2u32.to_le_bytes());
        assert_eq!(&payload[8..11], &[1, 30, 0]);
    }

    #[test]
    fn test_binary_double() {
        let fields = vec![FieldPacket::new("x", column_type::DOUBLE)];
        let bin = BinaryRowDataPacket::from_text(&fields, &text_row(&[Some("2.5")]));
        assert_eq!(&bin.encode(1).payload[2..], &2.5f64.to_le_bytes());
    }
}

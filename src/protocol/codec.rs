use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{Packet, MAX_PACKET_SIZE};

/// MySQL packet codec for use with tokio Framed
///
/// Decoding joins payloads that the peer split across several physical
/// packets, so every item is one logical packet. Encoding splits oversized
/// payloads again.
#[derive(Debug, Default)]
pub struct PacketCodec {
    /// Continuation of a payload split across physical packets
    partial: Option<Packet>,
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(frame) = Packet::decode(src) else {
                return Ok(None);
            };
            let continues = frame.payload.len() == MAX_PACKET_SIZE;

            let logical = match self.partial.take() {
                Some(mut head) => {
                    let mut joined = BytesMut::from(&head.payload[..]);
                    joined.extend_from_slice(&frame.payload);
                    head.payload = joined.freeze();
                    head
                }
                None => frame,
            };

            if continues {
                self.partial = Some(logical);
                continue;
            }
            return Ok(Some(logical));
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_split(dst);
        Ok(())
    }
}

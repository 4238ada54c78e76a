use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::backend::BackendConnection;
use crate::protocol::Packet;

/// Default size of one file content packet sent to a backend
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Client file content buffered for a LOAD DATA LOCAL statement
#[derive(Debug, Clone)]
pub struct LoadDataContext {
    /// Sequence id of the last packet the client sent for this command
    pub last_packet_id: u8,
    data: Bytes,
    chunk_size: usize,
}

impl LoadDataContext {
    pub fn new(last_packet_id: u8, data: impl Into<Bytes>) -> Self {
        Self {
            last_packet_id,
            data: data.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Answer the backend's file request: the content in chunks, each with
    /// the next sequence id after `request`, then an empty packet
    pub fn stream_to(&self, request: &Packet, conn: &Arc<dyn BackendConnection>) {
        let mut seq = request.sequence_id;
        let mut packets = 0usize;
        let mut offset = 0;
        while offset < self.data.len() {
            let end = (offset + self.chunk_size).min(self.data.len());
            seq = seq.wrapping_add(1);
            conn.write_packet(Packet::new(seq, self.data.slice(offset..end)));
            offset = end;
            packets += 1;
        }
        conn.write_packet(Packet::new(seq.wrapping_add(1), Bytes::new()));
        debug!(conn_id = conn.id(), bytes = self.data.len(), packets, "Streamed load data file");
    }
}

/// No buffered file: tell the backend with a lone empty packet
pub fn reject_file_request(request: &Packet, conn: &Arc<dyn BackendConnection>) {
    conn.write_packet(Packet::new(request.sequence_id.wrapping_add(1), Bytes::new()));
}

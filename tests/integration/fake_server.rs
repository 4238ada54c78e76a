//! Scripted MySQL server speaking just enough protocol for the backend path

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use strata::protocol::field::column_type;
use strata::protocol::{
    capabilities, EofPacket, ErrPacket, FieldPacket, InitialHandshake, OkPacket, Packet,
    PacketCodec, RowDataPacket,
};

const COM_QUIT: u8 = 0x01;
const COM_QUERY: u8 = 0x03;

enum Reply {
    Packets(Vec<Packet>),
    /// Send, then drop the connection
    PacketsThenClose(Vec<Packet>),
}

pub struct FakeMySql {
    pub addr: SocketAddr,
    queries: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicU32>,
}

impl FakeMySql {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let queries = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicU32::new(0));

        let log = queries.clone();
        let accepted = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let thread_id = 100 + accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, thread_id, log.clone()));
            }
        });

        Self {
            addr,
            queries,
            connections,
        }
    }

    /// Every COM_QUERY received, across connections
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve(stream: TcpStream, thread_id: u32, log: Arc<Mutex<Vec<String>>>) {
    let mut framed = Framed::new(stream, PacketCodec::default());
    let handshake = InitialHandshake::new("8.0.36-scripted", thread_id, [7u8; 20]);
    if framed.send(handshake.encode()).await.is_err() {
        return;
    }
    let Some(Ok(response)) = framed.next().await else {
        return;
    };
    let ok = OkPacket::new().encode(response.sequence_id + 1, capabilities::DEFAULT_CAPABILITIES);
    if framed.send(ok).await.is_err() {
        return;
    }

    while let Some(Ok(packet)) = framed.next().await {
        let reply = match packet.payload.first() {
            Some(&COM_QUIT) => return,
            Some(&COM_QUERY) => {
                let sql = String::from_utf8_lossy(&packet.payload[1..]).to_string();
                log.lock().push(sql.clone());
                reply_to(&sql)
            }
            _ => Reply::Packets(vec![err(1, 1047, "Unknown command")]),
        };
        let (packets, close) = match reply {
            Reply::Packets(p) => (p, false),
            Reply::PacketsThenClose(p) => (p, true),
        };
        for p in packets {
            if framed.feed(p).await.is_err() {
                return;
            }
        }
        if framed.flush().await.is_err() || close {
            return;
        }
    }
}

fn reply_to(sql: &str) -> Reply {
    let upper = sql.to_ascii_uppercase();
    if upper.starts_with("SET ") {
        return Reply::Packets(vec![ok(1, 0, 0)]);
    }
    if upper.starts_with("INSERT") {
        return Reply::Packets(vec![ok(1, 1, 7)]);
    }
    if upper.starts_with("UPDATE") || upper.starts_with("DELETE") {
        return Reply::Packets(vec![ok(1, 2, 0)]);
    }
    match sql {
        "SELECT id, name FROM users" => Reply::Packets(users(&[("1", "alice"), ("2", "bob")])),
        "SELECT half" => {
            let mut packets = users(&[("1", "alice")]);
            // Drop the trailing EOF: the connection dies mid result set
            packets.pop();
            Reply::PacketsThenClose(packets)
        }
        _ => Reply::Packets(vec![err(1, 1146, "Table 'db0.missing' doesn't exist")]),
    }
}

fn users(rows: &[(&str, &str)]) -> Vec<Packet> {
    let mut seq = 1u8;
    let mut packets = vec![Packet::new(seq, vec![2u8])];
    for field in [
        FieldPacket::new("id", column_type::LONGLONG),
        FieldPacket::new("name", column_type::VAR_STRING),
    ] {
        seq += 1;
        packets.push(field.encode(seq));
    }
    seq += 1;
    packets.push(eof(seq));
    for (id, name) in rows {
        seq += 1;
        let row = RowDataPacket {
            values: vec![Some(id.as_bytes().to_vec().into()), Some(name.as_bytes().to_vec().into())],
        };
        packets.push(row.encode(seq));
    }
    seq += 1;
    packets.push(eof(seq));
    packets
}

fn ok(seq: u8, affected_rows: u64, last_insert_id: u64) -> Packet {
    OkPacket {
        affected_rows,
        last_insert_id,
        ..OkPacket::new()
    }
    .encode(seq, capabilities::DEFAULT_CAPABILITIES)
}

fn eof(seq: u8) -> Packet {
    EofPacket {
        warnings: 0,
        status_flags: 0x0002,
    }
    .encode(seq)
}

fn err(seq: u8, code: u16, message: &str) -> Packet {
    ErrPacket::new(code, "42S02", message).encode(seq, capabilities::DEFAULT_CAPABILITIES)
}

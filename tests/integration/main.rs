//! Integration test entry point
//!
//! The scripted tests always run against an in-process fake MySQL server.
//! Live tests need a real server:
//!
//! Run with: STRATA_RUN_INTEGRATION_TESTS=1 cargo test --test integration
//!
//! Environment variables:
//! - STRATA_RUN_INTEGRATION_TESTS: Set to "1" to enable live tests
//! - STRATA_TEST_MYSQL_HOST: MySQL host (default: 127.0.0.1)
//! - STRATA_TEST_MYSQL_PORT: MySQL port (default: 3306)
//! - STRATA_TEST_MYSQL_USER: MySQL user (default: root)
//! - STRATA_TEST_MYSQL_PASS: MySQL password (default: empty)
//! - STRATA_TEST_MYSQL_DB: Database (default: test)

mod fake_server;
mod live;
mod scripted;

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::DuplexStream;
use tokio_util::codec::FramedRead;

use strata::backend::{ResponseEvent, ResponseReader};
use strata::config::{BackendConfig, Config, ShardingNodeConfig};
use strata::flow::FlowControlConfig;
use strata::frontend::ClientWriter;
use strata::pool::NodeRegistry;
use strata::protocol::{status, EofPacket, OkPacket, Packet, PacketCodec};
use strata::session::{ClientState, ProxyContext, Session};

/// Check if live integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("STRATA_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip test if live integration tests are not enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !crate::should_run_integration_tests() {
            eprintln!("Skipping integration test (set STRATA_RUN_INTEGRATION_TESTS=1 to run)");
            return;
        }
    };
}

/// Live MySQL backend from environment
pub fn get_mysql_config() -> (BackendConfig, String) {
    let backend = BackendConfig {
        host: env::var("STRATA_TEST_MYSQL_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("STRATA_TEST_MYSQL_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3306),
        user: env::var("STRATA_TEST_MYSQL_USER").unwrap_or_else(|_| "root".to_string()),
        password: env::var("STRATA_TEST_MYSQL_PASS").unwrap_or_default(),
    };
    let database = env::var("STRATA_TEST_MYSQL_DB").unwrap_or_else(|_| "test".to_string());
    (backend, database)
}

pub fn node_config(name: &str, addr: SocketAddr) -> ShardingNodeConfig {
    ShardingNodeConfig {
        name: name.to_string(),
        database: "db0".to_string(),
        master: BackendConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            user: "root".to_string(),
            password: "secret".to_string(),
        },
        slaves: vec![],
    }
}

pub fn registry(nodes: Vec<ShardingNodeConfig>) -> Arc<NodeRegistry> {
    let config = Config {
        nodes,
        ..Config::default()
    };
    Arc::new(NodeRegistry::from_config(&config))
}

/// A session whose client side can be read back as packets
pub struct TestClient {
    pub session: Arc<Session>,
    frames: FramedRead<DuplexStream, PacketCodec>,
}

impl TestClient {
    pub fn new(registry: Arc<NodeRegistry>, state: ClientState) -> Self {
        let (client_side, proxy_side) = tokio::io::duplex(64 * 1024);
        let writer = ClientWriter::spawn(proxy_side, 16 * 1024, FlowControlConfig::disabled());
        let context = ProxyContext {
            provider: registry,
            flow_control: FlowControlConfig::disabled(),
            statistics: None,
        };
        Self {
            session: Session::new(1, writer, context, state),
            frames: FramedRead::new(client_side, PacketCodec::default()),
        }
    }

    /// Read one complete response (all result sets of a multi result)
    pub async fn read_response(&mut self) -> Vec<Packet> {
        tokio::time::timeout(Duration::from_secs(5), self.read_until_complete())
            .await
            .expect("response timed out")
    }

    async fn read_until_complete(&mut self) -> Vec<Packet> {
        let mut reader = ResponseReader::new();
        let mut packets = Vec::new();
        while let Some(packet) = self.frames.next().await {
            let packet = packet.expect("client stream");
            packets.push(packet.clone());
            let more = match reader.feed(packet).expect("well-formed response") {
                Some(ResponseEvent::Ok(ok)) => {
                    let ok = OkPacket::parse(&ok.payload).expect("OK packet");
                    ok.status_flags & status::SERVER_MORE_RESULTS_EXISTS != 0
                }
                Some(ResponseEvent::Error(_)) => false,
                Some(ResponseEvent::RowEof(eof)) => {
                    let eof = EofPacket::parse(&eof.payload).expect("EOF packet");
                    eof.status_flags & status::SERVER_MORE_RESULTS_EXISTS != 0
                }
                _ => true,
            };
            if !more {
                break;
            }
        }
        packets
    }
}

pub fn sequence_ids(packets: &[Packet]) -> Vec<u8> {
    packets.iter().map(|p| p.sequence_id).collect()
}

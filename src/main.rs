use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use futures::StreamExt;
use tokio::io::DuplexStream;
use tokio_util::codec::FramedRead;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use strata::backend::{ResponseEvent, ResponseReader};
use strata::config::{self, Config};
use strata::frontend::ClientWriter;
use strata::pool::NodeRegistry;
use strata::protocol::{status, EofPacket, ErrPacket, OkPacket, PacketCodec};
use strata::route::RouteResultset;
use strata::session::{ClientState, ProxyContext, Session};
use strata::stat::{QueryResultDispatcher, StatDispatcher};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Run one statement on one sharding node and print what the client would receive.
///
/// Usage: strata <node> <sql>
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(node), Some(sql)) = (args.next(), args.next()) else {
        bail!("usage: strata <node> <sql>");
    };

    let config = load_or_default_config();
    if config.node(&node).is_none() {
        bail!("sharding node {node} is not configured");
    }

    let registry = Arc::new(NodeRegistry::from_config(&config));
    let stats = config.statistics.enabled.then(StatDispatcher::spawn);

    let (client_side, proxy_side) = tokio::io::duplex(config.frontend.buffer_size * 4);
    let client = ClientWriter::spawn(proxy_side, config.frontend.buffer_size, config.flow_control);
    let printer = tokio::spawn(print_response(client_side));

    let context = ProxyContext {
        provider: registry.clone(),
        flow_control: config.flow_control,
        statistics: stats.clone().map(|s| s as Arc<dyn QueryResultDispatcher>),
    };
    let state = ClientState::new("strata", "127.0.0.1", 0);
    let session = Session::new(1, client, context, state);

    let rrs = RouteResultset::single(&node, &sql);
    info!(node = %node, sql_type = %rrs.sql_type, "Executing statement");
    session.execute(rrs)?;

    match tokio::time::timeout(RESPONSE_TIMEOUT, printer).await {
        Ok(joined) => joined.context("response printer failed")?,
        Err(_) => warn!("No complete response within {:?}", RESPONSE_TIMEOUT),
    }

    session.close("statement finished");
    registry.close_all();

    if let Some(stats) = stats {
        // Let the collector drain before reading it
        tokio::task::yield_now().await;
        if let Some(user) = stats.collector().user_stat("strata") {
            info!(queries = user.queries, rows = user.rows, time_ms = user.total_time_ms, "Statistics");
        }
    }
    let pools = registry.stats();
    info!(nodes = pools.nodes, idle = pools.total_idle_connections, "Pools");
    Ok(())
}

/// Print client-bound packets until the response is complete
async fn print_response(stream: DuplexStream) {
    let mut packets = FramedRead::new(stream, PacketCodec::default());
    let mut reader = ResponseReader::new();

    while let Some(packet) = packets.next().await {
        let packet = match packet {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "Unreadable client packet");
                return;
            }
        };
        let seq = packet.sequence_id;
        let event = match reader.feed(packet) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(seq, error = %e, "Unexpected client packet");
                return;
            }
        };

        let more = match event {
            ResponseEvent::Ok(ok) => match OkPacket::parse(&ok.payload) {
                Ok(ok) => {
                    println!(
                        "[{seq}] OK affected_rows={} last_insert_id={} status=0x{:04X}",
                        ok.affected_rows, ok.last_insert_id, ok.status_flags
                    );
                    ok.status_flags & status::SERVER_MORE_RESULTS_EXISTS != 0
                }
                Err(e) => {
                    println!("[{seq}] OK (unreadable: {e})");
                    false
                }
            },
            ResponseEvent::Error(err) => {
                match ErrPacket::parse(&err.payload) {
                    Some(err) => println!(
                        "[{seq}] ERR {} ({}): {}",
                        err.error_code, err.sql_state, err.error_message
                    ),
                    None => println!("[{seq}] ERR (unreadable)"),
                }
                false
            }
            ResponseEvent::FieldEof { fields, .. } => {
                println!("[{seq}] {} column(s)", fields.len());
                continue;
            }
            ResponseEvent::Row(row) => {
                println!("[{seq}] row, {} bytes", row.payload.len());
                continue;
            }
            ResponseEvent::RowEof(eof) => {
                let status_flags = EofPacket::parse(&eof.payload)
                    .map(|eof| eof.status_flags)
                    .unwrap_or(0);
                println!("[{seq}] EOF status=0x{status_flags:04X}");
                status_flags & status::SERVER_MORE_RESULTS_EXISTS != 0
            }
            ResponseEvent::LocalInfile(_) => {
                println!("[{seq}] unexpected file request");
                false
            }
        };
        if !more {
            return;
        }
    }
}

fn load_or_default_config() -> Config {
    // Try to load from config file
    let config_paths = ["config/strata.toml", "strata.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}

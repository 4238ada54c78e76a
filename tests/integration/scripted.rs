//! End-to-end tests through real sockets against the scripted server

use std::net::SocketAddr;

use strata::protocol::{error_code, status, ErrPacket, FieldPacket, OkPacket};
use strata::route::RouteResultset;
use strata::session::ClientState;

use crate::fake_server::FakeMySql;
use crate::{node_config, registry, sequence_ids, TestClient};

fn client_state() -> ClientState {
    ClientState::new("app", "127.0.0.1", 40000)
}

#[tokio::test]
async fn test_select_streams_result_and_pools_connection() {
    let server = FakeMySql::start().await;
    let nodes = registry(vec![node_config("dn1", server.addr)]);
    let mut client = TestClient::new(nodes.clone(), client_state());

    client
        .session
        .execute(RouteResultset::single("dn1", "SELECT id, name FROM users"))
        .unwrap();
    let packets = client.read_response().await;

    assert_eq!(sequence_ids(&packets), vec![1, 2, 3, 4, 5, 6, 7]);
    let id = FieldPacket::parse(&packets[1].payload).unwrap();
    assert_eq!(&id.name[..], b"id");
    assert_eq!(nodes.stats().total_idle_connections, 1);

    // Second statement reuses the pooled connection
    client.session.set_packet_id(0);
    client
        .session
        .execute(RouteResultset::single("dn1", "INSERT INTO users VALUES (3, 'carol')"))
        .unwrap();
    let packets = client.read_response().await;
    let ok = OkPacket::parse(&packets[0].payload).unwrap();
    assert_eq!(ok.affected_rows, 1);
    assert_eq!(ok.last_insert_id, 7);
    assert_eq!(ok.status_flags, status::SERVER_STATUS_AUTOCOMMIT);
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_backend_error_is_forwarded() {
    let server = FakeMySql::start().await;
    let mut client = TestClient::new(registry(vec![node_config("dn1", server.addr)]), client_state());

    client
        .session
        .execute(RouteResultset::single("dn1", "SELECT * FROM missing"))
        .unwrap();
    let packets = client.read_response().await;

    assert_eq!(packets.len(), 1);
    let err = ErrPacket::parse(&packets[0].payload).unwrap();
    assert_eq!(err.error_code, 1146);
    assert_eq!(err.sql_state, "42S02");
}

#[tokio::test]
async fn test_backend_gone_mid_result_set() {
    let server = FakeMySql::start().await;
    let nodes = registry(vec![node_config("dn1", server.addr)]);
    let mut client = TestClient::new(nodes.clone(), client_state());

    client
        .session
        .execute(RouteResultset::single("dn1", "SELECT half"))
        .unwrap();
    let packets = client.read_response().await;

    // header, two fields, EOF, one row, then the close error
    assert_eq!(sequence_ids(&packets), vec![1, 2, 3, 4, 5, 6]);
    let err = ErrPacket::parse(&packets[5].payload).unwrap();
    assert_eq!(err.error_code, error_code::ER_ERROR_ON_CLOSE);
    assert!(err.error_message.contains("threadID[100]"));
    assert_eq!(client.session.target_count(), 0);
    assert_eq!(nodes.stats().total_idle_connections, 0);
}

#[tokio::test]
async fn test_transaction_syncs_autocommit() {
    let server = FakeMySql::start().await;
    let mut state = client_state();
    state.begin_transaction();
    let mut client = TestClient::new(registry(vec![node_config("dn1", server.addr)]), state);

    client
        .session
        .execute(RouteResultset::single("dn1", "UPDATE users SET name = 'x'"))
        .unwrap();
    let packets = client.read_response().await;

    assert_eq!(packets.len(), 1);
    assert_eq!(OkPacket::parse(&packets[0].payload).unwrap().affected_rows, 2);
    assert_eq!(
        server.queries(),
        vec!["SET autocommit=0".to_string(), "UPDATE users SET name = 'x'".to_string()]
    );
    // Still bound for the rest of the transaction
    assert_eq!(client.session.target_count(), 1);
}

#[tokio::test]
async fn test_unknown_node() {
    let mut client = TestClient::new(registry(vec![]), client_state());

    client
        .session
        .execute(RouteResultset::single("dn9", "SELECT 1"))
        .unwrap();
    let packets = client.read_response().await;

    let err = ErrPacket::parse(&packets[0].payload).unwrap();
    assert_eq!(err.error_code, error_code::ER_DB_INSTANCE_ABORTING_CONNECTION);
    assert_eq!(
        err.error_message,
        "can't connect to shardingNode[dn9], due to Unknown sharding node dn9"
    );
}

#[tokio::test]
async fn test_connect_refused() {
    // Bind and drop to get a port nothing listens on
    let addr: SocketAddr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let mut client = TestClient::new(registry(vec![node_config("dn1", addr)]), client_state());

    client
        .session
        .execute(RouteResultset::single("dn1", "SELECT 1"))
        .unwrap();
    let packets = client.read_response().await;

    assert_eq!(sequence_ids(&packets), vec![1]);
    let err = ErrPacket::parse(&packets[0].payload).unwrap();
    assert_eq!(err.error_code, error_code::ER_DB_INSTANCE_ABORTING_CONNECTION);
    assert!(err.error_message.starts_with("can't connect to shardingNode[dn1], due to "));
}

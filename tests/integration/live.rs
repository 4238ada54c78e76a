//! Tests against a real MySQL server

use strata::config::ShardingNodeConfig;
use strata::protocol::{ErrPacket, OkPacket};
use strata::route::RouteResultset;
use strata::session::ClientState;

use crate::{get_mysql_config, registry, sequence_ids, skip_if_not_enabled, TestClient};

fn live_client() -> TestClient {
    let (master, database) = get_mysql_config();
    let node = ShardingNodeConfig {
        name: "dn1".to_string(),
        database,
        master,
        slaves: vec![],
    };
    TestClient::new(registry(vec![node]), ClientState::new("it", "127.0.0.1", 0))
}

#[tokio::test]
async fn test_live_select() {
    skip_if_not_enabled!();

    let mut client = live_client();
    client
        .session
        .execute(RouteResultset::single("dn1", "SELECT 1 AS one, 'two' AS two"))
        .unwrap();
    let packets = client.read_response().await;

    // header, 2 fields, EOF, 1 row, EOF
    assert_eq!(sequence_ids(&packets), vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn test_live_syntax_error() {
    skip_if_not_enabled!();

    let mut client = live_client();
    client
        .session
        .execute(RouteResultset::single("dn1", "SELEC 1"))
        .unwrap();
    let packets = client.read_response().await;

    let err = ErrPacket::parse(&packets[0].payload).expect("ERR packet");
    assert_eq!(err.error_code, 1064);
}

#[tokio::test]
async fn test_live_transaction_write() {
    skip_if_not_enabled!();

    let mut client = live_client();
    client
        .session
        .execute(RouteResultset::single(
            "dn1",
            "CREATE TABLE IF NOT EXISTS strata_it (id INT PRIMARY KEY AUTO_INCREMENT, v INT)",
        ))
        .unwrap();
    client.read_response().await;

    client.session.state().begin_transaction();
    client.session.set_packet_id(0);
    client
        .session
        .execute(RouteResultset::single("dn1", "INSERT INTO strata_it (v) VALUES (1)"))
        .unwrap();
    let packets = client.read_response().await;

    let ok = OkPacket::parse(&packets[0].payload).expect("OK packet");
    assert_eq!(ok.affected_rows, 1);
    assert_eq!(client.session.target_count(), 1);
    assert_eq!(client.session.txn_log().len(), 1);
}

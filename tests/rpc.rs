use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use cubicle::clock::FixedClock;
use cubicle::node::Node;
use cubicle::wire;

const H: i64 = 3_600_000;
/// 2024-05-01T00:00:00Z
const DAY: i64 = 1_714_521_600_000;
/// Server clock: 09:00 on that day.
const NOW: i64 = DAY + 9 * H;

// ── Test infrastructure ──────────────────────────────────────

async fn start_node(vars: &[(&str, String)]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("cubicle_int_test_{}", Ulid::new()));
    let mut env: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    env.insert(
        "CUBICLE_DATA_DIR".into(),
        dir.to_string_lossy().into_owned(),
    );
    env.insert("CUBICLE_REQUEST_TIMEOUT_MS".into(), "1000".into());
    let config = cubicle::config::Config::from_lookup(|k| env.get(k).cloned()).unwrap();
    let node = Arc::new(Node::start(&config, Arc::new(FixedClock::new(NOW))).unwrap());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let node = node.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, node, "cubicle".to_string()).await;
            });
        }
    });

    addr
}

async fn start_role(role: &str) -> SocketAddr {
    start_node(&[("CUBICLE_ROLE", role.to_string())]).await
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("cubicle")
        .user("cubicle")
        .password("cubicle");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap_or_else(|e| panic!("{sql}: {e}"))
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn affected(client: &Client, sql: &str) -> u64 {
    client
        .simple_query(sql)
        .await
        .unwrap_or_else(|e| panic!("{sql}: {e}"))
        .into_iter()
        .find_map(|m| match m {
            SimpleQueryMessage::CommandComplete(n) => Some(n),
            _ => None,
        })
        .unwrap()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client
        .simple_query(sql)
        .await
        .expect_err(&format!("{sql} should fail"));
    err.code()
        .map(|c| c.code().to_string())
        .unwrap_or_else(|| panic!("{sql}: no SQLSTATE in {err}"))
}

fn availability_at(as_of: i64) -> String {
    format!("SELECT * FROM availability WHERE resource_id = 'C-101' AND as_of = {as_of}")
}

async fn seed_cubicle(client: &Client) {
    affected(
        client,
        "INSERT INTO metadata (id, name, location, capacity) VALUES ('C-101', 'Quiet room', 'Library, floor 2', 4)",
    )
    .await;
}

async fn book(client: &Client, id: &str, start: i64, end: i64) -> String {
    let sql = format!(
        r#"INSERT INTO reservations (record_id, resource_id, requester_id, start, "end", status) VALUES ('{id}', 'C-101', 'alice', {start}, {end}, 'CONFIRMED')"#
    );
    let rows = rows(client, &sql).await;
    rows[0].get("record_id").unwrap().to_string()
}

// ── All-in-one node ──────────────────────────────────────────

#[tokio::test]
async fn check_availability_over_the_wire() {
    let addr = start_role("all").await;
    let client = connect(addr).await;
    seed_cubicle(&client).await;

    assert_eq!(book(&client, "b1", DAY + 10 * H, DAY + 11 * H).await, "b1");
    assert_eq!(book(&client, "b2", DAY + 12 * H, DAY + 13 * H).await, "b2");

    // Default as_of is the server clock (09:00).
    let r = rows(&client, "SELECT * FROM availability WHERE resource_id = 'C-101'").await;
    assert_eq!(r[0].get("resource_id"), Some("C-101"));
    assert_eq!(r[0].get("available_now"), Some("t"));
    assert_eq!(r[0].get("next_available"), Some((DAY + 10 * H).to_string().as_str()));
    assert_eq!(r[0].get("integrity_violation"), None);

    let r = rows(&client, &availability_at(DAY + 10 * H + H / 2)).await;
    assert_eq!(r[0].get("available_now"), Some("f"));
    assert_eq!(r[0].get("next_available"), Some((DAY + 11 * H).to_string().as_str()));

    let r = rows(&client, &availability_at(DAY + 14 * H)).await;
    assert_eq!(r[0].get("available_now"), Some("t"));
    assert_eq!(r[0].get("next_available"), None);

    // RFC 3339 in another offset: 12:30+02:00 is 10:30Z.
    let r = rows(
        &client,
        "SELECT * FROM availability WHERE resource_id = 'C-101' AND as_of = '2024-05-01T12:30:00+02:00'",
    )
    .await;
    assert_eq!(r[0].get("available_now"), Some("f"));
}

#[tokio::test]
async fn reservation_lifecycle() {
    let addr = start_role("all").await;
    let client = connect(addr).await;
    seed_cubicle(&client).await;

    book(&client, "b1", DAY + 10 * H, DAY + 11 * H).await;

    // Generated id when none is given.
    let r = rows(
        &client,
        r#"INSERT INTO reservations (resource_id, requester_id, start, "end") VALUES ('C-101', 'bob', '2024-05-01T12:00:00Z', '2024-05-01T13:00:00Z')"#,
    )
    .await;
    let generated = r[0].get("record_id").unwrap().to_string();
    assert_eq!(generated.len(), 26);

    // Overlap and duplicate id.
    assert_eq!(
        sqlstate(
            &client,
            &format!(
                r#"INSERT INTO reservations (record_id, resource_id, requester_id, start, "end") VALUES ('b3', 'C-101', 'carol', {}, {})"#,
                DAY + 10 * H + H / 2,
                DAY + 11 * H + H / 2
            )
        )
        .await,
        "23P01"
    );
    assert_eq!(
        sqlstate(
            &client,
            &format!(
                r#"INSERT INTO reservations (record_id, resource_id, requester_id, start, "end") VALUES ('b1', 'C-101', 'carol', {}, {})"#,
                DAY + 20 * H,
                DAY + 21 * H
            )
        )
        .await,
        "23505"
    );
    // Inverted span is a validation error.
    assert_eq!(
        sqlstate(
            &client,
            r#"INSERT INTO reservations (resource_id, requester_id, start, "end") VALUES ('C-101', 'carol', 2000, 1000)"#
        )
        .await,
        "22023"
    );
    assert_eq!(
        sqlstate(
            &client,
            &format!(
                r#"INSERT INTO reservations (record_id, resource_id, requester_id, start, "end") VALUES ('b,9', 'C-101', 'carol', {}, {})"#,
                DAY + 20 * H,
                DAY + 21 * H
            )
        )
        .await,
        "22023"
    );

    // Cancel: missing id is not an error, just zero rows.
    assert_eq!(affected(&client, "DELETE FROM reservations WHERE record_id = 'ghost'").await, 0);
    assert_eq!(affected(&client, "DELETE FROM reservations WHERE record_id = 'b1'").await, 1);
    assert_eq!(affected(&client, "DELETE FROM reservations WHERE record_id = 'b1'").await, 0);

    let r = rows(&client, "SELECT * FROM reservations WHERE record_id = 'b1'").await;
    assert_eq!(r[0].get("status"), Some("CANCELLED"));
    assert_eq!(r[0].get("cancelled_at"), Some(NOW.to_string().as_str()));

    let r = rows(&client, "SELECT * FROM reservations WHERE resource_id = 'C-101'").await;
    assert_eq!(r.len(), 2);
    assert_eq!(r[1].get("record_id"), Some(generated.as_str()));
    assert_eq!(r[1].get("status"), Some("CONFIRMED"));

    // The slot is free again; next boundary is the afternoon booking.
    let r = rows(&client, &availability_at(DAY + 10 * H + H / 2)).await;
    assert_eq!(r[0].get("available_now"), Some("t"));
    assert_eq!(r[0].get("next_available"), Some((DAY + 12 * H).to_string().as_str()));
}

#[tokio::test]
async fn cubicle_details_and_errors() {
    let addr = start_role("all").await;
    let client = connect(addr).await;
    seed_cubicle(&client).await;
    book(&client, "b1", DAY + 10 * H, DAY + 11 * H).await;

    let r = rows(&client, "SELECT * FROM cubicles WHERE id = 'C-101'").await;
    assert_eq!(r.len(), 1);
    assert_eq!(r[0].get("name"), Some("Quiet room"));
    assert_eq!(r[0].get("location"), Some("Library, floor 2"));
    assert_eq!(r[0].get("capacity"), Some("4"));
    assert_eq!(r[0].get("available_now"), Some("t"));
    assert_eq!(r[0].get("next_available"), Some((DAY + 10 * H).to_string().as_str()));

    assert_eq!(sqlstate(&client, "SELECT * FROM cubicles WHERE id = 'C-999'").await, "P0002");
    assert_eq!(sqlstate(&client, "SELECT * FROM metadata WHERE id = 'C-999'").await, "P0002");
    assert_eq!(
        sqlstate(
            &client,
            "INSERT INTO metadata (id, name, location, capacity) VALUES ('C-101', 'Again', '', 1)"
        )
        .await,
        "23505"
    );
    assert_eq!(
        sqlstate(
            &client,
            "INSERT INTO metadata (id, name, location, capacity) VALUES ('C-0', 'Nothing', '', 0)"
        )
        .await,
        "22023"
    );
    assert_eq!(sqlstate(&client, "SELECT * FROM bookings").await, "42601");

    let r = rows(&client, "SELECT * FROM metadata").await;
    assert_eq!(r.len(), 1);

    let r = rows(&client, "SELECT * FROM readiness").await;
    assert_eq!(r[0].get("ready"), Some("t"));
    assert_eq!(r[0].get("metadata"), Some("t"));
    assert_eq!(r[0].get("availability"), Some("t"));
}

#[tokio::test]
async fn bound_parameters_are_inserted_verbatim() {
    let addr = start_role("all").await;
    let client = connect(addr).await;

    let inserted = client
        .execute(
            "INSERT INTO metadata (id, name, location, capacity) VALUES ($1, $2, $3, $4)",
            &[&"C-1", &"Desk $1", &"Annex", &"4"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    // A `$N` inside a quoted literal is text, not a placeholder.
    client
        .execute(
            "INSERT INTO metadata (id, name, location, capacity) VALUES ($1, 'Booth $2', $2, 2)",
            &[&"C-2", &"Annex"],
        )
        .await
        .unwrap();

    let r = rows(&client, "SELECT * FROM metadata WHERE id = 'C-1'").await;
    assert_eq!(r[0].get("name"), Some("Desk $1"));
    assert_eq!(r[0].get("location"), Some("Annex"));
    assert_eq!(r[0].get("capacity"), Some("4"));

    let r = rows(&client, "SELECT * FROM metadata WHERE id = 'C-2'").await;
    assert_eq!(r[0].get("name"), Some("Booth $2"));
    assert_eq!(r[0].get("location"), Some("Annex"));
}

// ── Split deployment ─────────────────────────────────────────

async fn wait_ready(client: &Client) -> bool {
    for _ in 0..100 {
        let r = rows(client, "SELECT * FROM readiness").await;
        if r[0].get("ready") == Some("t") {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn cubicle_node_aggregates_remote_nodes() {
    let metadata_addr = start_role("metadata").await;
    let reservation_addr = start_role("reservation").await;
    let cubicle_addr = start_node(&[
        ("CUBICLE_ROLE", "cubicle".to_string()),
        ("CUBICLE_METADATA_ADDR", metadata_addr.to_string()),
        ("CUBICLE_RESERVATION_ADDR", reservation_addr.to_string()),
    ])
    .await;

    let meta = connect(metadata_addr).await;
    let res = connect(reservation_addr).await;
    let cub = connect(cubicle_addr).await;

    seed_cubicle(&meta).await;
    book(&res, "b1", DAY + 8 * H, DAY + 10 * H).await;

    assert!(wait_ready(&cub).await, "links never came up");

    let r = rows(&cub, "SELECT * FROM cubicles WHERE id = 'C-101'").await;
    assert_eq!(r[0].get("name"), Some("Quiet room"));
    assert_eq!(r[0].get("available_now"), Some("f"));
    assert_eq!(r[0].get("next_available"), Some((DAY + 10 * H).to_string().as_str()));

    // Kinds survive both hops.
    assert_eq!(sqlstate(&cub, "SELECT * FROM cubicles WHERE id = 'C-404'").await, "P0002");

    // Each node serves only its own components.
    assert_eq!(
        sqlstate(
            &cub,
            "INSERT INTO metadata (id, name, location, capacity) VALUES ('C-2', 'x', '', 1)"
        )
        .await,
        "0A000"
    );
    assert_eq!(
        sqlstate(&meta, "SELECT * FROM availability WHERE resource_id = 'C-101'").await,
        "0A000"
    );
    assert_eq!(sqlstate(&res, "SELECT * FROM cubicles WHERE id = 'C-101'").await, "0A000");
}

#[tokio::test]
async fn cubicle_node_not_ready_without_dependencies() {
    // Reserve two ports and release them so nothing answers there.
    let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (a_addr, b_addr) = (a.local_addr().unwrap(), b.local_addr().unwrap());
    drop((a, b));

    let cubicle_addr = start_node(&[
        ("CUBICLE_ROLE", "cubicle".to_string()),
        ("CUBICLE_METADATA_ADDR", a_addr.to_string()),
        ("CUBICLE_RESERVATION_ADDR", b_addr.to_string()),
    ])
    .await;
    let cub = connect(cubicle_addr).await;

    let r = rows(&cub, "SELECT * FROM readiness").await;
    assert_eq!(r[0].get("ready"), Some("f"));
    assert_eq!(sqlstate(&cub, "SELECT * FROM cubicles WHERE id = 'C-101'").await, "57P03");
}

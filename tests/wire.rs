use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use curbside::engine::BookingEngine;
use curbside::store::Store;
use curbside::wire;

// ── Test infrastructure ──────────────────────────────────────

const PASSWORD: &str = "curbside";

struct TestServer {
    addr: SocketAddr,
    admin: Ulid,
}

async fn start_test_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("curbside_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Store::open(&dir.join("curbside.wal")).unwrap();
    let engine = Arc::new(BookingEngine::with_store(store, Duration::from_secs(5)));

    let admin = Ulid::new();
    let admins = Arc::new(HashSet::from([admin]));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            let admins = admins.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, admins, PASSWORD.to_string(), None)
                    .await;
            });
        }
    });

    TestServer { addr, admin }
}

async fn connect_as(addr: SocketAddr, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("curbside")
        .user(user)
        .password(PASSWORD);

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
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.as_db_error()
        .map(|e| e.code().code().to_string())
        .unwrap_or_else(|| panic!("expected a server error, got {err}"))
}

fn ahead(days: u64) -> NaiveDate {
    Utc::now().date_naive().checked_add_days(Days::new(days)).unwrap()
}

fn book_sql(vendor: Ulid, label: &str, date: NaiveDate) -> String {
    format!("INSERT INTO reservations (vendor_id, resource_day, date) VALUES ('{vendor}', '{label}', '{date}')")
}

async fn create_day(server: &TestServer, label: &str, capacity: i64) {
    let admin = connect_as(server.addr, &server.admin.to_string()).await;
    admin
        .batch_execute(&format!(
            "INSERT INTO resource_days (label, capacity) VALUES ('{label}', {capacity})"
        ))
        .await
        .unwrap();
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn vendor_books_and_sees_own_reservation() {
    let server = start_test_server().await;
    create_day(&server, "Monday", 7).await;

    let vendor = Ulid::new();
    let client = connect_as(server.addr, &vendor.to_string()).await;
    let date = ahead(3);

    let created = rows(&client, &book_sql(vendor, "Monday", date)).await;
    assert_eq!(created.len(), 1);
    let id = created[0].get("id").unwrap().to_string();
    assert_eq!(created[0].get("vendor_id"), Some(vendor.to_string().as_str()));
    assert_eq!(created[0].get("date"), Some(date.to_string().as_str()));

    let fetched = rows(&client, &format!("SELECT * FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(fetched[0].get("id"), Some(id.as_str()));

    let mine = rows(
        &client,
        &format!("SELECT * FROM reservations WHERE vendor_id = '{vendor}'"),
    )
    .await;
    assert_eq!(mine.len(), 1);
}

#[tokio::test]
async fn last_unit_goes_to_one_vendor() {
    let server = start_test_server().await;
    create_day(&server, "Friday", 1).await;
    let date = ahead(4);

    let first = Ulid::new();
    let c1 = connect_as(server.addr, &first.to_string()).await;
    rows(&c1, &book_sql(first, "Friday", date)).await;

    let second = Ulid::new();
    let c2 = connect_as(server.addr, &second.to_string()).await;
    assert_eq!(sqlstate(&c2, &book_sql(second, "Friday", date)).await, "23P01");

    let avail = rows(
        &c2,
        &format!("SELECT * FROM availability WHERE resource_day = 'Friday' AND date = '{date}'"),
    )
    .await;
    assert_eq!(avail[0].get("booked"), Some("1"));
    assert_eq!(avail[0].get("remaining"), Some("0"));
}

#[tokio::test]
async fn rolling_week_and_date_floor_enforced() {
    let server = start_test_server().await;
    create_day(&server, "Monday", 7).await;
    let vendor = Ulid::new();
    let client = connect_as(server.addr, &vendor.to_string()).await;

    assert_eq!(sqlstate(&client, &book_sql(vendor, "Monday", ahead(1))).await, "22023");
    rows(&client, &book_sql(vendor, "Monday", ahead(5))).await;
    assert_eq!(sqlstate(&client, &book_sql(vendor, "Monday", ahead(11))).await, "23P01");
    rows(&client, &book_sql(vendor, "Monday", ahead(12))).await;
}

#[tokio::test]
async fn vendors_cannot_touch_each_other() {
    let server = start_test_server().await;
    create_day(&server, "Monday", 7).await;

    let owner = Ulid::new();
    let owner_client = connect_as(server.addr, &owner.to_string()).await;
    let created = rows(&owner_client, &book_sql(owner, "Monday", ahead(3))).await;
    let id = created[0].get("id").unwrap().to_string();

    let other = Ulid::new();
    let other_client = connect_as(server.addr, &other.to_string()).await;
    assert_eq!(
        sqlstate(&other_client, &format!("DELETE FROM reservations WHERE id = '{id}'")).await,
        "42501"
    );
    assert_eq!(
        sqlstate(&other_client, &book_sql(owner, "Monday", ahead(20))).await,
        "42501"
    );
    assert_eq!(sqlstate(&other_client, "SELECT * FROM reservations").await, "42501");
    assert_eq!(
        sqlstate(&other_client, "INSERT INTO resource_days (label, capacity) VALUES ('Extra', 3)").await,
        "42501"
    );

    owner_client
        .batch_execute(&format!("DELETE FROM reservations WHERE id = '{id}'"))
        .await
        .unwrap();
    assert_eq!(
        sqlstate(&owner_client, &format!("SELECT * FROM reservations WHERE id = '{id}'")).await,
        "P0002"
    );
}

#[tokio::test]
async fn admin_manages_days_and_cancels_any_reservation() {
    let server = start_test_server().await;
    let admin = connect_as(server.addr, &server.admin.to_string()).await;

    let day = rows(&admin, "INSERT INTO resource_days (label, capacity) VALUES ('Sunday', 7)").await;
    assert_eq!(day[0].get("capacity"), Some("7"));
    assert_eq!(
        sqlstate(&admin, "INSERT INTO resource_days (label, capacity) VALUES ('sunday', 3)").await,
        "23505"
    );
    assert_eq!(
        sqlstate(&admin, "INSERT INTO resource_days (label, capacity) VALUES ('Saturday', 0)").await,
        "22023"
    );
    let updated = rows(&admin, "UPDATE resource_days SET capacity = 2 WHERE label = 'Sunday'").await;
    assert_eq!(updated[0].get("capacity"), Some("2"));

    let vendor = Ulid::new();
    let booked = rows(&admin, &book_sql(vendor, "Sunday", ahead(6))).await;
    assert_eq!(booked[0].get("booked_by"), Some(server.admin.to_string().as_str()));
    let id = booked[0].get("id").unwrap().to_string();

    assert_eq!(rows(&admin, "SELECT * FROM reservations").await.len(), 1);
    assert_eq!(rows(&admin, "SELECT * FROM upcoming_reservations").await.len(), 1);

    admin
        .batch_execute(&format!("DELETE FROM reservations WHERE id = '{id}'"))
        .await
        .unwrap();
    assert!(rows(&admin, "SELECT * FROM upcoming_reservations").await.is_empty());
}

#[tokio::test]
async fn move_reservation_keeps_slot_on_refusal() {
    let server = start_test_server().await;
    create_day(&server, "Monday", 7).await;
    create_day(&server, "Tuesday", 1).await;
    let date = ahead(9);

    let blocker = Ulid::new();
    let blocker_client = connect_as(server.addr, &blocker.to_string()).await;
    rows(&blocker_client, &book_sql(blocker, "Tuesday", date)).await;

    let vendor = Ulid::new();
    let client = connect_as(server.addr, &vendor.to_string()).await;
    let created = rows(&client, &book_sql(vendor, "Monday", date)).await;
    let id = created[0].get("id").unwrap().to_string();
    let monday_id = created[0].get("resource_day_id").unwrap().to_string();

    assert_eq!(
        sqlstate(
            &client,
            &format!("UPDATE reservations SET resource_day = 'Tuesday' WHERE id = '{id}'")
        )
        .await,
        "23P01"
    );
    let unchanged = rows(&client, &format!("SELECT * FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(unchanged[0].get("resource_day_id"), Some(monday_id.as_str()));

    let later = ahead(10);
    let moved = rows(
        &client,
        &format!("UPDATE reservations SET date = '{later}' WHERE id = '{id}'"),
    )
    .await;
    assert_eq!(moved[0].get("date"), Some(later.to_string().as_str()));
}

#[tokio::test]
async fn resource_days_listed_in_label_order() {
    let server = start_test_server().await;
    create_day(&server, "Wednesday", 7).await;
    create_day(&server, "Friday", 6).await;

    let client = connect_as(server.addr, &Ulid::new().to_string()).await;
    let days = rows(&client, "SELECT * FROM resource_days").await;
    let labels: Vec<_> = days.iter().map(|r| r.get("label").unwrap().to_string()).collect();
    assert_eq!(labels, ["Friday", "Wednesday"]);

    let one = rows(&client, "SELECT * FROM resource_days WHERE label = 'Friday'").await;
    assert_eq!(one.len(), 1);
}

#[tokio::test]
async fn unknown_day_and_parse_errors() {
    let server = start_test_server().await;
    let vendor = Ulid::new();
    let client = connect_as(server.addr, &vendor.to_string()).await;

    assert_eq!(sqlstate(&client, &book_sql(vendor, "Someday", ahead(3))).await, "P0002");
    assert_eq!(sqlstate(&client, "SELECT * FROM vendors").await, "42601");
    assert_eq!(sqlstate(&client, "NOT SQL AT ALL").await, "42601");
}

#[tokio::test]
async fn login_user_must_be_a_caller_id() {
    let server = start_test_server().await;
    let client = connect_as(server.addr, "someone").await;
    assert_eq!(sqlstate(&client, "SELECT * FROM resource_days").await, "28000");
}

#[tokio::test]
async fn extended_protocol_availability() {
    let server = start_test_server().await;
    create_day(&server, "Thursday", 7).await;
    let date = ahead(8).to_string();

    let client = connect_as(server.addr, &Ulid::new().to_string()).await;
    let result = client
        .query(
            "SELECT * FROM availability WHERE resource_day = $1 AND date = $2",
            &[&"Thursday", &date.as_str()],
        )
        .await
        .unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].get::<_, &str>("date"), date.as_str());
}

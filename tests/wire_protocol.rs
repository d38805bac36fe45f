use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use coworkd::engine::BookingPolicy;
use coworkd::space::SpaceManager;
use coworkd::wire;

const PASSWORD: &str = "coworkd";
/// 2025-01-20T09:00:00Z
const NINE: i64 = 1_737_363_600_000;
const H: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("coworkd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let spaces = Arc::new(SpaceManager::new(dir, 1000, BookingPolicy::default()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let spaces = spaces.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, spaces, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

async fn try_connect(addr: SocketAddr, space: &str, user: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(space)
        .user(user)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, space: &str, user: &str) -> Client {
    try_connect(addr, space, user).await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

/// Admin session with one desk and one member.
async fn seed(client: &Client, desk: Ulid, member: Ulid) {
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, kind) VALUES ('{desk}', 'Desk A1', 'desk')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO members (id, name, email) VALUES ('{member}', 'Ada', 'ada@example.com')"
        ))
        .await
        .unwrap();
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn overlapping_insert_is_rejected_with_exclusion_code() {
    let addr = start_test_server().await;
    let admin = connect(addr, "hub", "admin").await;
    let (desk, ada, bob) = (Ulid::new(), Ulid::new(), Ulid::new());
    seed(&admin, desk, ada).await;
    admin
        .batch_execute(&format!(
            "INSERT INTO members (id, name, email) VALUES ('{bob}', 'Bob', 'bob@example.com')"
        ))
        .await
        .unwrap();

    let first = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO bookings (id, resource_id, member_id, start, \"end\", status) \
             VALUES ('{first}', '{desk}', '{ada}', {NINE}, {}, 'confirmed')",
            NINE + 3 * H
        ))
        .await
        .unwrap();

    let err = admin
        .batch_execute(&format!(
            "INSERT INTO bookings (resource_id, member_id, start, \"end\") \
             VALUES ('{desk}', '{bob}', {}, {})",
            NINE + 2 * H,
            NINE + 4 * H
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));
    let message = err.as_db_error().map(|e| e.message().to_string()).unwrap_or_default();
    assert!(message.contains(&first.to_string()), "{message}");

    admin
        .batch_execute(&format!(
            "INSERT INTO bookings (resource_id, member_id, start, \"end\") \
             VALUES ('{desk}', '{bob}', {}, {})",
            NINE + 3 * H,
            NINE + 4 * H
        ))
        .await
        .unwrap();

    let listed = rows(&admin, &format!("SELECT * FROM bookings WHERE resource_id = '{desk}'")).await;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].get("id"), Some(first.to_string().as_str()));
    assert_eq!(listed[0].get("status"), Some("confirmed"));
}

#[tokio::test]
async fn resources_listed_with_columns() {
    let addr = start_test_server().await;
    let admin = connect(addr, "hub", "admin").await;
    let (desk, ada) = (Ulid::new(), Ulid::new());
    seed(&admin, desk, ada).await;

    let resources = rows(&admin, "SELECT * FROM resources").await;
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].get("id"), Some(desk.to_string().as_str()));
    assert_eq!(resources[0].get("kind"), Some("desk"));
    assert_eq!(resources[0].get("capacity"), Some("1"));

    let members = rows(&admin, "SELECT * FROM members").await;
    assert_eq!(members[0].get("email"), Some("ada@example.com"));
}

#[tokio::test]
async fn coworker_books_for_self_only() {
    let addr = start_test_server().await;
    let admin = connect(addr, "hub", "admin").await;
    let (desk, ada) = (Ulid::new(), Ulid::new());
    seed(&admin, desk, ada).await;

    let me = connect(addr, "hub", &ada.to_string()).await;
    let booking = Ulid::new();
    me.batch_execute(&format!(
        "INSERT INTO bookings (id, resource_id, member_id, start, \"end\") \
         VALUES ('{booking}', '{desk}', '{ada}', {NINE}, {})",
        NINE + H
    ))
    .await
    .unwrap();

    let err = me
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'confirmed' WHERE id = '{booking}'"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    let err = me
        .batch_execute(&format!(
            "INSERT INTO resources (name, kind) VALUES ('Salle Beta', 'room')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));
}

#[tokio::test]
async fn unknown_user_cannot_log_in() {
    let addr = start_test_server().await;
    assert!(try_connect(addr, "hub", "postgres").await.is_err());
}

#[tokio::test]
async fn spaces_are_isolated() {
    let addr = start_test_server().await;
    let north = connect(addr, "north", "admin").await;
    let south = connect(addr, "south", "admin").await;
    seed(&north, Ulid::new(), Ulid::new()).await;

    assert_eq!(rows(&north, "SELECT * FROM resources").await.len(), 1);
    assert!(rows(&south, "SELECT * FROM resources").await.is_empty());
}

#[tokio::test]
async fn availability_and_dashboard_queries() {
    let addr = start_test_server().await;
    let admin = connect(addr, "hub", "admin").await;
    let (desk, ada) = (Ulid::new(), Ulid::new());
    seed(&admin, desk, ada).await;
    admin
        .batch_execute(&format!(
            "INSERT INTO bookings (resource_id, member_id, start, \"end\", status) \
             VALUES ('{desk}', '{ada}', {}, {}, 'confirmed')",
            NINE + H,
            NINE + 2 * H
        ))
        .await
        .unwrap();

    let free = rows(
        &admin,
        &format!(
            "SELECT * FROM availability WHERE resource_id = '{desk}' AND start >= {NINE} AND \"end\" <= {}",
            NINE + 4 * H
        ),
    )
    .await;
    let spans: Vec<_> = free
        .iter()
        .map(|r| (r.get("start").unwrap().to_string(), r.get("end").unwrap().to_string()))
        .collect();
    assert_eq!(
        spans,
        vec![
            (NINE.to_string(), (NINE + H).to_string()),
            ((NINE + 2 * H).to_string(), (NINE + 4 * H).to_string()),
        ]
    );

    let grid = rows(
        &admin,
        &format!(
            "SELECT * FROM free_busy WHERE start >= {NINE} AND \"end\" <= {} AND granularity = 60",
            NINE + 3 * H
        ),
    )
    .await;
    let busy: Vec<_> = grid.iter().map(|r| r.get("busy").unwrap().to_string()).collect();
    assert_eq!(busy, vec!["f", "t", "f"]);

    let occupancy = rows(
        &admin,
        &format!(
            "SELECT * FROM occupancy WHERE start >= {NINE} AND \"end\" <= {}",
            NINE + 4 * H
        ),
    )
    .await;
    assert_eq!(occupancy[0].get("booked_ms"), Some(H.to_string().as_str()));

    let calendar = rows(&admin, "SELECT * FROM calendar WHERE week = '2025-01-20'").await;
    // 7 days of 10 hourly rows, one desk.
    assert_eq!(calendar.len(), 70);
    assert_eq!(calendar[1].get("member_name"), Some("Ada"));
    assert_eq!(calendar[0].get("booking_id"), None);
}

#[tokio::test]
async fn extended_protocol_status_change() {
    let addr = start_test_server().await;
    let admin = connect(addr, "hub", "admin").await;
    let (desk, ada) = (Ulid::new(), Ulid::new());
    seed(&admin, desk, ada).await;

    // Far enough ahead that cancelling is always allowed.
    let start = 4_000_000_000_000i64;
    let booking = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO bookings (id, resource_id, member_id, start, \"end\") \
             VALUES ('{booking}', '{desk}', '{ada}', {start}, {})",
            start + H
        ))
        .await
        .unwrap();

    let updated = admin
        .execute(
            "UPDATE bookings SET status = $1 WHERE id = $2",
            &[&"cancelled", &booking.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let listed = rows(&admin, &format!("SELECT * FROM bookings WHERE id = '{booking}'")).await;
    assert_eq!(listed[0].get("status"), Some("cancelled"));
}

#[tokio::test]
async fn bound_names_keep_dollar_signs() {
    let addr = start_test_server().await;
    let admin = connect(addr, "hub", "admin").await;
    let member = Ulid::new();

    let inserted = admin
        .execute(
            "INSERT INTO members (id, name, email) VALUES ($1, $2, $3)",
            &[&member.to_string(), &"Fee $1 paid", &"fee@example.com"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let members = rows(&admin, "SELECT * FROM members").await;
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].get("name"), Some("Fee $1 paid"));
}

#[tokio::test]
async fn dotted_space_name_is_refused() {
    let addr = start_test_server().await;
    let plain = connect(addr, "acmehq", "admin").await;
    seed(&plain, Ulid::new(), Ulid::new()).await;

    let dotted = connect(addr, "acme.hq", "admin").await;
    let err = dotted.simple_query("SELECT * FROM resources").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("08006"));
}

#[tokio::test]
async fn oversized_reads_are_refused() {
    let addr = start_test_server().await;
    let admin = connect(addr, "hub", "admin").await;
    let (desk, ada) = (Ulid::new(), Ulid::new());
    seed(&admin, desk, ada).await;

    let err = admin
        .simple_query(&format!(
            "SELECT * FROM free_busy WHERE start >= {} AND \"end\" <= {}",
            i64::MAX - 1_800_000,
            i64::MAX
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("54000"));

    let err = admin
        .simple_query(&format!(
            "SELECT * FROM free_busy WHERE start >= {NINE} AND \"end\" <= {} AND granularity = {}",
            NINE + 3 * H,
            1i64 << 59
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("54000"));

    let err = admin
        .simple_query(&format!(
            "SELECT * FROM availability WHERE resource_id = '{desk}' AND start >= {NINE} AND \"end\" <= {} AND min_duration = {}",
            NINE + 3 * H,
            1i64 << 59
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22003"));

    let err = admin
        .simple_query(&format!(
            "SELECT * FROM calendar WHERE week = '2025-01-20' AND slot_minutes = {}",
            1i64 << 59
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("54000"));
}

#[tokio::test]
async fn errors_carry_sqlstates() {
    let addr = start_test_server().await;
    let admin = connect(addr, "hub", "admin").await;

    let err = admin.batch_execute("SELEC nonsense").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));

    let err = admin
        .batch_execute(&format!("UPDATE bookings SET status = 'cancelled' WHERE id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));

    let err = admin
        .batch_execute(&format!(
            "SELECT * FROM availability WHERE resource_id = '{}' AND start >= 10 AND \"end\" <= 5",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22007"));
}

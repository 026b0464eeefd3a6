//! Tests for COPY FROM STDIN

use std::env;
use std::sync::atomic::{AtomicU32, Ordering};
use zero_gauss::tokio::{Conn, copy_in_statement};
use zero_gauss::{Error, Value};

static TABLE_COUNTER: AtomicU32 = AtomicU32::new(0);

async fn get_conn() -> Conn {
    let mut db_url =
        env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/postgres".to_string());
    if !db_url.contains("sslmode=") {
        if db_url.contains('?') {
            db_url.push_str("&sslmode=disable");
        } else {
            db_url.push_str("?sslmode=disable");
        }
    }
    Conn::new(db_url.as_str()).await.expect("Failed to connect")
}

struct TestTable {
    name: String,
}

impl TestTable {
    async fn new(conn: &mut Conn) -> Self {
        let id = TABLE_COUNTER.fetch_add(1, Ordering::SeqCst);
        let name = format!("copy_test_{}_{}", std::process::id(), id);
        conn.query_drop(&format!("DROP TABLE IF EXISTS {}", name), ())
            .await
            .unwrap();
        conn.query_drop(
            &format!("CREATE TABLE {} (id INT4 PRIMARY KEY, note TEXT)", name),
            (),
        )
        .await
        .unwrap();
        Self { name }
    }

    fn copy_sql(&self) -> String {
        copy_in_statement(&self.name, &["id", "note"])
    }

    async fn rows(&self, conn: &mut Conn) -> Vec<(i32, Option<String>)> {
        conn.query_collect(
            format!("SELECT id, note FROM {} ORDER BY id", self.name).as_str(),
            (),
        )
        .await
        .unwrap()
    }

    async fn cleanup(&self, conn: &mut Conn) {
        let _ = conn
            .query_drop(&format!("DROP TABLE IF EXISTS {}", self.name), ())
            .await;
    }
}

#[tokio::test]
async fn test_copy_rows() {
    let mut conn = get_conn().await;
    let table = TestTable::new(&mut conn).await;

    conn.begin().await.unwrap();
    let mut copy = conn.copy_in(&table.copy_sql()).await.unwrap();
    for id in 1..=100 {
        let sent = copy
            .send_row(&[Value::Int4(id), Value::Text(format!("row {id}"))])
            .await
            .unwrap();
        assert_eq!(sent, None);
    }
    assert_eq!(copy.close().await.unwrap(), Some(100));
    drop(copy);
    conn.commit().await.unwrap();

    let rows = table.rows(&mut conn).await;
    assert_eq!(rows.len(), 100);
    assert_eq!(rows[0], (1, Some("row 1".to_string())));

    table.cleanup(&mut conn).await;
}

#[tokio::test]
async fn test_copy_special_characters() {
    let mut conn = get_conn().await;
    let table = TestTable::new(&mut conn).await;

    conn.begin().await.unwrap();
    let mut copy = conn.copy_in(&table.copy_sql()).await.unwrap();
    copy.send_row(&[Value::Int4(1), Value::Text("tab\there\nnewline \\ slash".into())])
        .await
        .unwrap();
    copy.send_row(&[Value::Int4(2), Value::Null]).await.unwrap();
    assert_eq!(copy.send_row(&[]).await.unwrap(), Some(2));
    drop(copy);
    conn.commit().await.unwrap();

    let rows = table.rows(&mut conn).await;
    assert_eq!(
        rows,
        vec![
            (1, Some("tab\there\nnewline \\ slash".to_string())),
            (2, None),
        ]
    );

    table.cleanup(&mut conn).await;
}

#[tokio::test]
async fn test_copy_outside_transaction() {
    let mut conn = get_conn().await;
    let table = TestTable::new(&mut conn).await;

    let err = conn.copy_in(&table.copy_sql()).await.err().unwrap();
    assert!(matches!(err, Error::InvalidUsage(_)));
    assert!(!conn.is_broken());

    table.cleanup(&mut conn).await;
}

#[tokio::test]
async fn test_copy_server_error() {
    let mut conn = get_conn().await;
    let table = TestTable::new(&mut conn).await;

    conn.begin().await.unwrap();
    let mut copy = conn.copy_in(&table.copy_sql()).await.unwrap();
    copy.send_row(&[Value::Int4(1), Value::Text("a".into())])
        .await
        .unwrap();
    copy.send_row(&[Value::Int4(1), Value::Text("again".into())])
        .await
        .unwrap();
    let err = copy.close().await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("23505"));
    drop(copy);

    assert!(!conn.is_broken());
    conn.rollback().await.unwrap();
    assert!(table.rows(&mut conn).await.is_empty());

    table.cleanup(&mut conn).await;
}

#[tokio::test]
async fn test_copy_fail() {
    let mut conn = get_conn().await;
    let table = TestTable::new(&mut conn).await;

    conn.begin().await.unwrap();
    let mut copy = conn.copy_in(&table.copy_sql()).await.unwrap();
    copy.send_row(&[Value::Int4(1), Value::Text("a".into())])
        .await
        .unwrap();
    let err = copy.fail("client gave up").await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("57014"));
    drop(copy);

    conn.rollback().await.unwrap();
    assert!(table.rows(&mut conn).await.is_empty());

    table.cleanup(&mut conn).await;
}

#[tokio::test]
async fn test_copy_rejected_statement() {
    let mut conn = get_conn().await;

    conn.begin().await.unwrap();
    let err = conn
        .copy_in("COPY table_that_does_not_exist FROM STDIN")
        .await
        .err()
        .unwrap();
    assert_eq!(err.sqlstate(), Some("42P01"));
    assert!(!conn.is_broken());
    conn.rollback().await.unwrap();
}

//! Tests for query cancellation

use std::env;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use zero_gauss::tokio::Conn;

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

#[tokio::test]
async fn test_cancel_running_query() {
    let mut conn = get_conn().await;
    let token = CancellationToken::new();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        timer.cancel();
    });

    let err = conn
        .with_cancellation(token, async |conn| {
            conn.query_drop("SELECT pg_sleep(30)", ()).await
        })
        .await
        .unwrap_err();
    assert_eq!(err.sqlstate(), Some("57014"));
    assert!(!conn.is_broken());

    let row: Option<(i32,)> = conn.query_first("SELECT 1::int4", ()).await.unwrap();
    assert_eq!(row, Some((1,)));
}

#[tokio::test]
async fn test_cancel_token_from_other_task() {
    let mut conn = get_conn().await;
    let cancel = conn.cancel_token();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel().await
    });

    let err = conn
        .query_drop("SELECT pg_sleep(30)", ())
        .await
        .unwrap_err();
    assert_eq!(err.sqlstate(), Some("57014"));
    canceller.await.unwrap().unwrap();
    conn.ping().await.unwrap();
}

#[tokio::test]
async fn test_cancel_when_idle() {
    let mut conn = get_conn().await;
    conn.cancel_token().cancel().await.unwrap();
    conn.ping().await.unwrap();
}

#[tokio::test]
async fn test_untriggered_token() {
    let mut conn = get_conn().await;
    let token = CancellationToken::new();
    let row = conn
        .with_cancellation(token, async |conn| {
            conn.query_first::<(i32,), _, _>("SELECT 2::int4", ()).await
        })
        .await
        .unwrap();
    assert_eq!(row, Some((2,)));
}

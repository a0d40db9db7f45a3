//! End-to-end protocol scenarios driven through the connection handler

use serde_json::{json, Value};
use sqlx::SqlitePool;
use tokio::sync::oneshot;

use finsync_server::config::Config;
use finsync_server::db::{create_memory_pool, Expense, Password, RecordRepository};
use finsync_server::state::AppState;
use finsync_server::sync::{ConnectionHandler, ConnectionState, MergeStats, Outcome, ServerMessage};

fn app_with(pool: SqlitePool, token_ttl_secs: u64) -> AppState {
    let mut config = Config::default();
    config.sync.public_host = Some("127.0.0.1".to_string());
    config.sync.token_ttl_secs = token_ttl_secs;
    AppState::new(config, pool)
}

async fn app() -> AppState {
    app_with(create_memory_pool().await.unwrap(), 300)
}

fn connect(app: &AppState) -> (ConnectionHandler, oneshot::Receiver<()>) {
    let (kick, rx) = oneshot::channel();
    (ConnectionHandler::new(app.clone(), kick), rx)
}

async fn send(conn: &mut ConnectionHandler, message: Value) -> Outcome {
    conn.handle_text(&message.to_string()).await
}

/// Pair a new device with the current token and return its identifier
async fn pair(app: &AppState) -> (ConnectionHandler, oneshot::Receiver<()>, String) {
    let (mut conn, kick) = connect(app);
    let token = app.tokens().current_token();
    let outcome = send(&mut conn, json!({"type": "auth", "token": token})).await;

    match outcome.replies.as_slice() {
        [ServerMessage::AuthSuccess { device_id, .. }] => {
            let device_id = device_id.clone();
            (conn, kick, device_id)
        }
        other => panic!("pairing failed: {:?}", other),
    }
}

fn expense(id: i64, description: &str, created_at: &str) -> Value {
    json!({
        "id": id,
        "description": description,
        "amount": 12.5,
        "category": "food",
        "created_at": created_at
    })
}

fn snapshot_expenses(message: &ServerMessage) -> Vec<Expense> {
    match message {
        ServerMessage::SyncData { data, .. } => data.expenses.clone(),
        other => panic!("expected sync_data, got {:?}", other),
    }
}

#[tokio::test]
async fn test_pairing_issues_hex_device_id() {
    let app = app().await;
    let (conn, _kick, device_id) = pair(&app).await;

    assert_eq!(device_id.len(), 32);
    assert!(device_id.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(matches!(conn.state(), ConnectionState::Authenticated { .. }));
}

#[tokio::test]
async fn test_push_replies_with_stats_then_snapshot() {
    let app = app().await;
    let (mut conn, _kick, _) = pair(&app).await;

    let outcome = send(
        &mut conn,
        json!({
            "type": "sync_push",
            "changes": {"expenses": [expense(7, "Groceries", "2024-05-01T10:00:00Z")]}
        }),
    )
    .await;

    assert!(!outcome.close);
    assert_eq!(outcome.replies.len(), 2);
    match &outcome.replies[0] {
        ServerMessage::SyncSuccess { stats, message } => {
            assert_eq!(
                *stats,
                MergeStats {
                    processed: 1,
                    skipped: 0,
                    errors: 0
                }
            );
            assert!(message.contains("1 processed"));
        }
        other => panic!("expected sync_success, got {:?}", other),
    }
    let expenses = snapshot_expenses(&outcome.replies[1]);
    assert!(expenses.iter().any(|e| e.id == 7 && e.description == "Groceries"));
}

#[tokio::test]
async fn test_sync_request_returns_every_kind() {
    let app = app().await;
    RecordRepository::new(app.db())
        .upsert(&Password {
            id: 1,
            title: "Bank".to_string(),
            username: Some("me".to_string()),
            password: "hunter2".to_string(),
            url: None,
            notes: None,
            created_at: "2024-01-01T00:00:00Z".to_string(),
        })
        .await
        .unwrap();

    let (mut conn, _kick, _) = pair(&app).await;
    let outcome = send(&mut conn, json!({"type": "sync_request"})).await;

    assert_eq!(outcome.replies.len(), 1);
    let wire: Value = serde_json::from_str(&outcome.replies[0].to_json().unwrap()).unwrap();
    assert_eq!(wire["type"], "sync_data");
    assert!(wire["timestamp"].is_string());
    for key in ["expenses", "incomes", "debts", "people", "passwords"] {
        assert!(wire["data"][key].is_array(), "{}", key);
    }
    assert_eq!(wire["data"]["passwords"][0]["title"], "Bank");
}

#[tokio::test]
async fn test_pushed_passwords_are_ignored() {
    let app = app().await;
    let (mut conn, _kick, _) = pair(&app).await;

    let outcome = send(
        &mut conn,
        json!({
            "type": "sync_push",
            "changes": {
                "passwords": [{
                    "id": 1,
                    "title": "Injected",
                    "password": "x",
                    "created_at": "2024-01-01T00:00:00Z"
                }]
            }
        }),
    )
    .await;

    match &outcome.replies[0] {
        ServerMessage::SyncSuccess { stats, .. } => assert_eq!(*stats, MergeStats::default()),
        other => panic!("expected sync_success, got {:?}", other),
    }
    match &outcome.replies[1] {
        ServerMessage::SyncData { data, .. } => assert!(data.passwords.is_empty()),
        other => panic!("expected sync_data, got {:?}", other),
    }
}

#[tokio::test]
async fn test_persistent_reconnect_after_token_expiry() {
    let pool = create_memory_pool().await.unwrap();
    let first = app_with(pool.clone(), 300);
    let (mut conn, _kick, device_id) = pair(&first).await;
    conn.close();

    // Same store, but the pairing token is already expired.
    let later = app_with(pool, 0);
    assert!(!later.tokens().is_valid());

    let (mut conn, _kick) = connect(&later);
    let outcome = send(&mut conn, json!({"type": "auth", "persistentId": device_id})).await;
    assert_eq!(
        outcome.replies,
        vec![ServerMessage::AuthSuccess {
            device_id: device_id.clone(),
            persistent: true
        }]
    );

    let (mut stranger, _kick) = connect(&later);
    let token = later.tokens().peek().value;
    let outcome = send(&mut stranger, json!({"type": "auth", "token": token})).await;
    assert!(outcome.close);
    assert_eq!(
        outcome.replies,
        vec![ServerMessage::AuthFailed {
            reason: "Token expired".to_string()
        }]
    );
}

#[tokio::test]
async fn test_invalid_token_fails_and_closes() {
    let app = app().await;
    let (mut conn, _kick) = connect(&app);

    let outcome = send(&mut conn, json!({"type": "auth", "token": "not-the-token"})).await;

    assert!(outcome.close);
    assert_eq!(
        outcome.replies,
        vec![ServerMessage::AuthFailed {
            reason: "Invalid or expired token".to_string()
        }]
    );
    assert_eq!(conn.state(), &ConnectionState::Closed);
    assert_eq!(app.registry().paired_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_rotated_token_rejects_old_value() {
    let app = app().await;
    let old = app.tokens().current_token();
    let new = app.tokens().rotate().value;
    assert_ne!(old, new);

    let (mut conn, _kick) = connect(&app);
    let outcome = send(&mut conn, json!({"type": "auth", "token": old})).await;
    assert!(outcome.close);

    let (mut conn, _kick) = connect(&app);
    let outcome = send(&mut conn, json!({"type": "auth", "token": new})).await;
    assert!(matches!(
        outcome.replies.as_slice(),
        [ServerMessage::AuthSuccess { .. }]
    ));
}

#[tokio::test]
async fn test_revoked_device_is_kicked_and_cannot_reconnect() {
    let app = app().await;
    let (_conn, kick, device_id) = pair(&app).await;

    assert!(app.registry().revoke(&device_id).await.unwrap());
    kick.await.expect("live connection should be kicked");
    assert_eq!(app.registry().live_count(), 0);

    let (mut conn, _kick) = connect(&app);
    let outcome = send(&mut conn, json!({"type": "auth", "persistentId": device_id})).await;
    assert!(outcome.close);
    assert_eq!(
        outcome.replies,
        vec![ServerMessage::AuthFailed {
            reason: "Unknown device".to_string()
        }]
    );

    assert!(!app.registry().revoke(&device_id).await.unwrap());
}

async fn push_from(conn: &mut ConnectionHandler, record: Value) {
    let outcome = send(
        conn,
        json!({"type": "sync_push", "changes": {"expenses": [record]}}),
    )
    .await;
    assert!(matches!(
        outcome.replies.first(),
        Some(ServerMessage::SyncSuccess { .. })
    ));
}

#[tokio::test]
async fn test_newer_write_wins_in_either_order() {
    let older = expense(9, "Older", "2024-01-01T00:00:00Z");
    let newer = expense(9, "Newer", "2024-01-02T00:00:00Z");

    for (first, second) in [(&older, &newer), (&newer, &older)] {
        let app = app().await;
        let (mut a, _ka, _) = pair(&app).await;
        let (mut b, _kb, _) = pair(&app).await;

        push_from(&mut a, first.clone()).await;
        push_from(&mut b, second.clone()).await;

        let stored: Expense = RecordRepository::new(app.db())
            .fetch_one(9)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.description, "Newer");
    }
}

#[tokio::test]
async fn test_unauthenticated_requests_get_error_without_close() {
    let app = app().await;
    let (mut conn, _kick) = connect(&app);

    let outcome = send(&mut conn, json!({"type": "sync_request"})).await;
    assert!(!outcome.close);
    assert_eq!(
        outcome.replies,
        vec![ServerMessage::Error {
            message: "Not authenticated".to_string()
        }]
    );
    assert_eq!(conn.state(), &ConnectionState::Unauthenticated);

    let outcome = send(&mut conn, json!({"type": "sync_push", "changes": {}})).await;
    assert!(!outcome.close);
    assert!(matches!(
        outcome.replies.as_slice(),
        [ServerMessage::Error { .. }]
    ));
}

#[tokio::test]
async fn test_ping_answered_in_any_state() {
    let app = app().await;
    let (mut conn, _kick) = connect(&app);
    let outcome = send(&mut conn, json!({"type": "ping"})).await;
    assert_eq!(outcome.replies, vec![ServerMessage::Pong]);

    let (mut conn, _kick, _) = pair(&app).await;
    let outcome = send(&mut conn, json!({"type": "ping"})).await;
    assert_eq!(outcome.replies, vec![ServerMessage::Pong]);
}

#[tokio::test]
async fn test_unknown_type_is_ignored_once_authenticated() {
    let app = app().await;
    let (mut conn, _kick, _) = pair(&app).await;

    let outcome = send(&mut conn, json!({"type": "subscribe", "topic": "all"})).await;
    assert!(outcome.replies.is_empty());
    assert!(!outcome.close);
    assert!(matches!(conn.state(), ConnectionState::Authenticated { .. }));
}

#[tokio::test]
async fn test_malformed_frame_gets_error_and_keeps_channel() {
    let app = app().await;
    let (mut conn, _kick, device_id) = pair(&app).await;

    let outcome = conn.handle_text("{not json").await;
    assert!(!outcome.close);
    assert_eq!(
        outcome.replies,
        vec![ServerMessage::Error {
            message: "Invalid message format".to_string()
        }]
    );
    assert_eq!(conn.device_id(), Some(device_id.as_str()));
}

#[tokio::test]
async fn test_reauth_on_bound_connection_confirms_identity() {
    let app = app().await;
    let (mut conn, _kick, device_id) = pair(&app).await;

    let outcome = send(&mut conn, json!({"type": "auth", "token": "anything"})).await;
    assert_eq!(
        outcome.replies,
        vec![ServerMessage::AuthSuccess {
            device_id,
            persistent: true
        }]
    );
    assert_eq!(app.registry().paired_count().await.unwrap(), 1);
}

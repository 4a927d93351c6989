//! PostgreSQL store tests. Skipped unless TEST_DATABASE_URL is set.

use chat_service::models::{Message, Session};
use chat_service::services::{AppendOutcome, ChatStore, PgChatStore};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

macro_rules! skip_without_database {
    () => {
        match std::env::var("TEST_DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                eprintln!("Skipping PostgreSQL test (TEST_DATABASE_URL is not set)");
                return;
            }
        }
    };
}

async fn connect(url: &str) -> PgChatStore {
    let store = PgChatStore::new(url, 5, 1)
        .await
        .expect("Failed to connect to test database");
    store.run_migrations().await.expect("Failed to run migrations");
    store
}

async fn new_session(store: &PgChatStore) -> Session {
    store
        .create_session(&Session::new(format!("test-{}", Uuid::new_v4()), "echo".into()))
        .await
        .expect("Failed to create session")
}

#[tokio::test]
async fn messages_round_trip_in_creation_order() {
    let url = skip_without_database!();
    let store = connect(&url).await;
    let session = new_session(&store).await;

    let user = Message::user(session.id, "hello".into(), vec!["a.png".into()]);
    store.append_message(&user).await.unwrap();
    let reply = Message::assistant(Uuid::new_v4(), session.id, "hi".into(), 1, Some("hello".into()));
    store.append_message(&reply).await.unwrap();

    let messages = store.list_messages(session.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, user.id);
    assert_eq!(messages[0].images, vec!["a.png".to_string()]);
    assert!(messages.iter().all(Message::fingerprint_is_consistent));

    let recent = store.recent_messages(session.id, 1).await.unwrap();
    assert_eq!(recent[0].id, reply.id);

    let refreshed = store.get_session(session.id).await.unwrap().unwrap();
    assert!(refreshed.updated_at >= session.updated_at);

    assert!(store.delete_session(session.id).await.unwrap());
    assert!(store.find_message(user.id).await.unwrap().is_none());
}

#[tokio::test]
async fn append_to_missing_session_fails() {
    let url = skip_without_database!();
    let store = connect(&url).await;

    let orphan = Message::user(Uuid::new_v4(), "lost".into(), vec![]);
    assert!(store.append_message(&orphan).await.is_err());
}

#[tokio::test]
async fn concurrent_conditional_appends_insert_once() {
    let url = skip_without_database!();
    let store = Arc::new(connect(&url).await);
    let session = new_session(&store).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let session_id = session.id;
        handles.push(tokio::spawn(async move {
            let message = Message::assistant(Uuid::new_v4(), session_id, "same".into(), 0, None);
            store
                .append_unless_duplicate(&message, Duration::from_secs(30))
                .await
                .unwrap()
        }));
    }

    let mut inserted = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), AppendOutcome::Inserted(_)) {
            inserted += 1;
        }
    }
    assert_eq!(inserted, 1);
    assert_eq!(store.list_messages(session.id).await.unwrap().len(), 1);

    store.delete_session(session.id).await.unwrap();
}

//! SQLite store tests: pagination, status transitions, namespaces.

use chrono::{Duration, Utc};
use tempfile::TempDir;

use pagewise::db;
use pagewise::migrate;
use pagewise::sqlite_store::SqliteStore;
use pagewise_core::models::{
    Document, IngestionStatus, Message, PageRequest, StatusTransition,
};
use pagewise_core::store::{IndexEntry, RecordStore, VectorIndex};

async fn open() -> (TempDir, SqliteStore) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("store.sqlite"))
        .await
        .unwrap();
    migrate::apply(&pool).await.unwrap();
    (tmp, SqliteStore::new(pool))
}

async fn document(store: &SqliteStore, user: &str, key: &str) -> Document {
    let doc = Document::new_processing(user, key, key, "");
    store.insert_document(&doc).await.unwrap();
    doc
}

async fn seed(store: &SqliteStore, doc: &Document, n: usize) {
    let base = Utc::now() - Duration::minutes(10);
    for i in 0..n {
        let mut m = Message::user(&doc.id, &doc.user_id, format!("m{}", i));
        m.created_at = base + Duration::seconds(i as i64);
        store.insert_message(&m).await.unwrap();
    }
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (_tmp, store) = open().await;
    migrate::apply(store.pool()).await.unwrap();
    let doc = document(&store, "u1", "k").await;
    assert!(store.get_document(&doc.id).await.unwrap().is_some());
}

#[tokio::test]
async fn pages_walk_history_newest_first() {
    let (_tmp, store) = open().await;
    let doc = document(&store, "u1", "k").await;
    seed(&store, &doc, 25).await;

    let mut seen = Vec::new();
    let mut cursor = None;
    let mut sizes = Vec::new();
    loop {
        let req = PageRequest::new(Some(10), cursor).unwrap();
        let page = store.list_messages(&doc.id, "u1", &req).await.unwrap();
        sizes.push(page.messages.len());
        seen.extend(page.messages.into_iter().map(|m| m.text));
        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
    }

    assert_eq!(sizes, [10, 10, 5]);
    let expected: Vec<String> = (0..25).rev().map(|i| format!("m{}", i)).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn unknown_cursor_yields_empty_page() {
    let (_tmp, store) = open().await;
    let doc = document(&store, "u1", "k").await;
    seed(&store, &doc, 3).await;

    let req = PageRequest::new(Some(10), Some("no-such-id".into())).unwrap();
    let page = store.list_messages(&doc.id, "u1", &req).await.unwrap();
    assert!(page.messages.is_empty());
    assert_eq!(page.next_cursor, None);
}

#[tokio::test]
async fn messages_are_scoped_to_their_owner() {
    let (_tmp, store) = open().await;
    let doc = document(&store, "u1", "k").await;
    seed(&store, &doc, 2).await;

    let page = store
        .list_messages(&doc.id, "u2", &PageRequest::first(10).unwrap())
        .await
        .unwrap();
    assert!(page.messages.is_empty());
}

#[tokio::test]
async fn status_transitions_follow_the_table() {
    let (_tmp, store) = open().await;
    let doc = document(&store, "u1", "k").await;

    assert_eq!(
        store
            .transition_status(&doc.id, IngestionStatus::Success)
            .await
            .unwrap(),
        StatusTransition::Applied {
            from: IngestionStatus::Processing
        }
    );
    // Terminal SUCCESS never moves back.
    assert_eq!(
        store
            .transition_status(&doc.id, IngestionStatus::Failed)
            .await
            .unwrap(),
        StatusTransition::Rejected {
            current: IngestionStatus::Success
        }
    );
    assert_eq!(
        store
            .transition_status(&doc.id, IngestionStatus::Processing)
            .await
            .unwrap(),
        StatusTransition::Rejected {
            current: IngestionStatus::Success
        }
    );
    assert_eq!(
        store
            .transition_status("missing", IngestionStatus::Success)
            .await
            .unwrap(),
        StatusTransition::Missing
    );

    let other = document(&store, "u1", "k2").await;
    store
        .transition_status(&other.id, IngestionStatus::Failed)
        .await
        .unwrap();
    assert!(matches!(
        store
            .transition_status(&other.id, IngestionStatus::Processing)
            .await
            .unwrap(),
        StatusTransition::Applied { .. }
    ));
}

#[tokio::test]
async fn documents_are_found_by_key_per_owner() {
    let (_tmp, store) = open().await;
    let doc = document(&store, "u1", "uploads/a.pdf").await;
    document(&store, "u2", "uploads/b.pdf").await;

    let found = store
        .find_document_by_key("uploads/a.pdf", "u1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, doc.id);
    assert!(store
        .find_document_by_key("uploads/a.pdf", "u2")
        .await
        .unwrap()
        .is_none());
    assert_eq!(store.list_documents("u1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn users_are_created_once() {
    let (_tmp, store) = open().await;
    let first = store.ensure_user("u1", "a@example.com").await.unwrap();
    let again = store.ensure_user("u1", "changed@example.com").await.unwrap();
    assert_eq!(first, again);
    assert_eq!(again.email, "a@example.com");
}

#[tokio::test]
async fn namespace_writes_replace_and_stay_isolated() {
    let (_tmp, store) = open().await;
    let first = vec![
        IndexEntry::new("a", 1, "one", vec![1.0, 0.0]),
        IndexEntry::new("a", 2, "two", vec![0.0, 1.0]),
    ];
    store.write_namespace("a", &first).await.unwrap();
    store.write_namespace("a", &first).await.unwrap();
    assert_eq!(store.namespace_len("a").await.unwrap(), 2);

    store
        .write_namespace("b", &[IndexEntry::new("b", 1, "bee", vec![1.0, 0.0])])
        .await
        .unwrap();

    let hits = store.query_namespace("a", &[0.0, 1.0], 1).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].page_number, 2);
    assert_eq!(hits[0].text, "two");

    let hits = store.query_namespace("b", &[0.0, 1.0], 5).await.unwrap();
    assert!(hits.iter().all(|h| h.text == "bee"));

    store
        .write_namespace("a", &[IndexEntry::new("a", 1, "only", vec![1.0, 0.0])])
        .await
        .unwrap();
    assert_eq!(store.namespace_len("a").await.unwrap(), 1);

    store.purge_namespace("a").await.unwrap();
    assert_eq!(store.namespace_len("a").await.unwrap(), 0);
    assert_eq!(store.namespace_len("b").await.unwrap(), 1);
}

#[tokio::test]
async fn delete_removes_document_and_messages() {
    let (_tmp, store) = open().await;
    let doc = document(&store, "u1", "k").await;
    seed(&store, &doc, 3).await;

    assert!(store.delete_document(&doc.id).await.unwrap());
    assert!(store.get_document(&doc.id).await.unwrap().is_none());
    let page = store
        .list_messages(&doc.id, "u1", &PageRequest::first(10).unwrap())
        .await
        .unwrap();
    assert!(page.messages.is_empty());
    assert!(!store.delete_document(&doc.id).await.unwrap());
}

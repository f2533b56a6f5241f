//! Invalidation across handles on the same file.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, file_builder, insert, words};
use depot_runtime::{observer_fn, Database, JournalMode};
use futures::StreamExt;

fn shared(dir: &std::path::Path) -> Database {
    file_builder(dir, 1)
        .enable_multi_instance_invalidation()
        .invalidation_poll_interval(Duration::from_millis(50))
        .build()
        .unwrap()
}

fn counting(db: &Database) -> (Arc<AtomicUsize>, depot_runtime::Subscription) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let subscription = db
        .subscribe(Arc::new(observer_fn(
            ["word_table"],
            move |_: &BTreeSet<String>| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )))
        .unwrap();
    (calls, subscription)
}

#[tokio::test]
async fn test_write_in_one_handle_notifies_the_other() {
    let dir = tempfile::tempdir().unwrap();
    let writer = shared(dir.path());
    let reader = shared(dir.path());
    writer.open().await.unwrap();
    reader.open().await.unwrap();

    let (reader_calls, _reader_sub) = counting(&reader);
    let (writer_calls, _writer_sub) = counting(&writer);

    insert(&writer, "Hello").await.unwrap();
    assert!(eventually(|| reader_calls.load(Ordering::SeqCst) >= 1).await);
    assert_eq!(words(&reader).await.unwrap(), vec!["Hello"]);

    assert!(eventually(|| writer_calls.load(Ordering::SeqCst) >= 1).await);
}

#[tokio::test]
async fn test_live_query_follows_other_handle() {
    let dir = tempfile::tempdir().unwrap();
    let writer = shared(dir.path());
    let reader = shared(dir.path());
    reader.open().await.unwrap();

    let db = reader.clone();
    let mut live = reader.live_query(&["word_table"], move || {
        let db = db.clone();
        async move { words(&db).await }
    });
    assert!(live.next().await.unwrap().unwrap().is_empty());

    insert(&writer, "Hello").await.unwrap();
    let next = tokio::time::timeout(Duration::from_secs(5), live.next())
        .await
        .unwrap();
    assert_eq!(next.unwrap().unwrap(), vec!["Hello"]);
}

#[tokio::test]
async fn test_exclusive_handle_blocks_shared() {
    let dir = tempfile::tempdir().unwrap();
    let _exclusive = file_builder(dir.path(), 1).build().unwrap();
    assert!(matches!(
        file_builder(dir.path(), 1)
            .enable_multi_instance_invalidation()
            .build(),
        Err(depot_runtime::Error::AlreadyOpen(_))
    ));
}

#[tokio::test]
async fn test_requires_write_ahead_logging() {
    let dir = tempfile::tempdir().unwrap();
    let result = file_builder(dir.path(), 1)
        .journal_mode(JournalMode::Truncate)
        .enable_multi_instance_invalidation()
        .build();
    assert!(matches!(result, Err(depot_runtime::Error::Config(_))));
}

//! Writes whose foreign key actions change other tables.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::eventually;
use depot_runtime::sqlx;
use depot_runtime::{
    observer_fn, Affinity, Database, DatabaseBundle, Entity, Field, ForeignKey, ForeignKeyAction,
};

fn library() -> DatabaseBundle {
    let author = Entity::new("author")
        .field(Field::new("id", Affinity::Integer).not_null())
        .field(Field::new("name", Affinity::Text).not_null())
        .primary_key(&["id"]);
    let book = Entity::new("book")
        .field(Field::new("id", Affinity::Integer).not_null())
        .field(Field::new("author_id", Affinity::Integer).not_null())
        .primary_key(&["id"])
        .foreign_key(ForeignKey {
            table: "author".into(),
            columns: vec!["author_id".into()],
            referenced_columns: vec!["id".into()],
            on_delete: ForeignKeyAction::Cascade,
            on_update: ForeignKeyAction::NoAction,
            deferred: false,
        });
    DatabaseBundle::new(1, vec![author, book], Vec::new()).unwrap()
}

async fn execute(db: &Database, sql: &str, table: &str) -> u64 {
    let mut tx = db.begin_write().await.unwrap();
    let affected = sqlx::query(sql)
        .execute(tx.connection())
        .await
        .unwrap()
        .rows_affected();
    if affected > 0 {
        for table in db.bundle().affected_tables(table) {
            tx.touch(&table);
        }
    }
    tx.commit().await.unwrap();
    affected
}

#[tokio::test]
async fn test_cascading_delete_notifies_child_observers() {
    let db = Database::in_memory_builder(library()).build().unwrap();
    execute(&db, "INSERT INTO author (id, name) VALUES (1, 'Ada')", "author").await;
    execute(&db, "INSERT INTO book (id, author_id) VALUES (10, 1), (11, 1)", "book").await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let _subscription = db
        .subscribe(Arc::new(observer_fn(
            ["book"],
            move |tables: &BTreeSet<String>| {
                if tables.contains("book") {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        )))
        .unwrap();

    assert_eq!(execute(&db, "DELETE FROM author WHERE id = 1", "author").await, 1);
    assert!(eventually(|| calls.load(Ordering::SeqCst) == 1).await);

    let mut conn = db.acquire().await.unwrap();
    let books: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM book")
        .fetch_one(&mut *conn)
        .await
        .unwrap();
    assert_eq!(books, 0);
}

#[tokio::test]
async fn test_child_write_does_not_reach_parent() {
    let db = Database::in_memory_builder(library()).build().unwrap();
    assert_eq!(db.bundle().affected_tables("book"), vec!["book"]);
    assert_eq!(db.bundle().affected_tables("author"), vec!["author", "book"]);
}

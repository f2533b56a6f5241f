#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use depot_runtime::sqlx;
use depot_runtime::{
    Affinity, Database, DatabaseBuilder, DatabaseBundle, Entity, Field, Migration, Result,
};

/// The word schema at `version`:
///
/// - 1: `word_table(word TEXT NOT NULL PRIMARY KEY)`
/// - 2: adds `date INTEGER NOT NULL DEFAULT 0`
/// - 3: adds the `tag` table
/// - 4: adds a nullable `length INTEGER` to `word_table`
pub fn words_bundle(version: u32) -> DatabaseBundle {
    let mut word = Entity::new("word_table").field(Field::new("word", Affinity::Text).not_null());
    if version >= 2 {
        word = word.field(
            Field::new("date", Affinity::Integer)
                .not_null()
                .default_value("0"),
        );
    }
    if version >= 4 {
        word = word.field(Field::new("length", Affinity::Integer));
    }
    let mut entities = vec![word.primary_key(&["word"])];
    if version >= 3 {
        entities.push(
            Entity::new("tag")
                .field(Field::new("id", Affinity::Integer).not_null())
                .field(Field::new("name", Affinity::Text))
                .auto_generated_key("id"),
        );
    }
    DatabaseBundle::new(version, entities, Vec::new()).unwrap()
}

/// Hand-written migrations between consecutive word schemas.
pub fn step_migrations() -> Vec<Migration> {
    vec![
        Migration::new(
            1,
            2,
            vec!["ALTER TABLE word_table ADD COLUMN date INTEGER NOT NULL DEFAULT 0".to_string()],
        ),
        Migration::new(
            2,
            3,
            vec![
                "CREATE TABLE tag (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL, name TEXT)"
                    .to_string(),
            ],
        ),
        Migration::new(
            3,
            4,
            vec!["ALTER TABLE word_table ADD COLUMN length INTEGER".to_string()],
        ),
    ]
}

pub fn file_builder(dir: &Path, version: u32) -> DatabaseBuilder {
    Database::builder("words.db", words_bundle(version)).directory(dir)
}

/// Creates `words.db` in `dir` at `version` holding `words`, then closes it.
pub async fn seed(dir: &Path, version: u32, words: &[&str]) {
    let db = file_builder(dir, version).build().unwrap();
    for word in words {
        insert(&db, word).await.unwrap();
    }
    db.close().await;
}

pub async fn insert(db: &Database, word: &str) -> Result<u64> {
    let mut tx = db.begin_write().await?;
    let result = sqlx::query("INSERT OR IGNORE INTO word_table (word) VALUES (?)")
        .bind(word)
        .execute(tx.connection())
        .await?;
    if result.rows_affected() > 0 {
        tx.touch("word_table");
    }
    tx.commit().await?;
    Ok(result.rows_affected())
}

pub async fn words(db: &Database) -> Result<Vec<String>> {
    let mut conn = db.acquire().await?;
    Ok(sqlx::query_scalar("SELECT word FROM word_table ORDER BY word")
        .fetch_all(&mut *conn)
        .await?)
}

/// Waits up to five seconds for `check` to hold.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

//! The master table.
//!
//! `depot_master_table` holds one row, at id 42, with the identity hash of
//! the schema the database was created or migrated to. The schema version
//! itself lives in `PRAGMA user_version`.

use sqlx::SqliteConnection;

use crate::error::Result;

/// Name of the master table.
pub const MASTER_TABLE: &str = "depot_master_table";

/// Id of the single row.
pub const MASTER_ROW_ID: i64 = 42;

/// SQL to create the master table.
pub const CREATE_MASTER_TABLE_SQL: &str =
    "CREATE TABLE IF NOT EXISTS depot_master_table (id INTEGER PRIMARY KEY, identity_hash TEXT)";

/// Ensures the master table exists.
pub async fn ensure_table(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(CREATE_MASTER_TABLE_SQL).execute(conn).await?;
    Ok(())
}

/// Reads the stored identity hash. `None` when the table or row is missing.
pub async fn read_identity_hash(conn: &mut SqliteConnection) -> Result<Option<String>> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
    )
    .bind(MASTER_TABLE)
    .fetch_one(&mut *conn)
    .await?;
    if !exists {
        return Ok(None);
    }
    let hash: Option<Option<String>> =
        sqlx::query_scalar("SELECT identity_hash FROM depot_master_table WHERE id = ?")
            .bind(MASTER_ROW_ID)
            .fetch_optional(conn)
            .await?;
    Ok(hash.flatten())
}

/// Writes the identity hash, creating the table if needed.
pub async fn write_identity_hash(conn: &mut SqliteConnection, hash: &str) -> Result<()> {
    ensure_table(&mut *conn).await?;
    sqlx::query("INSERT OR REPLACE INTO depot_master_table (id, identity_hash) VALUES (?, ?)")
        .bind(MASTER_ROW_ID)
        .bind(hash)
        .execute(conn)
        .await?;
    Ok(())
}

/// Reads `PRAGMA user_version`.
pub async fn read_version(conn: &mut SqliteConnection) -> Result<u32> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(conn)
        .await?;
    // user_version is a signed 32-bit header field.
    Ok(u32::try_from(version).unwrap_or(0))
}

/// Writes `PRAGMA user_version`.
pub async fn write_version(conn: &mut SqliteConnection, version: u32) -> Result<()> {
    sqlx::query(&format!("PRAGMA user_version = {version}"))
        .execute(conn)
        .await?;
    Ok(())
}

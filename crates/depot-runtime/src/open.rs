//! Opening a database: creation, migration and validation.
//!
//! One open attempt walks a small state machine:
//!
//! - a fresh database (`user_version` 0) is created from the schema
//! - a database at the current version has its identity hash checked
//! - otherwise a migration path is computed and applied, one transaction per
//!   migration, and the resulting schema is validated
//! - without a path the database is either accepted as compatible,
//!   recreated, or rejected with [`Error::MissingMigration`]

use std::collections::BTreeSet;
use std::path::Path;

use depot_schema::{Affinity, DatabaseBundle, Entity};
use sqlx::{Connection, SqliteConnection};
use tracing::{debug, error, info, warn};

use crate::config::PrepackagedSource;
use crate::error::{ConstraintKind, Error, Result};
use crate::invalidation::CREATE_INVALIDATION_LOG;
use crate::master;
use crate::migration::{Migration, MigrationContainer};

/// States of one open attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenState {
    /// Nothing checked yet.
    Unvalidated,
    /// The schema was created from scratch.
    Created,
    /// A migration path was found.
    PathComputed,
    /// Migrations are running.
    Applying,
    /// The schema matches. Terminal success.
    Validated,
    /// No migration path exists.
    NoPath,
    /// Every table was dropped and the schema recreated.
    DestructiveRecreate,
    /// The open failed.
    Fatal,
}

/// Outcome of a successful open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenReport {
    /// Version found in the database.
    pub stored_version: u32,
    /// Version of the schema.
    pub version: u32,
    /// States passed through, in order.
    pub transitions: Vec<OpenState>,
    /// Migrations applied, as `(from, to)`.
    pub applied: Vec<(u32, u32)>,
    /// Identity hash stored in the database.
    pub identity_hash: String,
}

impl OpenReport {
    fn new(stored_version: u32, version: u32) -> Self {
        Self {
            stored_version,
            version,
            transitions: vec![OpenState::Unvalidated],
            applied: Vec::new(),
            identity_hash: String::new(),
        }
    }

    fn enter(&mut self, state: OpenState) {
        debug!(state = ?state, "Open state");
        self.transitions.push(state);
    }

    /// Final state.
    #[must_use]
    pub fn state(&self) -> OpenState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(OpenState::Unvalidated)
    }

    /// Returns true if the database was recreated, losing its data.
    #[must_use]
    pub fn was_recreated(&self) -> bool {
        self.transitions.contains(&OpenState::DestructiveRecreate)
    }
}

/// Migration policy for one open.
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions<'a> {
    pub migrations: &'a MigrationContainer,
    pub require_migration: bool,
    pub allow_destructive_on_downgrade: bool,
    pub not_required_from: &'a BTreeSet<u32>,
    pub multi_instance: bool,
}

/// Brings the database behind `conn` to the schema of `bundle`.
pub async fn open_database(
    conn: &mut SqliteConnection,
    bundle: &DatabaseBundle,
    options: &OpenOptions<'_>,
) -> Result<OpenReport> {
    let stored = master::read_version(&mut *conn).await?;
    let target = bundle.version;
    let mut report = OpenReport::new(stored, target);
    info!(from = stored, to = target, "Opening database");

    if stored == 0 {
        create_schema(conn, bundle).await?;
        report.enter(OpenState::Created);
        report.enter(OpenState::Validated);
    } else if stored == target {
        check_identity(conn, bundle).await?;
        report.enter(OpenState::Validated);
    } else if let Some(path) = options.migrations.find_path(stored, target) {
        report.enter(OpenState::PathComputed);
        report.enter(OpenState::Applying);
        for migration in path {
            if let Err(e) = apply_migration(conn, migration).await {
                report.enter(OpenState::Fatal);
                error!(from = migration.from, to = migration.to, error = %e, "Migration failed");
                return Err(Error::MigrationFailed {
                    from: migration.from,
                    to: migration.to,
                    source: Box::new(e),
                });
            }
            report.applied.push((migration.from, migration.to));
        }
        validate_schema(conn, bundle).await?;
        write_identity(conn, bundle).await?;
        report.enter(OpenState::Validated);
    } else {
        report.enter(OpenState::NoPath);
        if options.not_required_from.contains(&stored) {
            info!(from = stored, to = target, "Migration not required");
            let mut tx = conn.begin().await?;
            master::write_identity_hash(&mut tx, &bundle.identity_hash).await?;
            master::write_version(&mut tx, target).await?;
            tx.commit().await?;
            report.enter(OpenState::Validated);
        } else if !options.require_migration
            || (stored > target && options.allow_destructive_on_downgrade)
        {
            warn!(from = stored, to = target, "No migration path, recreating the database");
            recreate_schema(conn, bundle).await?;
            report.enter(OpenState::DestructiveRecreate);
        } else {
            report.enter(OpenState::Fatal);
            error!(from = stored, to = target, "No migration path");
            return Err(Error::MissingMigration {
                from: stored,
                to: target,
            });
        }
    }

    if options.multi_instance {
        sqlx::query(CREATE_INVALIDATION_LOG)
            .execute(&mut *conn)
            .await?;
    }
    report.identity_hash = bundle.identity_hash.clone();
    Ok(report)
}

async fn create_schema(conn: &mut SqliteConnection, bundle: &DatabaseBundle) -> Result<()> {
    let mut tx = conn.begin().await?;
    for sql in bundle.create_statements() {
        debug!(sql = %sql, "Executing SQL");
        sqlx::query(&sql).execute(&mut *tx).await?;
    }
    master::write_identity_hash(&mut tx, &bundle.identity_hash).await?;
    master::write_version(&mut tx, bundle.version).await?;
    tx.commit().await?;
    info!(version = bundle.version, "Created database schema");
    Ok(())
}

async fn check_identity(conn: &mut SqliteConnection, bundle: &DatabaseBundle) -> Result<()> {
    match master::read_identity_hash(&mut *conn).await? {
        Some(found) if found != bundle.identity_hash => Err(Error::IdentityMismatch {
            expected: bundle.identity_hash.clone(),
            found,
        }),
        Some(_) => Ok(()),
        None => master::write_identity_hash(conn, &bundle.identity_hash).await,
    }
}

async fn write_identity(conn: &mut SqliteConnection, bundle: &DatabaseBundle) -> Result<()> {
    master::write_identity_hash(&mut *conn, &bundle.identity_hash).await?;
    let stored = master::read_identity_hash(conn).await?;
    if stored.as_deref() != Some(bundle.identity_hash.as_str()) {
        return Err(Error::InternalConsistency(format!(
            "identity hash {} was not stored, found {stored:?}",
            bundle.identity_hash
        )));
    }
    Ok(())
}

async fn set_foreign_keys(conn: &mut SqliteConnection, enabled: bool) -> Result<()> {
    let value = if enabled { "ON" } else { "OFF" };
    sqlx::query(&format!("PRAGMA foreign_keys = {value}"))
        .execute(conn)
        .await?;
    Ok(())
}

/// Applies one migration in its own transaction.
async fn apply_migration(conn: &mut SqliteConnection, migration: &Migration) -> Result<()> {
    info!(
        from = migration.from,
        to = migration.to,
        steps = migration.steps.len(),
        auto = migration.auto,
        "Applying migration"
    );
    if migration.foreign_keys_off {
        set_foreign_keys(&mut *conn, false).await?;
    }
    let result = run_migration(&mut *conn, migration).await;
    if migration.foreign_keys_off {
        let restored = set_foreign_keys(conn, true).await;
        result?;
        return restored;
    }
    result
}

async fn run_migration(conn: &mut SqliteConnection, migration: &Migration) -> Result<()> {
    let mut tx = conn.begin().await?;
    for step in &migration.steps {
        step.apply(&mut tx).await?;
    }
    if migration.foreign_keys_off {
        check_foreign_keys(&mut tx).await?;
    }
    master::write_version(&mut tx, migration.to).await?;
    tx.commit().await?;
    Ok(())
}

async fn check_foreign_keys(conn: &mut SqliteConnection) -> Result<()> {
    let violations: Vec<(String, String)> =
        sqlx::query_as("SELECT \"table\", parent FROM pragma_foreign_key_check")
            .fetch_all(conn)
            .await?;
    match violations.first() {
        Some((table, parent)) => Err(Error::ConstraintViolation {
            kind: ConstraintKind::ForeignKey,
            message: format!(
                "{} row(s) violate foreign keys, first in '{table}' referencing '{parent}'",
                violations.len()
            ),
        }),
        None => Ok(()),
    }
}

/// Compares the physical tables with the schema.
pub async fn validate_schema(conn: &mut SqliteConnection, bundle: &DatabaseBundle) -> Result<()> {
    for entity in &bundle.entities {
        let columns: Vec<(String, String, bool, i64)> =
            sqlx::query_as("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?)")
                .bind(&entity.table_name)
                .fetch_all(&mut *conn)
                .await?;
        if let Some(problem) = table_problem(entity, &columns) {
            return Err(Error::InternalConsistency(format!(
                "migration didn't properly handle table '{}': {problem}",
                entity.table_name
            )));
        }
    }
    for view in &bundle.views {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'view' AND name = ?)",
        )
        .bind(&view.name)
        .fetch_one(&mut *conn)
        .await?;
        if !exists {
            return Err(Error::InternalConsistency(format!(
                "migration didn't properly handle view '{}': it does not exist",
                view.name
            )));
        }
    }
    Ok(())
}

fn table_problem(entity: &Entity, columns: &[(String, String, bool, i64)]) -> Option<String> {
    if columns.is_empty() {
        return Some("the table does not exist".to_string());
    }
    for (name, _, _, _) in columns {
        if entity.column(name).is_none() {
            return Some(format!("unexpected column '{name}'"));
        }
    }
    for field in &entity.fields {
        let Some((_, declared, not_null, pk)) = columns
            .iter()
            .find(|(name, ..)| name.eq_ignore_ascii_case(&field.column_name))
        else {
            return Some(format!("column '{}' is missing", field.column_name));
        };
        let affinity = Affinity::from_declared_type(declared);
        if affinity != Some(field.affinity) {
            return Some(format!(
                "column '{}' expected affinity {}, found '{declared}'",
                field.column_name,
                field.affinity.as_sql()
            ));
        }
        if *not_null != field.not_null {
            return Some(format!(
                "column '{}' expected {}, found {}",
                field.column_name,
                nullability(field.not_null),
                nullability(*not_null)
            ));
        }
        let expected_pk = entity.primary_key_position(&field.column_name);
        if usize::try_from(*pk).ok() != Some(expected_pk) {
            return Some(format!(
                "column '{}' expected primary key position {expected_pk}, found {pk}",
                field.column_name
            ));
        }
    }
    None
}

const fn nullability(not_null: bool) -> &'static str {
    if not_null {
        "NOT NULL"
    } else {
        "nullable"
    }
}

/// Drops every table and view, then creates the schema.
async fn recreate_schema(conn: &mut SqliteConnection, bundle: &DatabaseBundle) -> Result<()> {
    set_foreign_keys(&mut *conn, false).await?;
    let result = drop_and_create(&mut *conn, bundle).await;
    let restored = set_foreign_keys(conn, true).await;
    result?;
    restored
}

async fn drop_and_create(conn: &mut SqliteConnection, bundle: &DatabaseBundle) -> Result<()> {
    let mut tx = conn.begin().await?;
    let objects: Vec<(String, String)> = sqlx::query_as(
        "SELECT type, name FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
         ORDER BY type DESC",
    )
    .fetch_all(&mut *tx)
    .await?;
    for (kind, name) in &objects {
        let sql = format!("DROP {} IF EXISTS {}", kind.to_ascii_uppercase(), depot_schema::quote(name));
        debug!(sql = %sql, "Executing SQL");
        sqlx::query(&sql).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    create_schema(conn, bundle).await
}

/// Copies a pre-packaged database to `path` unless the file exists.
pub async fn copy_prepackaged(
    path: &Path,
    source: PrepackagedSource,
    asset_root: Option<&Path>,
) -> Result<bool> {
    if tokio::fs::try_exists(path).await? {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match source {
        PrepackagedSource::Asset(asset) => {
            let from = asset_root.map_or_else(|| asset.clone(), |root| root.join(&asset));
            tokio::fs::copy(&from, path).await?;
            info!(from = %from.display(), to = %path.display(), "Copied pre-packaged database");
        }
        PrepackagedSource::File(from) => {
            tokio::fs::copy(&from, path).await?;
            info!(from = %from.display(), to = %path.display(), "Copied pre-packaged database");
        }
        PrepackagedSource::Stream(mut reader) => {
            let to = path.to_path_buf();
            tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
                let mut file = std::fs::File::create(&to)?;
                std::io::copy(&mut reader, &mut file)
            })
            .await
            .map_err(|e| Error::Executor(e.to_string()))??;
            info!(to = %path.display(), "Copied pre-packaged database from stream");
        }
    }
    Ok(true)
}

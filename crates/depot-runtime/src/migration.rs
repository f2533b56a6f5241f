//! Migrations and migration path resolution.
//!
//! A [`Migration`] moves the schema from one version to another. Registered
//! migrations form a small directed graph over version numbers;
//! [`MigrationContainer::find_path`] walks it from the stored version to the
//! target version.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use sqlx::SqliteConnection;
use tracing::{debug, warn};

use crate::error::Result;

/// Custom migration code, run inside the migration's transaction.
pub type MigrationFn =
    Arc<dyn for<'c> Fn(&'c mut SqliteConnection) -> BoxFuture<'c, Result<()>> + Send + Sync>;

/// One step of a migration.
#[derive(Clone)]
pub enum MigrationStep {
    /// A SQL statement.
    Sql(String),
    /// Custom code.
    Custom(MigrationFn),
}

impl MigrationStep {
    pub(crate) async fn apply(&self, conn: &mut SqliteConnection) -> Result<()> {
        match self {
            Self::Sql(sql) => {
                debug!(sql = %sql, "Executing SQL");
                sqlx::query(sql).execute(conn).await?;
                Ok(())
            }
            Self::Custom(step) => step(conn).await,
        }
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql(sql) => f.debug_tuple("Sql").field(sql).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A migration between two schema versions.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version the migration starts from.
    pub from: u32,
    /// Version the migration ends at.
    pub to: u32,
    /// Steps, applied in order.
    pub steps: Vec<MigrationStep>,
    /// Synthesized from two schema bundles rather than written by hand.
    pub auto: bool,
    /// Foreign key enforcement is suspended while the steps run and the
    /// constraints are checked before commit.
    pub foreign_keys_off: bool,
}

impl Migration {
    /// Creates a migration running `statements`.
    #[must_use]
    pub fn new(from: u32, to: u32, statements: Vec<String>) -> Self {
        Self {
            from,
            to,
            steps: statements.into_iter().map(MigrationStep::Sql).collect(),
            auto: false,
            foreign_keys_off: false,
        }
    }

    /// Creates an auto-migration. A migration that recreates tables runs with
    /// foreign keys off.
    #[must_use]
    pub fn auto(from: u32, to: u32, statements: Vec<String>, recreates_tables: bool) -> Self {
        Self {
            auto: true,
            foreign_keys_off: recreates_tables,
            ..Self::new(from, to, statements)
        }
    }

    /// Creates a migration running custom code.
    ///
    /// ```rust
    /// use depot_runtime::Migration;
    ///
    /// let migration = Migration::custom(1, 2, |conn| {
    ///     Box::pin(async move {
    ///         depot_runtime::sqlx::query("UPDATE word_table SET word = lower(word)")
    ///             .execute(conn)
    ///             .await?;
    ///         Ok(())
    ///     })
    /// });
    /// assert_eq!(migration.to, 2);
    /// ```
    #[must_use]
    pub fn custom<F>(from: u32, to: u32, step: F) -> Self
    where
        F: for<'c> Fn(&'c mut SqliteConnection) -> BoxFuture<'c, Result<()>> + Send + Sync + 'static,
    {
        Self {
            steps: vec![MigrationStep::Custom(Arc::new(step))],
            ..Self::new(from, to, Vec::new())
        }
    }

    /// Appends a SQL statement.
    #[must_use]
    pub fn statement(mut self, sql: impl Into<String>) -> Self {
        self.steps.push(MigrationStep::Sql(sql.into()));
        self
    }

    /// Suspends foreign key enforcement while the migration runs.
    #[must_use]
    pub fn foreign_keys_off(mut self) -> Self {
        self.foreign_keys_off = true;
        self
    }

    /// Returns true when the migration lowers the version.
    #[must_use]
    pub const fn is_downgrade(&self) -> bool {
        self.to < self.from
    }
}

/// Registered migrations, keyed by `(from, to)`.
#[derive(Debug, Clone, Default)]
pub struct MigrationContainer {
    migrations: BTreeMap<(u32, u32), Migration>,
}

impl MigrationContainer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a migration.
    ///
    /// A hand-written migration replaces an auto-migration for the same pair;
    /// a second hand-written one replaces the first.
    pub fn add(&mut self, migration: Migration) {
        let key = (migration.from, migration.to);
        if let Some(existing) = self.migrations.get(&key) {
            match (existing.auto, migration.auto) {
                (false, true) => {
                    debug!(from = key.0, to = key.1, "Keeping manual migration over auto migration");
                    return;
                }
                (false, false) => {
                    warn!(from = key.0, to = key.1, "Overriding migration");
                }
                _ => {}
            }
        }
        self.migrations.insert(key, migration);
    }

    /// Returns the migration registered for `(from, to)`.
    #[must_use]
    pub fn get(&self, from: u32, to: u32) -> Option<&Migration> {
        self.migrations.get(&(from, to))
    }

    /// Returns true if any migration starts at `version`.
    #[must_use]
    pub fn has_migration_from(&self, version: u32) -> bool {
        self.outgoing(version).next().is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    fn outgoing(&self, from: u32) -> impl DoubleEndedIterator<Item = &Migration> {
        self.migrations
            .range((from, 0)..=(from, u32::MAX))
            .map(|(_, migration)| migration)
    }

    /// Finds a chain of migrations from `from` to `to`.
    ///
    /// Every step moves monotonically toward the target; the largest jump is
    /// tried first, so a direct migration wins when one exists. Returns an
    /// empty path when the versions are equal and `None` when no chain
    /// exists.
    #[must_use]
    pub fn find_path(&self, from: u32, to: u32) -> Option<Vec<&Migration>> {
        let mut path = Vec::new();
        let mut dead_ends = HashSet::new();
        self.walk(from, to, &mut path, &mut dead_ends).then_some(path)
    }

    fn walk<'a>(
        &'a self,
        current: u32,
        target: u32,
        path: &mut Vec<&'a Migration>,
        dead_ends: &mut HashSet<u32>,
    ) -> bool {
        if current == target {
            return true;
        }
        if dead_ends.contains(&current) {
            return false;
        }
        let upgrade = target > current;
        let mut candidates: Vec<&Migration> = self
            .outgoing(current)
            .filter(|m| {
                if upgrade {
                    m.to > current && m.to <= target
                } else {
                    m.to < current && m.to >= target
                }
            })
            .collect();
        if upgrade {
            candidates.reverse();
        }
        for migration in candidates {
            path.push(migration);
            if self.walk(migration.to, target, path, dead_ends) {
                return true;
            }
            path.pop();
        }
        dead_ends.insert(current);
        false
    }
}

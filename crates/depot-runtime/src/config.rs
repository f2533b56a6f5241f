//! Database configuration.
//!
//! [`DatabaseConfig`] holds every option with its default; the
//! [`DatabaseBuilder`] fills it in and validates it in
//! [`DatabaseBuilder::build`].

use std::collections::BTreeSet;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use depot_schema::DatabaseBundle;
use sqlx::sqlite::SqliteJournalMode;
use tokio::runtime::Handle;

use crate::convert::{ConverterRegistry, TypeConverter};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::executor::TransactionExecutor;
use crate::migration::{Migration, MigrationContainer};

/// Journal mode of a file database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JournalMode {
    /// Rollback journal, truncated at commit.
    Truncate,
    /// Write-ahead logging. Readers do not block the writer.
    #[default]
    WriteAheadLogging,
}

impl JournalMode {
    pub(crate) const fn as_sqlite(self) -> SqliteJournalMode {
        match self {
            Self::Truncate => SqliteJournalMode::Truncate,
            Self::WriteAheadLogging => SqliteJournalMode::Wal,
        }
    }
}

/// Where a pre-packaged database is copied from when the backing file does
/// not exist yet.
pub enum PrepackagedSource {
    /// A path relative to [`DatabaseConfig::asset_root`].
    Asset(PathBuf),
    /// A file anywhere on disk.
    File(PathBuf),
    /// Any reader. Consumed by the first open.
    Stream(Box<dyn Read + Send>),
}

impl fmt::Debug for PrepackagedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asset(path) => f.debug_tuple("Asset").field(path).finish(),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Options of one database handle.
#[derive(Debug)]
pub struct DatabaseConfig {
    /// File name of the database, `None` for an in-memory database.
    pub name: Option<String>,
    /// Directory the file name is resolved against. Defaults to the working
    /// directory.
    pub directory: Option<PathBuf>,
    /// Journal mode. Defaults to write-ahead logging; ignored in memory.
    pub journal_mode: JournalMode,
    /// Runtime reads run on. Defaults to the ambient tokio runtime.
    pub query_executor: Option<Handle>,
    /// Serial queue writes run on. Defaults to a new queue on the query
    /// executor.
    pub transaction_executor: Option<TransactionExecutor>,
    /// Registered migrations.
    pub migrations: MigrationContainer,
    /// Recreate the database when the stored version is newer and no path
    /// leads down. Off by default.
    pub allow_destructive_on_downgrade: bool,
    /// When false, any version change without a path recreates the database.
    /// Defaults to true.
    pub require_migration: bool,
    /// Versions known to be compatible with the current schema without
    /// running any statement.
    pub migration_not_required_from: BTreeSet<u32>,
    /// Pre-packaged sources. At most one may be set.
    pub prepackaged: Vec<PrepackagedSource>,
    /// Directory asset sources are resolved against. Defaults to the working
    /// directory.
    pub asset_root: Option<PathBuf>,
    /// Type converters available to generated code.
    pub converters: ConverterRegistry,
    /// Keep several handles on one file coherent through a mirror table.
    /// Off by default.
    pub multi_instance_invalidation: bool,
    /// How often a multi-instance handle re-reads the mirror table.
    pub invalidation_poll_interval: Duration,
    /// Close the connections after this much idle time. Off by default.
    pub auto_close_timeout: Option<Duration>,
}

impl DatabaseConfig {
    fn new(name: Option<String>) -> Self {
        Self {
            name,
            directory: None,
            journal_mode: JournalMode::default(),
            query_executor: None,
            transaction_executor: None,
            migrations: MigrationContainer::new(),
            allow_destructive_on_downgrade: false,
            require_migration: true,
            migration_not_required_from: BTreeSet::new(),
            prepackaged: Vec::new(),
            asset_root: None,
            converters: ConverterRegistry::with_defaults(),
            multi_instance_invalidation: false,
            invalidation_poll_interval: Duration::from_secs(1),
            auto_close_timeout: None,
        }
    }

    /// Returns true for an in-memory database.
    #[must_use]
    pub const fn is_in_memory(&self) -> bool {
        self.name.is_none()
    }

    /// Absolute path of the backing file.
    pub fn path(&self) -> Result<Option<PathBuf>> {
        let Some(name) = &self.name else {
            return Ok(None);
        };
        let path = match &self.directory {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        };
        Ok(Some(std::path::absolute(path)?))
    }

    /// Checks the options against each other.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(Error::Config(
                    "database name must not be empty; use an in-memory builder instead".into(),
                ));
            }
        }
        if self.prepackaged.len() > 1 {
            return Err(Error::Config(
                "at most one pre-packaged database source (asset, file or stream) may be set"
                    .into(),
            ));
        }
        if self.is_in_memory() {
            if !self.prepackaged.is_empty() {
                return Err(Error::Config(
                    "an in-memory database cannot be created from a pre-packaged database".into(),
                ));
            }
            if self.multi_instance_invalidation {
                return Err(Error::Config(
                    "multi-instance invalidation requires a file database".into(),
                ));
            }
            if self.auto_close_timeout.is_some() {
                return Err(Error::Config(
                    "auto-close would discard an in-memory database".into(),
                ));
            }
        }
        if self.multi_instance_invalidation && self.journal_mode != JournalMode::WriteAheadLogging {
            return Err(Error::Config(
                "multi-instance invalidation requires write-ahead logging".into(),
            ));
        }
        if self.auto_close_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Config("auto-close timeout must be positive".into()));
        }
        if self.invalidation_poll_interval.is_zero() {
            return Err(Error::Config(
                "invalidation poll interval must be positive".into(),
            ));
        }
        for version in &self.migration_not_required_from {
            if self.migrations.has_migration_from(*version) {
                return Err(Error::Config(format!(
                    "version {version} has a registered migration and is also marked as not requiring one"
                )));
            }
        }
        Ok(())
    }
}

/// Builder for a [`Database`].
#[derive(Debug)]
pub struct DatabaseBuilder {
    bundle: DatabaseBundle,
    config: DatabaseConfig,
}

impl DatabaseBuilder {
    pub(crate) fn new(name: Option<String>, bundle: DatabaseBundle) -> Self {
        Self {
            bundle,
            config: DatabaseConfig::new(name),
        }
    }

    /// The options collected so far.
    #[must_use]
    pub const fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Directory the database name is resolved against.
    #[must_use]
    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.directory = Some(dir.into());
        self
    }

    #[must_use]
    pub fn journal_mode(mut self, mode: JournalMode) -> Self {
        self.config.journal_mode = mode;
        self
    }

    #[must_use]
    pub fn query_executor(mut self, handle: Handle) -> Self {
        self.config.query_executor = Some(handle);
        self
    }

    #[must_use]
    pub fn transaction_executor(mut self, executor: TransactionExecutor) -> Self {
        self.config.transaction_executor = Some(executor);
        self
    }

    /// Registers one migration.
    #[must_use]
    pub fn add_migration(mut self, migration: Migration) -> Self {
        self.config.migrations.add(migration);
        self
    }

    /// Registers several migrations.
    #[must_use]
    pub fn add_migrations(mut self, migrations: impl IntoIterator<Item = Migration>) -> Self {
        for migration in migrations {
            self.config.migrations.add(migration);
        }
        self
    }

    /// Recreates the database on a downgrade without a registered path.
    #[must_use]
    pub fn fallback_to_destructive_migration_on_downgrade(mut self) -> Self {
        self.config.allow_destructive_on_downgrade = true;
        self
    }

    /// Whether a version change without a path is fatal. When `false` the
    /// database is recreated instead.
    #[must_use]
    pub fn require_migration(mut self, required: bool) -> Self {
        self.config.require_migration = required;
        self
    }

    /// Marks versions as compatible with the current schema.
    #[must_use]
    pub fn migration_not_required_from(mut self, versions: impl IntoIterator<Item = u32>) -> Self {
        self.config.migration_not_required_from.extend(versions);
        self
    }

    /// Copies a pre-packaged database from an asset path before first open.
    #[must_use]
    pub fn create_from_asset(mut self, path: impl Into<PathBuf>) -> Self {
        self.config
            .prepackaged
            .push(PrepackagedSource::Asset(path.into()));
        self
    }

    /// Copies a pre-packaged database from a file before first open.
    #[must_use]
    pub fn create_from_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config
            .prepackaged
            .push(PrepackagedSource::File(path.into()));
        self
    }

    /// Copies a pre-packaged database from a reader before first open.
    #[must_use]
    pub fn create_from_stream(mut self, reader: impl Read + Send + 'static) -> Self {
        self.config
            .prepackaged
            .push(PrepackagedSource::Stream(Box::new(reader)));
        self
    }

    /// Directory asset paths are resolved against.
    #[must_use]
    pub fn asset_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.asset_root = Some(dir.into());
        self
    }

    /// Registers a type converter instance.
    #[must_use]
    pub fn add_type_converter<C: TypeConverter>(mut self, converter: C) -> Self {
        self.config.converters = self.config.converters.register(converter);
        self
    }

    /// Keeps handles on the same file in this and other processes coherent.
    #[must_use]
    pub fn enable_multi_instance_invalidation(mut self) -> Self {
        self.config.multi_instance_invalidation = true;
        self
    }

    #[must_use]
    pub fn invalidation_poll_interval(mut self, interval: Duration) -> Self {
        self.config.invalidation_poll_interval = interval;
        self
    }

    /// Closes idle connections after `timeout`; they reopen on next use.
    #[must_use]
    pub fn auto_close_timeout(mut self, timeout: Duration) -> Self {
        self.config.auto_close_timeout = Some(timeout);
        self
    }

    /// Validates the configuration and creates the handle. Nothing touches
    /// the database file until the first query.
    pub fn build(self) -> Result<Database> {
        self.config.validate()?;
        Database::from_config(self.bundle, self.config)
    }
}

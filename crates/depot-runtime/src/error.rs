//! Error types for the runtime.

use std::path::PathBuf;

use depot_schema::SchemaError;

/// Kind of constraint a statement violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// `UNIQUE` or `PRIMARY KEY`.
    Unique,
    /// `FOREIGN KEY`.
    ForeignKey,
    /// `NOT NULL`.
    NotNull,
    /// `CHECK`.
    Check,
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unique => "unique",
            Self::ForeignKey => "foreign key",
            Self::NotNull => "not null",
            Self::Check => "check",
        })
    }
}

/// Errors raised while opening or using a database.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A single-row query matched no row.
    #[error("Query returned no row: {query}")]
    EmptyResult {
        /// The statement.
        query: String,
    },

    /// A statement violated a constraint under an aborting conflict strategy.
    #[error("{kind} constraint violated: {message}")]
    ConstraintViolation {
        /// Which constraint.
        kind: ConstraintKind,
        /// Engine message.
        message: String,
    },

    /// No migration path exists and destructive recreation is not allowed.
    #[error("A migration from {from} to {to} was required but not found")]
    MissingMigration {
        /// Version stored in the database.
        from: u32,
        /// Version of the schema.
        to: u32,
    },

    /// A migration unit failed; its changes were rolled back.
    #[error("Migration {from} -> {to} failed: {source}")]
    MigrationFailed {
        /// Start version of the unit.
        from: u32,
        /// End version of the unit.
        to: u32,
        /// Cause.
        #[source]
        source: Box<Error>,
    },

    /// The physical schema does not match the expected schema after a
    /// migration. Indicates broken migration content.
    #[error("Internal consistency error: {0}")]
    InternalConsistency(String),

    /// The stored identity hash does not match the schema.
    #[error("Schema identity mismatch: expected {expected}, found {found}")]
    IdentityMismatch {
        /// Hash of the schema.
        expected: String,
        /// Hash stored in the database.
        found: String,
    },

    /// A statement needs more placeholders than the engine accepts.
    #[error("Too many bind arguments: {count} exceeds the limit of {limit}")]
    TooManyBindArguments {
        /// Placeholders needed.
        count: usize,
        /// Engine limit.
        limit: usize,
    },

    /// A connection lease outlived an idle close.
    #[error("Stale connection: acquired in generation {held}, current is {current}")]
    StaleConnection {
        /// Generation the lease was taken in.
        held: u64,
        /// Current generation.
        current: u64,
    },

    /// An observer subscribed to a name that is neither a table nor a view.
    #[error("Unknown table or view '{0}'")]
    UnknownTable(String),

    /// Invalid builder configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another handle already owns the backing file.
    #[error("Database '{}' is already open", .0.display())]
    AlreadyOpen(PathBuf),

    /// A converter needed by a query was not registered.
    #[error("No type converter registered for {0}")]
    MissingTypeConverter(&'static str),

    /// A stored value could not be converted.
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// An executor rejected or dropped a job.
    #[error("Executor error: {0}")]
    Executor(String),

    /// The database was closed.
    #[error("Database is closed")]
    Closed,

    /// Database error.
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Schema error.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// IO error (copying a pre-packaged database).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &error {
            let kind = match db.kind() {
                sqlx::error::ErrorKind::UniqueViolation => Some(ConstraintKind::Unique),
                sqlx::error::ErrorKind::ForeignKeyViolation => Some(ConstraintKind::ForeignKey),
                sqlx::error::ErrorKind::NotNullViolation => Some(ConstraintKind::NotNull),
                sqlx::error::ErrorKind::CheckViolation => Some(ConstraintKind::Check),
                _ => None,
            };
            if let Some(kind) = kind {
                return Self::ConstraintViolation {
                    kind,
                    message: db.message().to_string(),
                };
            }
        }
        Self::Database(error)
    }
}

impl Error {
    /// Returns true for constraint violations.
    #[must_use]
    pub const fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation { .. })
    }

    /// Returns true when the database could not open for lack of a migration.
    #[must_use]
    pub const fn is_missing_migration(&self) -> bool {
        matches!(self, Self::MissingMigration { .. })
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

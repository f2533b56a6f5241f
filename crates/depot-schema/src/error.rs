//! Error types for the schema model.

use std::path::PathBuf;

use crate::entity::Affinity;

/// Errors raised while building, diffing or migrating schemas.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Two entities (or an entity and a view) share a table name.
    #[error("Duplicate entity '{0}'")]
    DuplicateEntity(String),

    /// Two fields of the same entity map to the same column.
    #[error("Duplicate column '{column}' in entity '{table}'")]
    DuplicateColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// Two indices share a name.
    #[error("Duplicate index '{0}'")]
    DuplicateIndex(String),

    /// A primary key column was declared nullable.
    #[error("Primary key column '{table}.{column}' must be NOT NULL")]
    NullablePrimaryKey {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// An entity declares no primary key.
    #[error("Entity '{0}' has no primary key")]
    MissingPrimaryKey(String),

    /// A constraint refers to a column the entity does not have.
    #[error("Unknown column '{table}.{column}'")]
    UnknownColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A reference to a table that is not part of the schema.
    #[error("Unknown table '{0}'")]
    UnknownTable(String),

    /// Invalid entity or constraint declaration.
    #[error("Invalid declaration for '{table}': {message}")]
    InvalidEntity {
        /// Table name.
        table: String,
        /// What is wrong.
        message: String,
    },

    /// A column changed in a way structural DDL cannot express.
    #[error("Altered column '{table}.{column}' ({change}) requires an explicit migration")]
    AlteredColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
        /// The change that was detected.
        change: ColumnChange,
    },

    /// A NOT NULL column was added without a default value.
    #[error("New NOT NULL column '{table}.{column}' has no default value")]
    MissingDefault {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A table disappeared without being declared deleted or renamed.
    #[error("Table '{0}' was removed but is not declared as deleted or renamed")]
    RemovedTable(String),

    /// A column disappeared without being declared deleted or renamed.
    #[error("Column '{table}.{column}' was removed but is not declared as deleted or renamed")]
    RemovedColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// Invalid version number or version range.
    #[error("Invalid version range {from} -> {to}: {message}")]
    InvalidVersionRange {
        /// Start version.
        from: u32,
        /// End version.
        to: u32,
        /// What is wrong.
        message: String,
    },

    /// No exported bundle exists for a version.
    #[error("Schema bundle for version {version} not found at {path}")]
    MissingBundle {
        /// Requested version.
        version: u32,
        /// Location that was searched.
        path: PathBuf,
    },

    /// IO error while reading or writing bundles.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Multiple errors occurred.
    #[error("Multiple errors occurred:\n{}", .0.iter().map(|e| format!("  - {e}")).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<SchemaError>),
}

impl SchemaError {
    /// Collapses a list of errors into a single error.
    ///
    /// Returns `None` for an empty list.
    #[must_use]
    pub fn collect(mut errors: Vec<Self>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple(errors)),
        }
    }
}

/// Describes how a column present in two schema versions changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnChange {
    /// The declared affinity changed.
    Affinity {
        /// Affinity in the older version.
        from: Affinity,
        /// Affinity in the newer version.
        to: Affinity,
    },
    /// The NOT NULL constraint was added or dropped.
    Nullability {
        /// Whether the older column was NOT NULL.
        from_not_null: bool,
        /// Whether the newer column is NOT NULL.
        to_not_null: bool,
    },
}

impl std::fmt::Display for ColumnChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Affinity { from, to } => {
                write!(f, "affinity {} -> {}", from.as_sql(), to.as_sql())
            }
            Self::Nullability {
                from_not_null,
                to_not_null,
            } => {
                let label = |not_null: bool| if not_null { "NOT NULL" } else { "NULL" };
                write!(
                    f,
                    "nullability {} -> {}",
                    label(*from_not_null),
                    label(*to_not_null)
                )
            }
        }
    }
}

/// Result type for schema operations.
pub type Result<T> = std::result::Result<T, SchemaError>;

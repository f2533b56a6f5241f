//! The declaration file format.
//!
//! A declaration is a JSON document describing one database: its entities,
//! views, data-access objects and the value converters it relies on. It is
//! the only input of the generator and deliberately independent of the
//! target language.
//!
//! ```json
//! {
//!   "database": { "name": "WordDatabase", "version": 1, "export_schema": true },
//!   "entities": [{
//!     "name": "Word",
//!     "table": "word_table",
//!     "fields": [
//!       { "name": "word", "type": "String" },
//!       { "name": "date", "type": "chrono::DateTime<chrono::Utc>" }
//!     ],
//!     "primary_key": ["word"]
//!   }],
//!   "daos": [{
//!     "name": "WordDao",
//!     "methods": [
//!       { "name": "get_all_words", "intent": "QUERY",
//!         "query": "SELECT * FROM word_table", "returns": "Vec<Word>" },
//!       { "name": "insert", "intent": "INSERT", "on_conflict": "IGNORE",
//!         "params": [{ "name": "word", "type": "Word" }] },
//!       { "name": "replace_with", "intent": "TRANSACTION",
//!         "steps": ["delete_all", "insert"],
//!         "params": [{ "name": "word", "type": "Word" }] }
//!     ]
//!   }]
//! }
//! ```

use std::path::Path;

use depot_schema::{Affinity, AutoMigrationSpec, ForeignKeyAction};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Root of a declaration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Declaration {
    /// Database-level settings.
    pub database: DatabaseDecl,
    /// Entities (tables).
    #[serde(default)]
    pub entities: Vec<EntityDecl>,
    /// Views.
    #[serde(default)]
    pub views: Vec<ViewDecl>,
    /// Data-access objects.
    #[serde(default)]
    pub daos: Vec<DaoDecl>,
    /// Converters for field types that are not stored natively.
    #[serde(default)]
    pub type_converters: Vec<ConverterDecl>,
}

impl Declaration {
    /// Parses a declaration from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a declaration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

/// Database-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseDecl {
    /// Name of the generated database type.
    pub name: String,
    /// Current schema version.
    pub version: u32,
    /// Whether to export the schema bundle of this version.
    #[serde(default)]
    pub export_schema: bool,
    /// Auto-migrations to synthesize from exported bundles.
    #[serde(default)]
    pub auto_migrations: Vec<AutoMigrationSpec>,
}

/// An entity declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityDecl {
    /// Name of the generated row type.
    pub name: String,
    /// Table name; defaults to the snake-cased type name.
    #[serde(default)]
    pub table: Option<String>,
    /// Fields in column order.
    pub fields: Vec<FieldDecl>,
    /// Names of the primary key fields.
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Whether the single INTEGER key is assigned by the engine.
    #[serde(default)]
    pub auto_generate: bool,
    /// Secondary indices.
    #[serde(default)]
    pub indices: Vec<IndexDecl>,
    /// Foreign keys.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDecl>,
}

/// A field declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDecl {
    /// Field name on the row type.
    pub name: String,
    /// Column name; defaults to the field name.
    #[serde(default)]
    pub column: Option<String>,
    /// Rust type. `Option<T>` makes the column nullable.
    #[serde(rename = "type")]
    pub ty: String,
    /// Explicit affinity, overriding the one implied by the type.
    #[serde(default)]
    pub affinity: Option<Affinity>,
    /// Default value expression.
    #[serde(default)]
    pub default: Option<String>,
}

/// An index declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexDecl {
    /// Index name; defaults to `index_<table>_<columns>`.
    #[serde(default)]
    pub name: Option<String>,
    /// Indexed field names.
    pub fields: Vec<String>,
    /// Whether the index is unique.
    #[serde(default)]
    pub unique: bool,
}

/// A foreign key declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForeignKeyDecl {
    /// Parent entity name.
    pub entity: String,
    /// Child field names.
    pub fields: Vec<String>,
    /// Parent field names.
    pub parent_fields: Vec<String>,
    /// Action on delete.
    #[serde(default)]
    pub on_delete: ForeignKeyAction,
    /// Action on update.
    #[serde(default)]
    pub on_update: ForeignKeyAction,
    /// Whether the constraint is deferred until commit.
    #[serde(default)]
    pub deferred: bool,
}

/// A view declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViewDecl {
    /// View name.
    pub name: String,
    /// The `SELECT` backing the view.
    pub query: String,
}

/// A data-access object declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaoDecl {
    /// Name of the DAO; the generated types are `<name>Impl` and `<name>Model`.
    pub name: String,
    /// Methods.
    pub methods: Vec<MethodDecl>,
}

/// What a method does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Intent {
    /// Run a statement once.
    Query,
    /// Insert entities.
    Insert,
    /// Update entities by primary key.
    Update,
    /// Delete entities by primary key.
    Delete,
    /// Run a `SELECT` and re-run it whenever its tables change.
    Observe,
    /// Run other methods of the same DAO in one write transaction.
    Transaction,
}

/// Conflict resolution for inserts and updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OnConflict {
    /// Abort the statement and report a constraint violation.
    #[default]
    Abort,
    /// Fail the statement, keeping earlier changes of it.
    Fail,
    /// Skip the conflicting row.
    Ignore,
    /// Replace the conflicting row.
    Replace,
    /// Roll back the transaction.
    Rollback,
}

impl OnConflict {
    /// Returns the SQL keyword.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Abort => "ABORT",
            Self::Fail => "FAIL",
            Self::Ignore => "IGNORE",
            Self::Replace => "REPLACE",
            Self::Rollback => "ROLLBACK",
        }
    }
}

/// A method declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodDecl {
    /// Method name (snake case).
    pub name: String,
    /// Intent.
    pub intent: Intent,
    /// Statement text. Required for `QUERY` and `OBSERVE`; synthesized from
    /// the entity for the other intents when absent.
    #[serde(default)]
    pub query: Option<String>,
    /// Parameters.
    #[serde(default)]
    pub params: Vec<ParamDecl>,
    /// Declared return type; `()` when absent.
    #[serde(default)]
    pub returns: Option<String>,
    /// Conflict strategy for synthesized inserts and updates.
    #[serde(default)]
    pub on_conflict: Option<OnConflict>,
    /// Methods a `TRANSACTION` runs, in order. Their parameters are taken
    /// by name from this method's parameters.
    #[serde(default)]
    pub steps: Vec<String>,
}

/// A method parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamDecl {
    /// Parameter name, matched against `:name` tokens.
    pub name: String,
    /// Rust type. `Vec<T>` expands to a placeholder list.
    #[serde(rename = "type")]
    pub ty: String,
}

/// A value converter declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConverterDecl {
    /// The field type being converted.
    #[serde(rename = "type")]
    pub ty: String,
    /// Path of the converter type registered at runtime.
    pub converter: String,
    /// The stored column type (a supported scalar).
    pub column: String,
}

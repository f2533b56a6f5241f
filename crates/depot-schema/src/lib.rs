//! Schema model for depot databases.
//!
//! This crate holds the immutable, serializable description of a database:
//!
//! - **Entities** - tables with typed fields, a primary key, indices and
//!   foreign keys ([`Entity`])
//! - **Views** - named `SELECT` statements ([`View`])
//! - **Bundles** - the full schema of one version, exported as JSON and
//!   fingerprinted by an identity hash ([`DatabaseBundle`])
//! - **Diffing** - structural comparison of two bundles ([`diff()`])
//! - **Auto-migrations** - DDL synthesized from two bundles
//!   ([`AutoMigration`])
//!
//! It is shared by the code generator, which builds bundles from declaration
//! files, and by the runtime, which creates and validates the physical schema.
//!
//! # Example
//!
//! ```rust
//! use depot_schema::prelude::*;
//!
//! let v1 = DatabaseBundle::new(
//!     1,
//!     vec![Entity::new("word_table")
//!         .field(Field::new("word", Affinity::Text).not_null())
//!         .primary_key(&["word"])],
//!     Vec::new(),
//! )
//! .unwrap();
//!
//! let v2 = DatabaseBundle::new(
//!     2,
//!     vec![Entity::new("word_table")
//!         .field(Field::new("word", Affinity::Text).not_null())
//!         .field(Field::new("date", Affinity::Integer).not_null().default_value("0"))
//!         .primary_key(&["word"])],
//!     Vec::new(),
//! )
//! .unwrap();
//!
//! let migration = AutoMigration::generate(&v1, &v2, &AutoMigrationSpec::new(1, 2)).unwrap();
//! assert_eq!(migration.statements.len(), 1);
//! ```

pub mod automigration;
pub mod bundle;
pub mod diff;
pub mod entity;
pub mod error;

pub use automigration::{AutoMigration, AutoMigrationSpec, RenamedColumn, RenamedTable};
pub use bundle::DatabaseBundle;
pub use diff::{diff, AlteredColumn, AlteredIndex, ColumnRef, IndexChange, SchemaDiff};
pub use entity::{quote, Affinity, Entity, Field, ForeignKey, ForeignKeyAction, Index, PrimaryKey, View};
pub use error::{ColumnChange, Result, SchemaError};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::automigration::{AutoMigration, AutoMigrationSpec};
    pub use crate::bundle::DatabaseBundle;
    pub use crate::diff::{diff, SchemaDiff};
    pub use crate::entity::{Affinity, Entity, Field, ForeignKey, ForeignKeyAction, Index, View};
    pub use crate::error::{Result, SchemaError};
}

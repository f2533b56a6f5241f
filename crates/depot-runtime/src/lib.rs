//! # depot-runtime
//!
//! Runtime for databases generated by `depot-compiler`.
//!
//! This crate provides:
//! - The [`Database`] handle: lazy open, schema creation, migration with
//!   path resolution and validation, destructive recreation when allowed
//! - Connection management with an optional idle auto-close
//! - The [`InvalidationTracker`], which tells observers which tables changed
//!   after each committed write, within one handle or across handles on the
//!   same file
//! - [`LiveQuery`] streams and callback [`QueryObserver`]s built on it
//! - Executors: reads on a query executor, writes serialized on a
//!   [`TransactionExecutor`]
//!
//! ## Example
//!
//! ```rust
//! use depot_runtime::{Affinity, Database, DatabaseBundle, Entity, Field};
//!
//! # tokio_test::block_on(async {
//! let bundle = DatabaseBundle::new(
//!     1,
//!     vec![Entity::new("word_table")
//!         .field(Field::new("word", Affinity::Text).not_null())
//!         .primary_key(&["word"])],
//!     Vec::new(),
//! )?;
//! let db = Database::in_memory_builder(bundle).build()?;
//!
//! let mut tx = db.begin_write().await?;
//! depot_runtime::sqlx::query("INSERT INTO word_table (word) VALUES ('Hello')")
//!     .execute(tx.connection())
//!     .await?;
//! tx.touch("word_table");
//! tx.commit().await?;
//!
//! let mut conn = db.acquire().await?;
//! let count: i64 = depot_runtime::sqlx::query_scalar("SELECT COUNT(*) FROM word_table")
//!     .fetch_one(&mut *conn)
//!     .await?;
//! assert_eq!(count, 1);
//! # Ok::<(), depot_runtime::Error>(())
//! # }).unwrap();
//! ```

pub mod config;
pub mod connection;
pub mod convert;
pub mod database;
pub mod error;
pub mod executor;
pub mod invalidation;
pub mod live;
pub mod master;
pub mod migration;
pub mod open;
pub mod statement;

pub use sqlx;

pub use config::{DatabaseBuilder, DatabaseConfig, JournalMode, PrepackagedSource};
pub use connection::{ConnectionManager, Lease};
pub use convert::{ConverterRegistry, DateTimeMillis, TypeConverter};
pub use database::{Database, WriteTransaction};
pub use depot_schema::{Affinity, DatabaseBundle, Entity, Field, ForeignKey, ForeignKeyAction, View};
pub use error::{ConstraintKind, Error, Result};
pub use executor::{QueryExecutor, TransactionExecutor, WriteTicket};
pub use invalidation::{observer_fn, InvalidationObserver, InvalidationTracker, Subscription};
pub use live::{LiveQuery, QueryObserver};
pub use migration::{Migration, MigrationContainer, MigrationStep};
pub use open::{OpenReport, OpenState};
pub use statement::{StatementBuilder, MAX_BIND_ARGUMENTS};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::{DatabaseBuilder, JournalMode};
    pub use crate::database::Database;
    pub use crate::error::{Error, Result};
    pub use crate::live::{LiveQuery, QueryObserver};
    pub use crate::migration::Migration;
    pub use crate::TypeConverter;
}

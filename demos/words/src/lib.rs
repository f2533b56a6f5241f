//! A word list stored with depot.
//!
//! The database, the `Word` entity and the `WordDao` are generated at build
//! time from `words.json`. Version 2 adds the `date` column; databases
//! created at version 1 are migrated by the synthesized auto-migration.

#[allow(clippy::all, clippy::pedantic, clippy::nursery, missing_docs)]
mod generated {
    include!(concat!(env!("OUT_DIR"), "/words_db.rs"));
}

use chrono::SubsecRound;

pub use generated::{
    auto_migrations, schema, Word, WordDaoImpl, WordDaoModel, WordDatabase, IDENTITY_HASH,
    VERSION,
};

impl Word {
    /// A word stamped with the current time, at the millisecond precision
    /// the `date` column stores.
    #[must_use]
    pub fn now(word: impl Into<String>) -> Self {
        Self {
            word: word.into(),
            date: chrono::Utc::now().trunc_subsecs(3),
        }
    }
}

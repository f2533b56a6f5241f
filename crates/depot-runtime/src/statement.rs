//! Statements whose placeholder count is only known at call time.

use crate::error::{Error, Result};

/// Number of placeholders SQLite accepts in one statement.
pub const MAX_BIND_ARGUMENTS: usize = 999;

/// Builds a statement in which list parameters expand to one placeholder
/// per element.
///
/// ```rust
/// use depot_runtime::StatementBuilder;
///
/// let mut builder = StatementBuilder::new();
/// builder.push_sql("SELECT * FROM word_table WHERE word IN (");
/// builder.push_list(3);
/// builder.push_sql(")");
/// assert_eq!(
///     builder.finish().unwrap(),
///     "SELECT * FROM word_table WHERE word IN (?, ?, ?)"
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct StatementBuilder {
    sql: String,
    placeholders: usize,
}

impl StatementBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends literal SQL.
    pub fn push_sql(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    /// Appends one placeholder.
    pub fn push_placeholder(&mut self) {
        self.sql.push('?');
        self.placeholders += 1;
    }

    /// Appends `len` comma-separated placeholders.
    pub fn push_list(&mut self, len: usize) {
        for i in 0..len {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.sql.push('?');
        }
        self.placeholders += len;
    }

    /// Number of placeholders so far.
    #[must_use]
    pub const fn placeholders(&self) -> usize {
        self.placeholders
    }

    /// Returns the statement, or [`Error::TooManyBindArguments`] when it
    /// needs more than [`MAX_BIND_ARGUMENTS`] placeholders.
    pub fn finish(self) -> Result<String> {
        if self.placeholders > MAX_BIND_ARGUMENTS {
            return Err(Error::TooManyBindArguments {
                count: self.placeholders,
                limit: MAX_BIND_ARGUMENTS,
            });
        }
        Ok(self.sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list() {
        let mut builder = StatementBuilder::new();
        builder.push_sql("SELECT 1 WHERE 1 IN (");
        builder.push_list(0);
        builder.push_sql(")");
        assert_eq!(builder.finish().unwrap(), "SELECT 1 WHERE 1 IN ()");
    }

    #[test]
    fn test_mixed_placeholders() {
        let mut builder = StatementBuilder::new();
        builder.push_sql("DELETE FROM t WHERE a = ");
        builder.push_placeholder();
        builder.push_sql(" AND b IN (");
        builder.push_list(2);
        builder.push_sql(")");
        assert_eq!(builder.placeholders(), 3);
        assert_eq!(
            builder.finish().unwrap(),
            "DELETE FROM t WHERE a = ? AND b IN (?, ?)"
        );
    }

    #[test]
    fn test_limit() {
        let mut builder = StatementBuilder::new();
        builder.push_list(MAX_BIND_ARGUMENTS);
        assert!(builder.clone().finish().is_ok());
        builder.push_placeholder();
        let err = builder.finish().unwrap_err();
        assert!(matches!(
            err,
            Error::TooManyBindArguments {
                count: 1000,
                limit: 999
            }
        ));
    }
}

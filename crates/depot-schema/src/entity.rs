//! Entities, views and the constraints attached to them.
//!
//! Every type here is plain data: it is built once (by the compiler from a
//! declaration file, or by hand in tests) and never mutated afterwards. The
//! `*_sql` methods render the canonical DDL used both to create the schema and
//! to compute its identity hash, so their output must stay stable.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchemaError};

/// Quotes an identifier with backticks.
#[must_use]
pub fn quote(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

/// Storage class a column is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Affinity {
    /// Character data.
    Text,
    /// Signed integers.
    Integer,
    /// Floating point values.
    Real,
    /// Raw bytes.
    Blob,
}

impl Affinity {
    /// Returns the SQL type name.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Blob => "BLOB",
        }
    }

    /// Resolves the affinity SQLite assigns to a declared column type.
    ///
    /// Returns `None` for types that get NUMERIC affinity, which the schema
    /// model never declares.
    #[must_use]
    pub fn from_declared_type(declared: &str) -> Option<Self> {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            Some(Self::Integer)
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Some(Self::Text)
        } else if upper.contains("BLOB") || upper.trim().is_empty() {
            Some(Self::Blob)
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Some(Self::Real)
        } else {
            None
        }
    }
}

/// A single column of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    /// Name of the field on the generated row type.
    pub name: String,
    /// Column name in the table.
    pub column_name: String,
    /// Declared affinity.
    pub affinity: Affinity,
    /// Whether the column is NOT NULL.
    #[serde(default)]
    pub not_null: bool,
    /// Default value expression, inserted verbatim after `DEFAULT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

impl Field {
    /// Creates a nullable field whose column is named after the field.
    #[must_use]
    pub fn new(name: impl Into<String>, affinity: Affinity) -> Self {
        let name = name.into();
        Self {
            column_name: name.clone(),
            name,
            affinity,
            not_null: false,
            default_value: None,
        }
    }

    /// Overrides the column name.
    #[must_use]
    pub fn column(mut self, column_name: impl Into<String>) -> Self {
        self.column_name = column_name.into();
        self
    }

    /// Marks the column NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Sets the default value expression.
    #[must_use]
    pub fn default_value(mut self, expression: impl Into<String>) -> Self {
        self.default_value = Some(expression.into());
        self
    }

    /// Renders the column definition used inside `CREATE TABLE`.
    #[must_use]
    pub fn definition(&self, auto_increment_key: bool) -> String {
        let mut sql = format!("{} {}", quote(&self.column_name), self.affinity.as_sql());
        if auto_increment_key {
            sql.push_str(" PRIMARY KEY AUTOINCREMENT");
        }
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default_value {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        sql
    }
}

/// Primary key of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PrimaryKey {
    /// Key columns, in key order.
    pub columns: Vec<String>,
    /// Whether the single INTEGER key is assigned by the engine.
    #[serde(default)]
    pub auto_generate: bool,
}

/// A secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Index {
    /// Index name.
    pub name: String,
    /// Indexed columns.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    #[serde(default)]
    pub unique: bool,
}

impl Index {
    /// Creates an index named `index_<table>_<columns>`.
    #[must_use]
    pub fn on(table: &str, columns: &[&str]) -> Self {
        Self {
            name: format!("index_{}_{}", table, columns.join("_")),
            columns: columns.iter().map(ToString::to_string).collect(),
            unique: false,
        }
    }

    /// Makes the index unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Renders the `CREATE INDEX` statement for `table`.
    #[must_use]
    pub fn create_sql(&self, table: &str) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote(c)).collect();
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            quote(&self.name),
            quote(table),
            columns.join(", ")
        )
    }
}

/// Referential action of a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForeignKeyAction {
    /// No action.
    #[default]
    NoAction,
    /// Reject the change immediately.
    Restrict,
    /// Set the child column to NULL.
    SetNull,
    /// Set the child column to its default.
    SetDefault,
    /// Propagate the change.
    Cascade,
}

impl ForeignKeyAction {
    /// Returns the SQL representation of this action.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
            Self::Cascade => "CASCADE",
        }
    }

    /// Whether the action changes child rows when the parent changes.
    #[must_use]
    pub const fn modifies_children(self) -> bool {
        matches!(self, Self::SetNull | Self::SetDefault | Self::Cascade)
    }
}

/// A foreign key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Referenced (parent) table.
    pub table: String,
    /// Child columns.
    pub columns: Vec<String>,
    /// Parent columns.
    pub referenced_columns: Vec<String>,
    /// Action on delete.
    #[serde(default)]
    pub on_delete: ForeignKeyAction,
    /// Action on update.
    #[serde(default)]
    pub on_update: ForeignKeyAction,
    /// Whether the check is deferred until commit.
    #[serde(default)]
    pub deferred: bool,
}

impl ForeignKey {
    fn definition(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote(c)).collect();
        let referenced: Vec<String> = self.referenced_columns.iter().map(|c| quote(c)).collect();
        let mut sql = format!(
            "FOREIGN KEY({}) REFERENCES {}({}) ON UPDATE {} ON DELETE {}",
            columns.join(", "),
            quote(&self.table),
            referenced.join(", "),
            self.on_update.as_sql(),
            self.on_delete.as_sql()
        );
        if self.deferred {
            sql.push_str(" DEFERRABLE INITIALLY DEFERRED");
        }
        sql
    }
}

/// A named row shape mapped to one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    /// Table name.
    pub table_name: String,
    /// Fields in declaration order.
    pub fields: Vec<Field>,
    /// Primary key.
    pub primary_key: PrimaryKey,
    /// Secondary indices.
    #[serde(default)]
    pub indices: Vec<Index>,
    /// Foreign keys.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl Entity {
    /// Creates an entity with no fields.
    #[must_use]
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            fields: Vec::new(),
            primary_key: PrimaryKey::default(),
            indices: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Sets the primary key columns.
    #[must_use]
    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = PrimaryKey {
            columns: columns.iter().map(ToString::to_string).collect(),
            auto_generate: false,
        };
        self
    }

    /// Sets a single engine-assigned INTEGER primary key.
    #[must_use]
    pub fn auto_generated_key(mut self, column: &str) -> Self {
        self.primary_key = PrimaryKey {
            columns: vec![column.to_string()],
            auto_generate: true,
        };
        self
    }

    /// Adds an index.
    #[must_use]
    pub fn index(mut self, index: Index) -> Self {
        self.indices.push(index);
        self
    }

    /// Adds a foreign key.
    #[must_use]
    pub fn foreign_key(mut self, foreign_key: ForeignKey) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    /// Looks up a field by column name (case-insensitive, as SQLite does).
    #[must_use]
    pub fn column(&self, column_name: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|f| f.column_name.eq_ignore_ascii_case(column_name))
    }

    /// Returns the 1-based position of `column_name` in the primary key, or 0.
    #[must_use]
    pub fn primary_key_position(&self, column_name: &str) -> usize {
        self.primary_key
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column_name))
            .map_or(0, |p| p + 1)
    }

    /// Checks the structural invariants of this entity.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let table = &self.table_name;

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.column_name.to_ascii_lowercase()) {
                errors.push(SchemaError::DuplicateColumn {
                    table: table.clone(),
                    column: field.column_name.clone(),
                });
            }
        }

        if self.primary_key.columns.is_empty() {
            errors.push(SchemaError::MissingPrimaryKey(table.clone()));
        }
        for column in &self.primary_key.columns {
            match self.column(column) {
                None => errors.push(SchemaError::UnknownColumn {
                    table: table.clone(),
                    column: column.clone(),
                }),
                Some(field) if !field.not_null => errors.push(SchemaError::NullablePrimaryKey {
                    table: table.clone(),
                    column: column.clone(),
                }),
                Some(_) => {}
            }
        }
        if self.primary_key.auto_generate {
            let integer_key = self.primary_key.columns.len() == 1
                && self
                    .column(&self.primary_key.columns[0])
                    .is_some_and(|f| f.affinity == Affinity::Integer);
            if !integer_key {
                errors.push(SchemaError::InvalidEntity {
                    table: table.clone(),
                    message: "an auto-generated key must be a single INTEGER column".to_string(),
                });
            }
        }

        let referenced = self
            .indices
            .iter()
            .flat_map(|i| i.columns.iter())
            .chain(self.foreign_keys.iter().flat_map(|fk| fk.columns.iter()));
        for column in referenced {
            if self.column(column).is_none() {
                errors.push(SchemaError::UnknownColumn {
                    table: table.clone(),
                    column: column.clone(),
                });
            }
        }
        for fk in &self.foreign_keys {
            if fk.columns.is_empty() || fk.columns.len() != fk.referenced_columns.len() {
                errors.push(SchemaError::InvalidEntity {
                    table: table.clone(),
                    message: format!(
                        "foreign key to '{}' must list as many child as parent columns",
                        fk.table
                    ),
                });
            }
        }

        SchemaError::collect(errors).map_or(Ok(()), Err)
    }

    /// Renders the `CREATE TABLE` statement for this entity.
    #[must_use]
    pub fn create_table_sql(&self) -> String {
        self.create_table_sql_named(&self.table_name)
    }

    /// Renders the `CREATE TABLE` statement under another table name.
    ///
    /// Used by the table-recreation strategy.
    #[must_use]
    pub fn create_table_sql_named(&self, table_name: &str) -> String {
        let auto_key = self
            .primary_key
            .auto_generate
            .then(|| self.primary_key.columns.first())
            .flatten();

        let mut parts: Vec<String> = self
            .fields
            .iter()
            .map(|f| f.definition(auto_key.is_some_and(|k| k.eq_ignore_ascii_case(&f.column_name))))
            .collect();

        if auto_key.is_none() && !self.primary_key.columns.is_empty() {
            let columns: Vec<String> = self.primary_key.columns.iter().map(|c| quote(c)).collect();
            parts.push(format!("PRIMARY KEY({})", columns.join(", ")));
        }
        parts.extend(self.foreign_keys.iter().map(ForeignKey::definition));

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote(table_name),
            parts.join(", ")
        )
    }

    /// Renders one `CREATE INDEX` statement per index.
    #[must_use]
    pub fn create_index_statements(&self) -> Vec<String> {
        self.indices
            .iter()
            .map(|i| i.create_sql(&self.table_name))
            .collect()
    }
}

/// A named, stored `SELECT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct View {
    /// View name.
    pub name: String,
    /// The `SELECT` statement backing the view.
    pub query: String,
    /// Tables (or other views) the query reads.
    #[serde(default)]
    pub tables: Vec<String>,
}

impl View {
    /// Creates a view.
    #[must_use]
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            tables: Vec::new(),
        }
    }

    /// Records a table the view reads.
    #[must_use]
    pub fn reads(mut self, table: impl Into<String>) -> Self {
        self.tables.push(table.into());
        self
    }

    /// Renders the `CREATE VIEW` statement.
    #[must_use]
    pub fn create_sql(&self) -> String {
        format!("CREATE VIEW IF NOT EXISTS {} AS {}", quote(&self.name), self.query)
    }
}

//! Auto-migration synthesis.
//!
//! Given the bundles of two versions and the renames/deletions the author
//! declared, this module produces the DDL that turns the older schema into the
//! newer one. Only structural changes are supported. A column whose affinity
//! or nullability changed needs a data transformation, so it is rejected and
//! must be covered by a manual migration instead.
//!
//! SQLite cannot drop primary keys, foreign keys or defaults in place, so
//! tables affected by such changes (or losing columns) are migrated with the
//! table-recreation strategy: create `_new_<table>`, copy the surviving
//! columns, drop the old table, rename the new one and recreate its indices.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bundle::DatabaseBundle;
use crate::diff::{diff, ColumnRef, IndexChange, SchemaDiff};
use crate::entity::{quote, Entity};
use crate::error::{Result, SchemaError};

/// A table renamed between two versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamedTable {
    /// Name in the older version.
    pub from: String,
    /// Name in the newer version.
    pub to: String,
}

/// A column renamed between two versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamedColumn {
    /// Table name in the newer version.
    pub table: String,
    /// Column name in the older version.
    pub from: String,
    /// Column name in the newer version.
    pub to: String,
}

/// Declares an auto-migration between two versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoMigrationSpec {
    /// Start version.
    pub from: u32,
    /// End version.
    pub to: u32,
    /// Tables intentionally removed.
    #[serde(default)]
    pub deleted_tables: Vec<String>,
    /// Columns intentionally removed (table names of the newer version).
    #[serde(default)]
    pub deleted_columns: Vec<ColumnRef>,
    /// Renamed tables.
    #[serde(default)]
    pub renamed_tables: Vec<RenamedTable>,
    /// Renamed columns.
    #[serde(default)]
    pub renamed_columns: Vec<RenamedColumn>,
}

impl AutoMigrationSpec {
    /// Creates a spec with no renames or deletions.
    #[must_use]
    pub fn new(from: u32, to: u32) -> Self {
        Self {
            from,
            to,
            ..Self::default()
        }
    }

    /// Declares a deleted table.
    #[must_use]
    pub fn delete_table(mut self, table: impl Into<String>) -> Self {
        self.deleted_tables.push(table.into());
        self
    }

    /// Declares a deleted column.
    #[must_use]
    pub fn delete_column(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.deleted_columns.push(ColumnRef::new(table, column));
        self
    }

    /// Declares a renamed table.
    #[must_use]
    pub fn rename_table(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.renamed_tables.push(RenamedTable {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Declares a renamed column.
    #[must_use]
    pub fn rename_column(
        mut self,
        table: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.renamed_columns.push(RenamedColumn {
            table: table.into(),
            from: from.into(),
            to: to.into(),
        });
        self
    }
}

/// A synthesized migration: plain DDL between two versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoMigration {
    /// Start version.
    pub from: u32,
    /// End version.
    pub to: u32,
    /// Statements to run in order, inside one transaction.
    pub statements: Vec<String>,
    /// Whether tables were recreated, in which case foreign key enforcement
    /// must be suspended and `PRAGMA foreign_key_check` run before commit.
    pub recreates_tables: bool,
}

impl AutoMigration {
    /// Synthesizes the migration from `from` to `to`.
    pub fn generate(
        from: &DatabaseBundle,
        to: &DatabaseBundle,
        spec: &AutoMigrationSpec,
    ) -> Result<Self> {
        if spec.from != from.version || spec.to != to.version {
            return Err(SchemaError::InvalidVersionRange {
                from: spec.from,
                to: spec.to,
                message: format!(
                    "bundles describe versions {} and {}",
                    from.version, to.version
                ),
            });
        }
        if spec.to <= spec.from {
            return Err(SchemaError::InvalidVersionRange {
                from: spec.from,
                to: spec.to,
                message: "auto-migrations must move to a newer version".to_string(),
            });
        }

        let renamed = apply_renames(from, spec)?;
        let changes = diff(&renamed, to);
        check_changes(&changes, to, spec)?;

        let mut statements = Vec::new();
        let mut recreated = Vec::new();

        let touches_tables = !changes.removed_tables.is_empty()
            || !spec.renamed_tables.is_empty()
            || !spec.renamed_columns.is_empty();
        for entity in &to.entities {
            if changes.added_tables.contains(&entity.table_name) {
                continue;
            }
            if needs_recreation(entity, &changes) {
                recreated.push(entity.table_name.clone());
            }
        }
        let rewrite_views =
            !changes.changed_views.is_empty() || touches_tables || !recreated.is_empty();

        if rewrite_views {
            for view in &from.views {
                statements.push(format!("DROP VIEW IF EXISTS {}", quote(&view.name)));
            }
        }

        for rename in &spec.renamed_tables {
            statements.push(format!(
                "ALTER TABLE {} RENAME TO {}",
                quote(&rename.from),
                quote(&rename.to)
            ));
        }
        for rename in &spec.renamed_columns {
            statements.push(format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quote(&rename.table),
                quote(&rename.from),
                quote(&rename.to)
            ));
        }
        for table in &changes.removed_tables {
            statements.push(format!("DROP TABLE IF EXISTS {}", quote(table)));
        }

        for entity in &to.entities {
            let table = &entity.table_name;
            if changes.added_tables.contains(table) {
                statements.push(entity.create_table_sql());
                statements.extend(entity.create_index_statements());
            } else if recreated.contains(table) {
                let Some(previous) = renamed.entity(table) else {
                    continue;
                };
                statements.extend(recreate_table(previous, entity));
            } else {
                for column in changes.added_columns_of(table) {
                    if let Some(field) = entity.column(column) {
                        statements.push(format!(
                            "ALTER TABLE {} ADD COLUMN {}",
                            quote(table),
                            field.definition(false)
                        ));
                    }
                }
                for altered in changes.altered_indices.iter().filter(|i| &i.table == table) {
                    if matches!(altered.change, IndexChange::Removed | IndexChange::Changed) {
                        statements.push(format!("DROP INDEX IF EXISTS {}", quote(&altered.name)));
                    }
                    if altered.change != IndexChange::Removed {
                        if let Some(index) = entity.indices.iter().find(|i| i.name == altered.name)
                        {
                            statements.push(index.create_sql(table));
                        }
                    }
                }
            }
        }

        if rewrite_views {
            for view in &to.views {
                statements.push(view.create_sql());
            }
        }

        debug!(
            from = spec.from,
            to = spec.to,
            statements = statements.len(),
            recreated = ?recreated,
            "Synthesized auto-migration"
        );

        Ok(Self {
            from: spec.from,
            to: spec.to,
            statements,
            recreates_tables: !recreated.is_empty(),
        })
    }
}

/// Returns a copy of `from` with the declared renames applied, so that it can
/// be diffed against the newer bundle by name.
fn apply_renames(from: &DatabaseBundle, spec: &AutoMigrationSpec) -> Result<DatabaseBundle> {
    let mut renamed = from.clone();

    for rename in &spec.renamed_tables {
        let entity = renamed
            .entities
            .iter_mut()
            .find(|e| e.table_name.eq_ignore_ascii_case(&rename.from))
            .ok_or_else(|| SchemaError::UnknownTable(rename.from.clone()))?;
        entity.table_name.clone_from(&rename.to);
        for other in &mut renamed.entities {
            for fk in &mut other.foreign_keys {
                if fk.table.eq_ignore_ascii_case(&rename.from) {
                    fk.table.clone_from(&rename.to);
                }
            }
        }
    }

    for rename in &spec.renamed_columns {
        let entity = renamed
            .entities
            .iter_mut()
            .find(|e| e.table_name.eq_ignore_ascii_case(&rename.table))
            .ok_or_else(|| SchemaError::UnknownTable(rename.table.clone()))?;
        let field = entity
            .fields
            .iter_mut()
            .find(|f| f.column_name.eq_ignore_ascii_case(&rename.from))
            .ok_or_else(|| SchemaError::UnknownColumn {
                table: rename.table.clone(),
                column: rename.from.clone(),
            })?;
        field.column_name.clone_from(&rename.to);
        for column in entity
            .primary_key
            .columns
            .iter_mut()
            .chain(entity.indices.iter_mut().flat_map(|i| i.columns.iter_mut()))
            .chain(entity.foreign_keys.iter_mut().flat_map(|fk| fk.columns.iter_mut()))
        {
            if column.eq_ignore_ascii_case(&rename.from) {
                column.clone_from(&rename.to);
            }
        }
    }

    Ok(renamed)
}

fn check_changes(
    changes: &SchemaDiff,
    to: &DatabaseBundle,
    spec: &AutoMigrationSpec,
) -> Result<()> {
    let mut errors: Vec<SchemaError> = changes
        .altered_columns
        .iter()
        .map(|a| SchemaError::AlteredColumn {
            table: a.table.clone(),
            column: a.column.clone(),
            change: a.change,
        })
        .collect();

    for table in &changes.removed_tables {
        if !spec
            .deleted_tables
            .iter()
            .any(|t| t.eq_ignore_ascii_case(table))
        {
            errors.push(SchemaError::RemovedTable(table.clone()));
        }
    }
    for column in &changes.removed_columns {
        let declared = spec.deleted_columns.iter().any(|c| {
            c.table.eq_ignore_ascii_case(&column.table)
                && c.column.eq_ignore_ascii_case(&column.column)
        });
        if !declared {
            errors.push(SchemaError::RemovedColumn {
                table: column.table.clone(),
                column: column.column.clone(),
            });
        }
    }
    for column in &changes.added_columns {
        let field = to
            .entity(&column.table)
            .and_then(|e| e.column(&column.column));
        if field.is_some_and(|f| f.not_null && f.default_value.is_none()) {
            errors.push(SchemaError::MissingDefault {
                table: column.table.clone(),
                column: column.column.clone(),
            });
        }
    }

    SchemaError::collect(errors).map_or(Ok(()), Err)
}

fn needs_recreation(entity: &Entity, changes: &SchemaDiff) -> bool {
    let table = &entity.table_name;
    changes.rebuilt_tables.contains(table)
        || changes.has_removed_columns(table)
        || changes
            .added_columns_of(table)
            .any(|c| entity.primary_key_position(c) > 0)
}

fn recreate_table(previous: &Entity, entity: &Entity) -> Vec<String> {
    let table = &entity.table_name;
    let temporary = format!("_new_{table}");
    let copied: Vec<String> = entity
        .fields
        .iter()
        .filter(|f| previous.column(&f.column_name).is_some())
        .map(|f| quote(&f.column_name))
        .collect();

    let mut statements = vec![entity.create_table_sql_named(&temporary)];
    if !copied.is_empty() {
        statements.push(format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            quote(&temporary),
            copied.join(", "),
            copied.join(", "),
            quote(table)
        ));
    }
    statements.push(format!("DROP TABLE {}", quote(table)));
    statements.push(format!(
        "ALTER TABLE {} RENAME TO {}",
        quote(&temporary),
        quote(table)
    ));
    statements.extend(entity.create_index_statements());
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Affinity, Field, Index, View};
    use crate::error::ColumnChange;

    fn word_v1() -> Entity {
        Entity::new("word_table")
            .field(Field::new("word", Affinity::Text).not_null())
            .primary_key(&["word"])
    }

    fn bundle(version: u32, entities: Vec<Entity>) -> DatabaseBundle {
        DatabaseBundle::new(version, entities, Vec::new()).unwrap()
    }

    #[test]
    fn test_additive_column() {
        let v2 = word_v1().field(
            Field::new("date", Affinity::Integer)
                .not_null()
                .default_value("0"),
        );
        let migration = AutoMigration::generate(
            &bundle(1, vec![word_v1()]),
            &bundle(2, vec![v2]),
            &AutoMigrationSpec::new(1, 2),
        )
        .unwrap();

        assert_eq!(
            migration.statements,
            vec!["ALTER TABLE `word_table` ADD COLUMN `date` INTEGER NOT NULL DEFAULT 0"]
        );
        assert!(!migration.recreates_tables);
    }

    #[test]
    fn test_altered_affinity_fails() {
        let v2 = Entity::new("word_table")
            .field(Field::new("word", Affinity::Integer).not_null())
            .primary_key(&["word"]);
        let err = AutoMigration::generate(
            &bundle(1, vec![word_v1()]),
            &bundle(2, vec![v2]),
            &AutoMigrationSpec::new(1, 2),
        )
        .unwrap_err();

        match err {
            SchemaError::AlteredColumn {
                table,
                column,
                change,
            } => {
                assert_eq!(table, "word_table");
                assert_eq!(column, "word");
                assert_eq!(
                    change,
                    ColumnChange::Affinity {
                        from: Affinity::Text,
                        to: Affinity::Integer
                    }
                );
            }
            other => panic!("Expected AlteredColumn, got {other:?}"),
        }
        let message = AutoMigration::generate(
            &bundle(1, vec![word_v1()]),
            &bundle(
                2,
                vec![Entity::new("word_table")
                    .field(Field::new("word", Affinity::Integer).not_null())
                    .primary_key(&["word"])],
            ),
            &AutoMigrationSpec::new(1, 2),
        )
        .unwrap_err()
        .to_string();
        assert!(message.contains("word_table.word"));
    }

    #[test]
    fn test_not_null_column_without_default_fails() {
        let v2 = word_v1().field(Field::new("date", Affinity::Integer).not_null());
        let err = AutoMigration::generate(
            &bundle(1, vec![word_v1()]),
            &bundle(2, vec![v2]),
            &AutoMigrationSpec::new(1, 2),
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::MissingDefault { column, .. } if column == "date"));
    }

    #[test]
    fn test_removed_table_requires_declaration() {
        let other = Entity::new("other")
            .field(Field::new("id", Affinity::Integer).not_null())
            .primary_key(&["id"]);
        let from = bundle(1, vec![word_v1(), other]);
        let to = bundle(2, vec![word_v1()]);

        let err = AutoMigration::generate(&from, &to, &AutoMigrationSpec::new(1, 2)).unwrap_err();
        assert!(matches!(err, SchemaError::RemovedTable(t) if t == "other"));

        let migration =
            AutoMigration::generate(&from, &to, &AutoMigrationSpec::new(1, 2).delete_table("other"))
                .unwrap();
        assert_eq!(migration.statements, vec!["DROP TABLE IF EXISTS `other`"]);
    }

    #[test]
    fn test_removed_column_recreates_table() {
        let v1 = word_v1()
            .field(Field::new("legacy", Affinity::Text))
            .index(Index::on("word_table", &["word"]));
        let v2 = word_v1().index(Index::on("word_table", &["word"]));
        let from = bundle(1, vec![v1]);
        let to = bundle(2, vec![v2]);

        assert!(matches!(
            AutoMigration::generate(&from, &to, &AutoMigrationSpec::new(1, 2)),
            Err(SchemaError::RemovedColumn { .. })
        ));

        let migration = AutoMigration::generate(
            &from,
            &to,
            &AutoMigrationSpec::new(1, 2).delete_column("word_table", "legacy"),
        )
        .unwrap();
        assert!(migration.recreates_tables);
        assert_eq!(
            migration.statements,
            vec![
                "CREATE TABLE IF NOT EXISTS `_new_word_table` (`word` TEXT NOT NULL, PRIMARY KEY(`word`))",
                "INSERT INTO `_new_word_table` (`word`) SELECT `word` FROM `word_table`",
                "DROP TABLE `word_table`",
                "ALTER TABLE `_new_word_table` RENAME TO `word_table`",
                "CREATE INDEX IF NOT EXISTS `index_word_table_word` ON `word_table` (`word`)",
            ]
        );
    }

    #[test]
    fn test_renames() {
        let v1 = word_v1().field(Field::new("when", Affinity::Integer));
        let v2 = Entity::new("words")
            .field(Field::new("word", Affinity::Text).not_null())
            .field(Field::new("date", Affinity::Integer))
            .primary_key(&["word"]);
        let spec = AutoMigrationSpec::new(1, 2)
            .rename_table("word_table", "words")
            .rename_column("words", "when", "date");

        let migration =
            AutoMigration::generate(&bundle(1, vec![v1]), &bundle(2, vec![v2]), &spec).unwrap();
        assert_eq!(
            migration.statements,
            vec![
                "ALTER TABLE `word_table` RENAME TO `words`",
                "ALTER TABLE `words` RENAME COLUMN `when` TO `date`",
            ]
        );
    }

    #[test]
    fn test_views_are_rewritten() {
        let from = DatabaseBundle::new(
            1,
            vec![word_v1()],
            vec![View::new("all_words", "SELECT word FROM word_table").reads("word_table")],
        )
        .unwrap();
        let to = DatabaseBundle::new(
            2,
            vec![word_v1()],
            vec![View::new("all_words", "SELECT upper(word) AS word FROM word_table")
                .reads("word_table")],
        )
        .unwrap();

        let migration =
            AutoMigration::generate(&from, &to, &AutoMigrationSpec::new(1, 2)).unwrap();
        assert_eq!(migration.statements.len(), 2);
        assert_eq!(migration.statements[0], "DROP VIEW IF EXISTS `all_words`");
        assert!(migration.statements[1].starts_with("CREATE VIEW IF NOT EXISTS `all_words`"));
    }

    #[test]
    fn test_rejects_backwards_range() {
        let err = AutoMigration::generate(
            &bundle(2, vec![word_v1()]),
            &bundle(1, vec![word_v1()]),
            &AutoMigrationSpec::new(2, 1),
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidVersionRange { .. }));
    }
}

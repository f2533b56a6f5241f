//! Structural comparison of two schema bundles.
//!
//! Tables are matched by name and fields by column name. Renames are not
//! detected here: callers that know about renames normalize the older bundle
//! first (see [`crate::automigration`]).

use crate::bundle::DatabaseBundle;
use crate::entity::{Entity, Index};
use crate::error::ColumnChange;

/// A `table.column` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ColumnRef {
    /// Table name.
    pub table: String,
    /// Column name.
    pub column: String,
}

impl ColumnRef {
    /// Creates a column reference.
    #[must_use]
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

/// A column present in both versions whose affinity or nullability changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlteredColumn {
    /// Table name.
    pub table: String,
    /// Column name.
    pub column: String,
    /// What changed.
    pub change: ColumnChange,
}

/// How an index changed between versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexChange {
    /// Only present in the newer version.
    Added,
    /// Only present in the older version.
    Removed,
    /// Present in both with different columns or uniqueness.
    Changed,
}

/// An index difference on a table present in both versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlteredIndex {
    /// Table name.
    pub table: String,
    /// Index name.
    pub name: String,
    /// What changed.
    pub change: IndexChange,
}

/// The difference between two bundles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    /// Tables only present in the newer version.
    pub added_tables: Vec<String>,
    /// Tables only present in the older version.
    pub removed_tables: Vec<String>,
    /// Columns only present in the newer version.
    pub added_columns: Vec<ColumnRef>,
    /// Columns only present in the older version.
    pub removed_columns: Vec<ColumnRef>,
    /// Columns whose affinity or nullability changed.
    pub altered_columns: Vec<AlteredColumn>,
    /// Index changes on common tables.
    pub altered_indices: Vec<AlteredIndex>,
    /// Common tables whose primary key, foreign keys or column defaults
    /// changed. These can only be migrated by recreating the table.
    pub rebuilt_tables: Vec<String>,
    /// Views that were added, removed or redefined.
    pub changed_views: Vec<String>,
}

impl SchemaDiff {
    /// Returns true when the two bundles are structurally identical.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added_tables.is_empty()
            && self.removed_tables.is_empty()
            && self.added_columns.is_empty()
            && self.removed_columns.is_empty()
            && self.altered_columns.is_empty()
            && self.altered_indices.is_empty()
            && self.rebuilt_tables.is_empty()
            && self.changed_views.is_empty()
    }

    /// Returns the columns added to `table`.
    pub fn added_columns_of<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.added_columns
            .iter()
            .filter(move |c| c.table == table)
            .map(|c| c.column.as_str())
    }

    /// Returns true when `table` lost columns.
    #[must_use]
    pub fn has_removed_columns(&self, table: &str) -> bool {
        self.removed_columns.iter().any(|c| c.table == table)
    }
}

/// Compares two bundles.
#[must_use]
pub fn diff(from: &DatabaseBundle, to: &DatabaseBundle) -> SchemaDiff {
    let mut out = SchemaDiff::default();

    for new in &to.entities {
        match from.entity(&new.table_name) {
            None => out.added_tables.push(new.table_name.clone()),
            Some(old) => diff_entity(old, new, &mut out),
        }
    }
    for old in &from.entities {
        if to.entity(&old.table_name).is_none() {
            out.removed_tables.push(old.table_name.clone());
        }
    }

    for view in &to.views {
        if from.view(&view.name) != Some(view) {
            out.changed_views.push(view.name.clone());
        }
    }
    for view in &from.views {
        if to.view(&view.name).is_none() {
            out.changed_views.push(view.name.clone());
        }
    }

    out
}

fn diff_entity(old: &Entity, new: &Entity, out: &mut SchemaDiff) {
    let table = &new.table_name;
    let mut rebuild = old.primary_key != new.primary_key || old.foreign_keys != new.foreign_keys;

    for field in &new.fields {
        let Some(previous) = old.column(&field.column_name) else {
            out.added_columns
                .push(ColumnRef::new(table.clone(), field.column_name.clone()));
            continue;
        };
        if previous.affinity != field.affinity {
            out.altered_columns.push(AlteredColumn {
                table: table.clone(),
                column: field.column_name.clone(),
                change: ColumnChange::Affinity {
                    from: previous.affinity,
                    to: field.affinity,
                },
            });
        }
        if previous.not_null != field.not_null {
            out.altered_columns.push(AlteredColumn {
                table: table.clone(),
                column: field.column_name.clone(),
                change: ColumnChange::Nullability {
                    from_not_null: previous.not_null,
                    to_not_null: field.not_null,
                },
            });
        }
        if previous.default_value != field.default_value {
            rebuild = true;
        }
    }
    for field in &old.fields {
        if new.column(&field.column_name).is_none() {
            out.removed_columns
                .push(ColumnRef::new(table.clone(), field.column_name.clone()));
        }
    }

    diff_indices(table, &old.indices, &new.indices, out);

    if rebuild {
        out.rebuilt_tables.push(table.clone());
    }
}

fn diff_indices(table: &str, old: &[Index], new: &[Index], out: &mut SchemaDiff) {
    for index in new {
        let change = match old.iter().find(|i| i.name.eq_ignore_ascii_case(&index.name)) {
            None => Some(IndexChange::Added),
            Some(previous) if previous != index => Some(IndexChange::Changed),
            Some(_) => None,
        };
        if let Some(change) = change {
            out.altered_indices.push(AlteredIndex {
                table: table.to_string(),
                name: index.name.clone(),
                change,
            });
        }
    }
    for index in old {
        if !new.iter().any(|i| i.name.eq_ignore_ascii_case(&index.name)) {
            out.altered_indices.push(AlteredIndex {
                table: table.to_string(),
                name: index.name.clone(),
                change: IndexChange::Removed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Affinity, Field, View};

    fn word_v1() -> Entity {
        Entity::new("word_table")
            .field(Field::new("word", Affinity::Text).not_null())
            .primary_key(&["word"])
    }

    fn bundle(version: u32, entities: Vec<Entity>) -> DatabaseBundle {
        DatabaseBundle::new(version, entities, Vec::new()).unwrap()
    }

    #[test]
    fn test_identical_bundles() {
        let d = diff(&bundle(1, vec![word_v1()]), &bundle(2, vec![word_v1()]));
        assert!(d.is_empty());
    }

    #[test]
    fn test_added_column() {
        let v2 = word_v1().field(
            Field::new("date", Affinity::Integer)
                .not_null()
                .default_value("0"),
        );
        let d = diff(&bundle(1, vec![word_v1()]), &bundle(2, vec![v2]));
        assert_eq!(d.added_columns, vec![ColumnRef::new("word_table", "date")]);
        assert!(d.altered_columns.is_empty());
        assert!(d.rebuilt_tables.is_empty());
    }

    #[test]
    fn test_altered_affinity() {
        let v2 = Entity::new("word_table")
            .field(Field::new("word", Affinity::Integer).not_null())
            .primary_key(&["word"]);
        let d = diff(&bundle(1, vec![word_v1()]), &bundle(2, vec![v2]));
        assert_eq!(
            d.altered_columns,
            vec![AlteredColumn {
                table: "word_table".into(),
                column: "word".into(),
                change: ColumnChange::Affinity {
                    from: Affinity::Text,
                    to: Affinity::Integer,
                },
            }]
        );
    }

    #[test]
    fn test_added_and_removed_tables() {
        let other = Entity::new("other")
            .field(Field::new("id", Affinity::Integer).not_null())
            .primary_key(&["id"]);
        let d = diff(&bundle(1, vec![word_v1()]), &bundle(2, vec![other]));
        assert_eq!(d.added_tables, vec!["other"]);
        assert_eq!(d.removed_tables, vec!["word_table"]);
    }

    #[test]
    fn test_index_changes() {
        let v1 = word_v1().index(Index::on("word_table", &["word"]));
        let v2 = word_v1().index(Index::on("word_table", &["word"]).unique());
        let d = diff(&bundle(1, vec![v1]), &bundle(2, vec![v2]));
        assert_eq!(d.altered_indices.len(), 1);
        assert_eq!(d.altered_indices[0].change, IndexChange::Changed);
    }

    #[test]
    fn test_default_change_requires_rebuild() {
        let v1 = word_v1().field(Field::new("n", Affinity::Integer).default_value("1"));
        let v2 = word_v1().field(Field::new("n", Affinity::Integer).default_value("2"));
        let d = diff(&bundle(1, vec![v1]), &bundle(2, vec![v2]));
        assert_eq!(d.rebuilt_tables, vec!["word_table"]);
    }

    #[test]
    fn test_view_changes() {
        let v1 = DatabaseBundle::new(
            1,
            vec![word_v1()],
            vec![View::new("v", "SELECT word FROM word_table").reads("word_table")],
        )
        .unwrap();
        let v2 = DatabaseBundle::new(2, vec![word_v1()], Vec::new()).unwrap();
        assert_eq!(diff(&v1, &v2).changed_views, vec!["v"]);
    }
}

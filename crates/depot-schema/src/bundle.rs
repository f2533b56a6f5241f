//! Versioned schema bundles.
//!
//! A bundle is the complete schema of one database version. Bundles are
//! exported as `<dir>/<version>.json` so that a later version can diff
//! against them, and they carry the identity hash the runtime stores in the
//! master table.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::entity::{Entity, View};
use crate::error::{Result, SchemaError};

/// The schema of one database version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseBundle {
    /// Schema version, starting at 1.
    pub version: u32,
    /// Fingerprint of the create statements.
    #[serde(default)]
    pub identity_hash: String,
    /// Entities in declaration order.
    pub entities: Vec<Entity>,
    /// Views in declaration order.
    #[serde(default)]
    pub views: Vec<View>,
}

impl DatabaseBundle {
    /// Builds and validates a bundle, computing its identity hash.
    pub fn new(version: u32, entities: Vec<Entity>, views: Vec<View>) -> Result<Self> {
        let mut bundle = Self {
            version,
            identity_hash: String::new(),
            entities,
            views,
        };
        bundle.validate()?;
        bundle.identity_hash = bundle.compute_identity_hash();
        Ok(bundle)
    }

    /// Checks every entity plus the cross-entity invariants.
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 {
            return Err(SchemaError::InvalidVersionRange {
                from: 0,
                to: 0,
                message: "schema versions start at 1".to_string(),
            });
        }

        let mut errors = Vec::new();
        let mut names = HashSet::new();
        let mut index_names = HashSet::new();

        for entity in &self.entities {
            if !names.insert(entity.table_name.to_ascii_lowercase()) {
                errors.push(SchemaError::DuplicateEntity(entity.table_name.clone()));
            }
            if let Err(e) = entity.validate() {
                errors.push(e);
            }
            for index in &entity.indices {
                if !index_names.insert(index.name.to_ascii_lowercase()) {
                    errors.push(SchemaError::DuplicateIndex(index.name.clone()));
                }
            }
        }
        for view in &self.views {
            if !names.insert(view.name.to_ascii_lowercase()) {
                errors.push(SchemaError::DuplicateEntity(view.name.clone()));
            }
        }

        for entity in &self.entities {
            for fk in &entity.foreign_keys {
                let Some(parent) = self.entity(&fk.table) else {
                    errors.push(SchemaError::UnknownTable(fk.table.clone()));
                    continue;
                };
                for column in &fk.referenced_columns {
                    if parent.column(column).is_none() {
                        errors.push(SchemaError::UnknownColumn {
                            table: parent.table_name.clone(),
                            column: column.clone(),
                        });
                    }
                }
            }
        }

        SchemaError::collect(errors).map_or(Ok(()), Err)
    }

    /// Looks up an entity by table name.
    #[must_use]
    pub fn entity(&self, table_name: &str) -> Option<&Entity> {
        self.entities
            .iter()
            .find(|e| e.table_name.eq_ignore_ascii_case(table_name))
    }

    /// Looks up a view by name.
    #[must_use]
    pub fn view(&self, name: &str) -> Option<&View> {
        self.views.iter().find(|v| v.name.eq_ignore_ascii_case(name))
    }

    /// Resolves a table or view name to the set of underlying tables.
    ///
    /// Views are expanded recursively. Unknown names yield `None`.
    #[must_use]
    pub fn resolve_tables(&self, name: &str) -> Option<Vec<String>> {
        let mut out = Vec::new();
        let mut visiting = HashSet::new();
        self.resolve_into(name, &mut out, &mut visiting)?;
        Some(out)
    }

    fn resolve_into(
        &self,
        name: &str,
        out: &mut Vec<String>,
        visiting: &mut HashSet<String>,
    ) -> Option<()> {
        if let Some(entity) = self.entity(name) {
            if !out.contains(&entity.table_name) {
                out.push(entity.table_name.clone());
            }
            return Some(());
        }
        let view = self.view(name)?;
        if !visiting.insert(view.name.to_ascii_lowercase()) {
            return Some(());
        }
        for table in &view.tables {
            self.resolve_into(table, out, visiting)?;
        }
        Some(())
    }

    /// Tables whose rows a write to `table` can change: the table itself,
    /// then every table reached through a foreign key whose delete or update
    /// action modifies the child rows.
    ///
    /// The walk is transitive, so a cascade through an intermediate table
    /// reaches its own children too.
    #[must_use]
    pub fn affected_tables(&self, table: &str) -> Vec<String> {
        let Some(root) = self.entity(table) else {
            return vec![table.to_string()];
        };
        let mut out = vec![root.table_name.clone()];
        let mut next = 0;
        while next < out.len() {
            let parent = out[next].clone();
            next += 1;
            for child in &self.entities {
                let propagates = child.foreign_keys.iter().any(|fk| {
                    fk.table.eq_ignore_ascii_case(&parent)
                        && (fk.on_delete.modifies_children() || fk.on_update.modifies_children())
                });
                if propagates && !out.contains(&child.table_name) {
                    out.push(child.table_name.clone());
                }
            }
        }
        out
    }

    /// Returns every statement needed to create this schema from scratch:
    /// tables, then indices, then views.
    #[must_use]
    pub fn create_statements(&self) -> Vec<String> {
        let mut statements: Vec<String> =
            self.entities.iter().map(Entity::create_table_sql).collect();
        statements.extend(self.entities.iter().flat_map(Entity::create_index_statements));
        statements.extend(self.views.iter().map(View::create_sql));
        statements
    }

    /// Computes the identity hash: SHA-256 over the sorted create statements.
    #[must_use]
    pub fn compute_identity_hash(&self) -> String {
        let mut statements = self.create_statements();
        statements.sort();
        let mut hasher = Sha256::new();
        for statement in &statements {
            hasher.update(statement.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Serializes the bundle as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses and validates a bundle, recomputing its identity hash.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut bundle: Self = serde_json::from_str(json)?;
        bundle.validate()?;
        let computed = bundle.compute_identity_hash();
        if !bundle.identity_hash.is_empty() && bundle.identity_hash != computed {
            warn!(
                version = bundle.version,
                stored = %bundle.identity_hash,
                computed = %computed,
                "Stored identity hash does not match bundle content"
            );
        }
        bundle.identity_hash = computed;
        Ok(bundle)
    }

    /// Returns the bundle file path for `version` inside `dir`.
    #[must_use]
    pub fn path_for(dir: &Path, version: u32) -> PathBuf {
        dir.join(format!("{version}.json"))
    }

    /// Writes the bundle into `dir`, leaving an identical file untouched.
    pub fn export(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = Self::path_for(dir, self.version);
        let json = self.to_json()?;

        match fs::read_to_string(&path) {
            Ok(existing) if existing == json => {
                debug!(path = %path.display(), "Schema bundle unchanged");
                return Ok(path);
            }
            Ok(_) => {
                info!(path = %path.display(), version = self.version, "Overwriting schema bundle");
            }
            Err(_) => {
                info!(path = %path.display(), version = self.version, "Exporting schema bundle");
            }
        }
        fs::write(&path, json)?;
        Ok(path)
    }

    /// Loads the bundle for `version` from `dir`.
    pub fn load(dir: &Path, version: u32) -> Result<Self> {
        let path = Self::path_for(dir, version);
        if !path.exists() {
            return Err(SchemaError::MissingBundle { version, path });
        }
        let bundle = Self::from_json(&fs::read_to_string(&path)?)?;
        if bundle.version != version {
            return Err(SchemaError::InvalidVersionRange {
                from: version,
                to: bundle.version,
                message: format!("{} declares the wrong version", path.display()),
            });
        }
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Affinity, Field, ForeignKey, ForeignKeyAction, Index};

    fn word() -> Entity {
        Entity::new("word_table")
            .field(Field::new("word", Affinity::Text).not_null())
            .primary_key(&["word"])
    }

    #[test]
    fn test_new_computes_hash() {
        let bundle = DatabaseBundle::new(1, vec![word()], Vec::new()).unwrap();
        assert_eq!(bundle.identity_hash.len(), 64);
        assert_eq!(bundle.identity_hash, bundle.compute_identity_hash());
    }

    #[test]
    fn test_hash_ignores_declaration_order() {
        let other = Entity::new("other")
            .field(Field::new("id", Affinity::Integer).not_null())
            .primary_key(&["id"]);
        let a = DatabaseBundle::new(1, vec![word(), other.clone()], Vec::new()).unwrap();
        let b = DatabaseBundle::new(1, vec![other, word()], Vec::new()).unwrap();
        assert_eq!(a.identity_hash, b.identity_hash);
    }

    #[test]
    fn test_hash_changes_with_schema() {
        let a = DatabaseBundle::new(1, vec![word()], Vec::new()).unwrap();
        let b = DatabaseBundle::new(
            1,
            vec![word().index(Index::on("word_table", &["word"]))],
            Vec::new(),
        )
        .unwrap();
        assert_ne!(a.identity_hash, b.identity_hash);
    }

    #[test]
    fn test_duplicate_entity() {
        let err = DatabaseBundle::new(1, vec![word(), word()], Vec::new()).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateEntity(name) if name == "word_table"));
    }

    #[test]
    fn test_view_name_clashes_with_entity() {
        let err = DatabaseBundle::new(
            1,
            vec![word()],
            vec![View::new("word_table", "SELECT 1")],
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateEntity(_)));
    }

    #[test]
    fn test_unknown_foreign_key_parent() {
        let child = Entity::new("child")
            .field(Field::new("id", Affinity::Integer).not_null())
            .primary_key(&["id"])
            .foreign_key(ForeignKey {
                table: "missing".into(),
                columns: vec!["id".into()],
                referenced_columns: vec!["id".into()],
                on_delete: Default::default(),
                on_update: Default::default(),
                deferred: false,
            });
        let err = DatabaseBundle::new(1, vec![child], Vec::new()).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownTable(name) if name == "missing"));
    }

    #[test]
    fn test_resolve_tables_through_views() {
        let bundle = DatabaseBundle::new(
            1,
            vec![word()],
            vec![
                View::new("recent", "SELECT * FROM word_table").reads("word_table"),
                View::new("recent_upper", "SELECT upper(word) FROM recent").reads("recent"),
            ],
        )
        .unwrap();
        assert_eq!(
            bundle.resolve_tables("recent_upper"),
            Some(vec!["word_table".to_string()])
        );
        assert_eq!(bundle.resolve_tables("nope"), None);
    }

    fn child_of(table: &str, parent: &str, on_delete: ForeignKeyAction) -> Entity {
        Entity::new(table)
            .field(Field::new("id", Affinity::Integer).not_null())
            .field(Field::new("parent", Affinity::Text))
            .primary_key(&["id"])
            .foreign_key(ForeignKey {
                table: parent.into(),
                columns: vec!["parent".into()],
                referenced_columns: vec![if parent == "word_table" { "word" } else { "id" }.into()],
                on_delete,
                on_update: ForeignKeyAction::NoAction,
                deferred: false,
            })
    }

    #[test]
    fn test_affected_tables_follow_cascades() {
        let bundle = DatabaseBundle::new(
            1,
            vec![
                word(),
                child_of("definition", "word_table", ForeignKeyAction::Cascade),
                child_of("example", "definition", ForeignKeyAction::SetNull),
                child_of("audit", "word_table", ForeignKeyAction::Restrict),
            ],
            Vec::new(),
        )
        .unwrap();
        assert_eq!(
            bundle.affected_tables("WORD_TABLE"),
            vec!["word_table", "definition", "example"]
        );
        assert_eq!(bundle.affected_tables("audit"), vec!["audit"]);
        assert_eq!(bundle.affected_tables("nope"), vec!["nope"]);
    }

    #[test]
    fn test_export_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = DatabaseBundle::new(3, vec![word()], Vec::new()).unwrap();

        let path = bundle.export(dir.path()).unwrap();
        assert!(path.ends_with("3.json"));

        let loaded = DatabaseBundle::load(dir.path(), 3).unwrap();
        assert_eq!(loaded, bundle);

        assert!(matches!(
            DatabaseBundle::load(dir.path(), 4),
            Err(SchemaError::MissingBundle { version: 4, .. })
        ));
    }

    #[test]
    fn test_from_json_without_hash() {
        let json = r#"{
            "version": 1,
            "entities": [{
                "table_name": "word_table",
                "fields": [{"name": "word", "column_name": "word", "affinity": "TEXT", "not_null": true}],
                "primary_key": {"columns": ["word"]}
            }]
        }"#;
        let bundle = DatabaseBundle::from_json(json).unwrap();
        let expected = DatabaseBundle::new(1, vec![word()], Vec::new()).unwrap();
        assert_eq!(bundle.identity_hash, expected.identity_hash);
    }
}

//! The schema model: declarations resolved into typed entities and a bundle.

use std::sync::LazyLock;

use depot_schema::{DatabaseBundle, Entity, Field, ForeignKey, Index, PrimaryKey, View};
use regex::Regex;
use tracing::debug;

use crate::declaration::{Declaration, EntityDecl};
use crate::error::{CompileError, Result};
use crate::query::{AnalyzedQuery, ResultColumn};
use crate::types::{Converter, Scalar, TypeResolver, ValueKind, ValueType};

const RUST_KEYWORDS: &[&str] = &[
    "as", "async", "await", "break", "const", "continue", "crate", "dyn", "else", "enum",
    "extern", "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move",
    "mut", "pub", "ref", "return", "self", "Self", "static", "struct", "super", "trait", "true",
    "type", "unsafe", "use", "where", "while", "yield",
];

static SNAKE_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("Invalid identifier regex"));

static TYPE_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Za-z0-9]*$").expect("Invalid type name regex"));

/// Checks that `name` can be used as a snake-case Rust identifier.
pub(crate) fn check_snake_ident(location: &str, name: &str) -> Option<CompileError> {
    if !SNAKE_IDENT.is_match(name) {
        return Some(CompileError::invalid(
            location,
            format!("'{name}' is not a snake_case identifier"),
        ));
    }
    RUST_KEYWORDS.contains(&name).then(|| {
        CompileError::invalid(location, format!("'{name}' is a reserved word"))
    })
}

/// Checks that `name` can be used as a Rust type name.
pub(crate) fn check_type_ident(location: &str, name: &str) -> Option<CompileError> {
    (!TYPE_IDENT.is_match(name)).then(|| {
        CompileError::invalid(location, format!("'{name}' is not a CamelCase type name"))
    })
}

/// Converts `CamelCase` to `snake_case`.
#[must_use]
pub fn snake_case(name: &str) -> String {
    let mut out = String::new();
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// A field with its resolved type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldModel {
    /// Field name on the row type.
    pub name: String,
    /// Column name.
    pub column: String,
    /// Resolved type.
    pub ty: ValueType,
    /// Whether the field is part of the primary key.
    pub primary_key: bool,
}

/// An entity with resolved field types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityModel {
    /// Row type name.
    pub name: String,
    /// Table name.
    pub table: String,
    /// Fields in column order.
    pub fields: Vec<FieldModel>,
    /// Primary key fields, as indices into `fields`, in key order.
    pub primary_key: Vec<usize>,
    /// Whether the key is assigned by the engine.
    pub auto_generate: bool,
}

impl EntityModel {
    /// Finds a field by column name.
    #[must_use]
    pub fn field_by_column(&self, column: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.column.eq_ignore_ascii_case(column))
    }
}

/// Declarations resolved into typed entities plus the schema bundle.
#[derive(Debug, Clone)]
pub struct SchemaModel {
    /// Database type name.
    pub name: String,
    /// Schema of the current version.
    pub bundle: DatabaseBundle,
    /// Entities, in declaration order.
    pub entities: Vec<EntityModel>,
    /// Type resolver including all converters.
    pub resolver: TypeResolver,
}

impl SchemaModel {
    /// Resolves the schema part of a declaration.
    pub fn build(decl: &Declaration) -> Result<Self> {
        let mut errors = Vec::new();
        errors.extend(check_type_ident("database", &decl.database.name));

        let mut converters = Vec::new();
        for converter in &decl.type_converters {
            match Converter::from_decl(converter) {
                Some(c) => converters.push(c),
                None => errors.push(CompileError::invalid(
                    format!("converter {}", converter.ty),
                    format!("'{}' is not a storable column type", converter.column),
                )),
            }
        }
        let resolver = TypeResolver::new(converters);

        let mut entities = Vec::new();
        let mut resolved = Vec::new();
        let mut schema_entities = Vec::new();
        for entity in &decl.entities {
            if entities
                .iter()
                .any(|e: &EntityModel| e.name == entity.name)
            {
                errors.push(CompileError::DuplicateDeclaration {
                    kind: "entity",
                    key: entity.name.clone(),
                });
                continue;
            }
            match resolve_entity(entity, &resolver) {
                Ok(model) => {
                    entities.push(model);
                    resolved.push(entity);
                }
                Err(e) => errors.push(e),
            }
        }
        for (decl_entity, model) in resolved.iter().zip(&entities) {
            match schema_entity(decl_entity, model, &entities) {
                Ok(entity) => schema_entities.push(entity),
                Err(e) => errors.push(e),
            }
        }

        let known: Vec<String> = entities
            .iter()
            .map(|e| e.table.clone())
            .chain(decl.views.iter().map(|v| v.name.clone()))
            .collect();
        let mut views = Vec::new();
        for view in &decl.views {
            let location = format!("view {}", view.name);
            match AnalyzedQuery::parse(&view.query) {
                Ok(query) => {
                    let mut model = View::new(view.name.clone(), view.query.clone());
                    for table in query.tables() {
                        if known.iter().any(|k| k.eq_ignore_ascii_case(&table)) {
                            model = model.reads(table);
                        } else {
                            debug!(view = %view.name, table = %table, "Ignoring unknown table in view");
                        }
                    }
                    views.push(model);
                }
                Err(message) => errors.push(CompileError::invalid(location, message)),
            }
        }

        if let Some(error) = CompileError::collect(errors) {
            return Err(error);
        }

        let bundle = DatabaseBundle::new(decl.database.version, schema_entities, views)?;
        Ok(Self {
            name: decl.database.name.clone(),
            bundle,
            entities,
            resolver,
        })
    }

    /// Finds an entity by row type name.
    #[must_use]
    pub fn entity_named(&self, name: &str) -> Option<usize> {
        self.entities.iter().position(|e| e.name == name)
    }

    /// Finds an entity by table name.
    #[must_use]
    pub fn entity_for_table(&self, table: &str) -> Option<usize> {
        self.entities
            .iter()
            .position(|e| e.table.eq_ignore_ascii_case(table))
    }

    /// Column names produced by reading `name` (a table or a view).
    #[must_use]
    pub fn columns_of(&self, name: &str) -> Option<Vec<String>> {
        self.columns_of_nested(name, 0)
    }

    fn columns_of_nested(&self, name: &str, depth: usize) -> Option<Vec<String>> {
        if let Some(index) = self.entity_for_table(name) {
            return Some(
                self.entities[index]
                    .fields
                    .iter()
                    .map(|f| f.column.clone())
                    .collect(),
            );
        }
        if depth > 8 {
            return None;
        }
        let view = self.bundle.view(name)?;
        let query = AnalyzedQuery::parse(&view.query).ok()?;
        self.expand_result_columns(&query, depth + 1)
    }

    /// Result column names of `query`, with `*` expanded from the schema.
    ///
    /// Returns `None` when a star refers to something outside the schema.
    #[must_use]
    pub fn result_columns(&self, query: &AnalyzedQuery) -> Option<Vec<String>> {
        self.expand_result_columns(query, 0)
    }

    fn expand_result_columns(&self, query: &AnalyzedQuery, depth: usize) -> Option<Vec<String>> {
        let refs = query.table_refs();
        let mut out = Vec::new();
        for column in query.result_columns() {
            match column {
                ResultColumn::Named(name) => out.push(name),
                ResultColumn::Star(None) => {
                    for table in &refs {
                        out.extend(self.columns_of_nested(&table.name, depth)?);
                    }
                }
                ResultColumn::Star(Some(qualifier)) => {
                    let table = refs.iter().find(|r| {
                        r.alias
                            .as_deref()
                            .is_some_and(|a| a.eq_ignore_ascii_case(&qualifier))
                            || r.name.eq_ignore_ascii_case(&qualifier)
                    })?;
                    out.extend(self.columns_of_nested(&table.name, depth)?);
                }
            }
        }
        Some(out)
    }
}

fn resolve_entity(decl: &EntityDecl, resolver: &TypeResolver) -> Result<EntityModel> {
    let location = format!("entity {}", decl.name);
    let mut errors = Vec::new();
    errors.extend(check_type_ident(&location, &decl.name));

    let mut fields = Vec::new();
    let mut unresolved = Vec::new();
    for field in &decl.fields {
        let field_location = format!("{}.{}", decl.name, field.name);
        errors.extend(check_snake_ident(&field_location, &field.name));
        if fields.iter().any(|f: &FieldModel| f.name == field.name) {
            errors.push(CompileError::DuplicateDeclaration {
                kind: "field",
                key: field_location.clone(),
            });
            continue;
        }
        let Some(ty) = resolver.value(&field.ty) else {
            unresolved.push(field.name.as_str());
            errors.push(CompileError::UnknownType {
                location: field_location,
                type_name: field.ty.clone(),
            });
            continue;
        };
        fields.push(FieldModel {
            name: field.name.clone(),
            column: field.column.clone().unwrap_or_else(|| field.name.clone()),
            ty,
            primary_key: decl.primary_key.contains(&field.name),
        });
    }

    let mut primary_key = Vec::new();
    for name in &decl.primary_key {
        match fields.iter().position(|f| &f.name == name) {
            Some(index) => primary_key.push(index),
            // Already reported as an unknown type.
            None if unresolved.contains(&name.as_str()) => {}
            None => errors.push(CompileError::invalid(
                &location,
                format!("primary key field '{name}' is not declared"),
            )),
        }
    }
    if primary_key.is_empty() && errors.is_empty() {
        errors.push(CompileError::invalid(&location, "no primary key declared"));
    }
    let key_resolved = primary_key.len() == decl.primary_key.len();
    if decl.auto_generate && key_resolved {
        let integer_key = primary_key.len() == 1
            && fields[primary_key[0]].ty
                == ValueType {
                    kind: ValueKind::Scalar(Scalar::I64),
                    nullable: false,
                };
        if !integer_key {
            errors.push(CompileError::invalid(
                &location,
                "auto_generate requires a single i64 primary key field",
            ));
        }
    }

    if let Some(error) = CompileError::collect(errors) {
        return Err(error);
    }
    Ok(EntityModel {
        name: decl.name.clone(),
        table: decl.table.clone().unwrap_or_else(|| snake_case(&decl.name)),
        fields,
        primary_key,
        auto_generate: decl.auto_generate,
    })
}

fn columns_for(
    location: &str,
    entity: &EntityModel,
    names: &[String],
    errors: &mut Vec<CompileError>,
) -> Vec<String> {
    names
        .iter()
        .filter_map(|name| match entity.fields.iter().find(|f| &f.name == name) {
            Some(field) => Some(field.column.clone()),
            None => {
                errors.push(CompileError::invalid(
                    location,
                    format!("unknown field '{name}' on {}", entity.name),
                ));
                None
            }
        })
        .collect()
}

fn schema_entity(decl: &EntityDecl, model: &EntityModel, all: &[EntityModel]) -> Result<Entity> {
    let location = format!("entity {}", decl.name);
    let mut errors = Vec::new();
    let mut entity = Entity::new(model.table.clone());

    for (field, field_decl) in model.fields.iter().zip(&decl.fields) {
        let mut schema_field = Field::new(field.name.clone(), field_decl.affinity.unwrap_or_else(|| field.ty.affinity()))
            .column(field.column.clone());
        if !field.ty.nullable {
            schema_field = schema_field.not_null();
        }
        if let Some(default) = &field_decl.default {
            schema_field = schema_field.default_value(default.clone());
        }
        entity = entity.field(schema_field);
    }
    entity.primary_key = PrimaryKey {
        columns: model
            .primary_key
            .iter()
            .map(|&i| model.fields[i].column.clone())
            .collect(),
        auto_generate: model.auto_generate,
    };

    for index in &decl.indices {
        let columns = columns_for(&location, model, &index.fields, &mut errors);
        let column_refs: Vec<&str> = columns.iter().map(String::as_str).collect();
        let mut schema_index = Index::on(&model.table, &column_refs);
        if let Some(name) = &index.name {
            schema_index.name.clone_from(name);
        }
        schema_index.unique = index.unique;
        entity = entity.index(schema_index);
    }

    for fk in &decl.foreign_keys {
        let Some(parent) = all.iter().find(|e| e.name == fk.entity) else {
            errors.push(CompileError::invalid(
                &location,
                format!("foreign key references unknown entity '{}'", fk.entity),
            ));
            continue;
        };
        entity = entity.foreign_key(ForeignKey {
            table: parent.table.clone(),
            columns: columns_for(&location, model, &fk.fields, &mut errors),
            referenced_columns: columns_for(&location, parent, &fk.parent_fields, &mut errors),
            on_delete: fk.on_delete,
            on_update: fk.on_update,
            deferred: fk.deferred,
        });
    }

    CompileError::collect(errors).map_or(Ok(entity), Err)
}

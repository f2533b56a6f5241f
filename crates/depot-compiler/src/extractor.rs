//! DAO metadata extraction.
//!
//! Turns method declarations into [`MethodDescriptor`]s: parameters resolved
//! to types, statements split at their bind parameters, result columns
//! mapped to entity fields by position, and the set of tables each method
//! reads or writes.

use std::collections::BTreeSet;

use tracing::warn;

use crate::declaration::{DaoDecl, Intent, MethodDecl, OnConflict};
use crate::error::{CompileError, Result, Warning};
use crate::model::{check_snake_ident, check_type_ident, EntityModel, SchemaModel};
use crate::query::{AnalyzedQuery, Segment, StatementKind};
use crate::types::{generic_argument, normalize, ValueType};

/// Number of placeholders SQLite accepts in one statement.
pub const MAX_BIND_ARGUMENTS: usize = 999;

/// A resolved method parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// What the parameter carries.
    pub kind: ParamKind,
}

/// What a parameter carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    /// A single value bound to one placeholder.
    Value(ValueType),
    /// A list of values expanded to one placeholder each.
    List(ValueType),
    /// An entity, by index into the schema model.
    Entity(usize),
    /// A list of entities.
    EntityList(usize),
}

/// A piece of a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    /// Literal SQL text.
    Sql(String),
    /// One placeholder bound to the parameter at this index.
    Value(usize),
    /// A placeholder list bound to the list parameter at this index.
    List(usize),
}

/// A statement split at its bind parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundStatement {
    /// Pieces in statement order.
    pub pieces: Vec<Piece>,
}

impl BoundStatement {
    /// Whether any piece expands at call time.
    #[must_use]
    pub fn has_lists(&self) -> bool {
        self.pieces.iter().any(|p| matches!(p, Piece::List(_)))
    }

    /// The statement with every value placeholder rendered as `?`.
    ///
    /// Only meaningful when [`has_lists`](Self::has_lists) is false.
    #[must_use]
    pub fn static_sql(&self) -> String {
        self.pieces
            .iter()
            .map(|p| match p {
                Piece::Sql(sql) => sql.as_str(),
                Piece::Value(_) | Piece::List(_) => "?",
            })
            .collect()
    }

    /// Parameter indices in binding order.
    #[must_use]
    pub fn bindings(&self) -> Vec<&Piece> {
        self.pieces
            .iter()
            .filter(|p| !matches!(p, Piece::Sql(_)))
            .collect()
    }
}

/// How many rows a read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Exactly one row; none is an `EmptyResult` error.
    One,
    /// Zero or one row.
    Optional,
    /// Any number of rows.
    Many,
}

/// Where an entity field is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSource {
    /// Result column at this position.
    Index(usize),
    /// Result column with this name, when positions are unknown.
    Name(String),
    /// Not present in the result; filled with `Default::default()`.
    Default,
}

/// Shape of one result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowShape {
    /// An entity, one source per field.
    Entity {
        /// Index into the schema model.
        entity: usize,
        /// Source of each field, in field order.
        fields: Vec<FieldSource>,
    },
    /// A single value from the first column.
    Value(ValueType),
}

/// Return shape of a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadShape {
    /// Row count.
    pub cardinality: Cardinality,
    /// Row shape.
    pub row: RowShape,
}

/// What a write returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteReturn {
    /// Nothing.
    Unit,
    /// Number of affected rows, as `u64`.
    Count,
    /// Row id of the inserted row, `-1` when the insert was ignored.
    RowId,
    /// Row ids of the inserted rows.
    RowIds,
}

/// What a method executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// A statement returning rows.
    Read {
        /// The statement.
        statement: BoundStatement,
        /// Return shape.
        shape: ReadShape,
        /// Base tables read, with views expanded.
        tables: Vec<String>,
        /// Whether the method returns a live stream.
        observe: bool,
    },
    /// An explicit mutating statement.
    Write {
        /// The statement.
        statement: BoundStatement,
        /// The written table first, then the tables its foreign key
        /// actions can change.
        tables: Vec<String>,
        /// Return value.
        returns: WriteReturn,
    },
    /// A synthesized insert, update or delete of entities.
    EntityWrite {
        /// Index into the schema model.
        entity: usize,
        /// The statement, executed once per entity.
        sql: String,
        /// Entity fields bound, in placeholder order.
        bind_fields: Vec<usize>,
        /// Whether the parameter is a list of entities.
        list: bool,
        /// The entity's table first, then the tables its foreign key
        /// actions can change.
        tables: Vec<String>,
        /// Return value.
        returns: WriteReturn,
    },
    /// Other methods of the DAO run in one write transaction.
    Transaction {
        /// Calls, in order.
        steps: Vec<Step>,
        /// Whether the value of the last step is returned.
        returns_last: bool,
    },
}

/// A call made by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Index of the called method in its DAO.
    pub method: usize,
    /// Index of the transaction parameter passed for each parameter of the
    /// called method.
    pub args: Vec<usize>,
}

/// One generated method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Method name.
    pub name: String,
    /// Declared intent.
    pub intent: Intent,
    /// Parameters, in declaration order.
    pub params: Vec<Param>,
    /// Declared return type, whitespace removed; `()` when absent.
    pub returns: String,
    /// What the method executes.
    pub operation: Operation,
}

impl MethodDescriptor {
    /// Whether the method changes the database.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        !matches!(self.operation, Operation::Read { .. })
    }
}

/// One generated DAO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaoDescriptor {
    /// DAO name.
    pub name: String,
    /// Methods, in declaration order, followed by the transactions.
    pub methods: Vec<MethodDescriptor>,
}

/// Result of extracting every DAO of a declaration.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// Descriptors.
    pub daos: Vec<DaoDescriptor>,
    /// Non-fatal findings.
    pub warnings: Vec<Warning>,
}

/// Extracts descriptors for every DAO.
///
/// All errors of all DAOs are collected before failing.
pub fn extract(model: &SchemaModel, daos: &[DaoDecl]) -> Result<Extraction> {
    let mut extraction = Extraction::default();
    let mut errors = Vec::new();
    let mut names = BTreeSet::new();

    for dao in daos {
        errors.extend(check_type_ident(&format!("dao {}", dao.name), &dao.name));
        if !names.insert(dao.name.clone()) {
            errors.push(CompileError::DuplicateDeclaration {
                kind: "dao",
                key: dao.name.clone(),
            });
            continue;
        }
        let mut methods = Vec::new();
        let mut transactions = Vec::new();
        let mut method_names = BTreeSet::new();
        for method in &dao.methods {
            let location = format!("{}::{}", dao.name, method.name);
            if !method_names.insert(method.name.clone()) {
                errors.push(CompileError::DuplicateDeclaration {
                    kind: "method",
                    key: location,
                });
                continue;
            }
            let mut extractor = MethodExtractor {
                model,
                location,
                warnings: Vec::new(),
            };
            if method.intent == Intent::Transaction {
                transactions.push((extractor, method));
                continue;
            }
            match extractor.extract(method) {
                Ok(descriptor) => methods.push(descriptor),
                Err(e) => errors.push(e),
            }
            for warning in extractor.warnings {
                warn!(location = %warning.location, "{}", warning.message);
                extraction.warnings.push(warning);
            }
        }
        // Steps name the methods extracted above.
        for (extractor, method) in transactions {
            match extractor.transaction(method, &methods) {
                Ok(descriptor) => methods.push(descriptor),
                Err(e) => errors.push(e),
            }
        }
        for method in &methods {
            let helper = match method.operation {
                Operation::Read { observe: true, .. } => format!("observe_{}", method.name),
                _ => format!("{}_in_transaction", method.name),
            };
            if method_names.contains(&helper) {
                errors.push(CompileError::invalid(
                    format!("{}::{helper}", dao.name),
                    format!("collides with the helper generated for '{}'", method.name),
                ));
            }
        }
        extraction.daos.push(DaoDescriptor {
            name: dao.name.clone(),
            methods,
        });
    }

    CompileError::collect(errors).map_or(Ok(extraction), Err)
}

struct MethodExtractor<'a> {
    model: &'a SchemaModel,
    location: String,
    warnings: Vec<Warning>,
}

impl MethodExtractor<'_> {
    fn invalid(&self, message: impl Into<String>) -> CompileError {
        CompileError::invalid(&self.location, message)
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(Warning {
            location: self.location.clone(),
            message: message.into(),
        });
    }

    fn params(&self, method: &MethodDecl, errors: &mut Vec<CompileError>) -> Vec<Param> {
        let mut params = Vec::new();
        for param in &method.params {
            errors.extend(check_snake_ident(&self.location, &param.name));
            if params.iter().any(|p: &Param| p.name == param.name) {
                errors.push(CompileError::DuplicateDeclaration {
                    kind: "parameter",
                    key: format!("{}({})", self.location, param.name),
                });
                continue;
            }
            match self.param_kind(&param.ty) {
                Some(kind) => params.push(Param {
                    name: param.name.clone(),
                    kind,
                }),
                None => errors.push(CompileError::UnknownType {
                    location: format!("{}({})", self.location, param.name),
                    type_name: param.ty.clone(),
                }),
            }
        }
        params
    }

    fn extract(&mut self, method: &MethodDecl) -> Result<MethodDescriptor> {
        let mut errors = Vec::new();
        errors.extend(check_snake_ident(&self.location, &method.name));
        if !method.steps.is_empty() {
            errors.push(self.invalid("only TRANSACTION methods take steps"));
        }
        let params = self.params(method, &mut errors);
        if let Some(error) = CompileError::collect(errors) {
            return Err(error);
        }

        let operation = match (&method.query, method.intent) {
            (Some(sql), intent) => self.explicit(method, intent, sql, &params)?,
            (None, Intent::Query | Intent::Observe) => {
                return Err(self.invalid("QUERY and OBSERVE methods require a statement"));
            }
            (None, intent) => self.synthesized(method, intent, &params)?,
        };
        Ok(MethodDescriptor {
            name: method.name.clone(),
            intent: method.intent,
            params,
            returns: declared_return(method),
            operation,
        })
    }

    fn transaction(&self, method: &MethodDecl, available: &[MethodDescriptor]) -> Result<MethodDescriptor> {
        let mut errors = Vec::new();
        errors.extend(check_snake_ident(&self.location, &method.name));
        if method.query.is_some() || method.on_conflict.is_some() {
            errors.push(self.invalid("a TRANSACTION runs its steps and takes no statement"));
        }
        if method.steps.is_empty() {
            errors.push(self.invalid("a TRANSACTION needs at least one step"));
        }
        let params = self.params(method, &mut errors);

        let mut used = vec![false; params.len()];
        let mut steps = Vec::new();
        for name in &method.steps {
            let Some(index) = available.iter().position(|m| m.name == *name) else {
                errors.push(self.invalid(format!("step '{name}' is not a method of this DAO")));
                continue;
            };
            let step = &available[index];
            match step.operation {
                Operation::Read { observe: true, .. } => {
                    errors.push(self.invalid(format!("step '{name}' is an OBSERVE method")));
                    continue;
                }
                Operation::Transaction { .. } => {
                    errors.push(self.invalid(format!("step '{name}' is itself a TRANSACTION")));
                    continue;
                }
                _ => {}
            }
            let mut args = Vec::new();
            for wanted in &step.params {
                match params.iter().position(|p| p.name == wanted.name) {
                    Some(i) if params[i].kind == wanted.kind => {
                        used[i] = true;
                        args.push(i);
                    }
                    Some(_) => errors.push(self.invalid(format!(
                        "parameter '{}' does not have the type step '{name}' expects",
                        wanted.name
                    ))),
                    None => errors.push(self.invalid(format!(
                        "step '{name}' needs a parameter named '{}'",
                        wanted.name
                    ))),
                }
            }
            steps.push(Step { method: index, args });
        }
        for (param, used) in params.iter().zip(&used) {
            if !used {
                errors.push(CompileError::UnusedParameter {
                    method: self.location.clone(),
                    parameter: param.name.clone(),
                });
            }
        }

        let returns = declared_return(method);
        let returns_last = returns != "()";
        if returns_last {
            if let Some(last) = steps.last() {
                let produced = &available[last.method].returns;
                if *produced != returns {
                    errors.push(self.invalid(format!(
                        "declares '{returns}' but its last step returns '{produced}'"
                    )));
                }
            }
        }
        if let Some(error) = CompileError::collect(errors) {
            return Err(error);
        }
        Ok(MethodDescriptor {
            name: method.name.clone(),
            intent: Intent::Transaction,
            params,
            returns,
            operation: Operation::Transaction {
                steps,
                returns_last,
            },
        })
    }

    fn param_kind(&self, ty: &str) -> Option<ParamKind> {
        let ty = normalize(ty);
        if let Some(entity) = self.model.entity_named(&ty) {
            return Some(ParamKind::Entity(entity));
        }
        if ty != "Vec<u8>" {
            if let Some(inner) = generic_argument(&ty, "Vec") {
                if let Some(entity) = self.model.entity_named(inner) {
                    return Some(ParamKind::EntityList(entity));
                }
                return self.model.resolver.value(inner).map(ParamKind::List);
            }
        }
        self.model.resolver.value(&ty).map(ParamKind::Value)
    }

    fn explicit(
        &mut self,
        method: &MethodDecl,
        intent: Intent,
        sql: &str,
        params: &[Param],
    ) -> Result<Operation> {
        let query = AnalyzedQuery::parse(sql).map_err(|m| self.invalid(m))?;
        if method.on_conflict.is_some() {
            return Err(self.invalid("on_conflict only applies to synthesized statements"));
        }
        let statement = self.bind(&query, params)?;
        let kind = query.kind();

        match intent {
            Intent::Observe if kind != StatementKind::Select => {
                Err(self.invalid("OBSERVE requires a SELECT statement"))
            }
            Intent::Insert | Intent::Update | Intent::Delete if !kind.is_write() => Err(self.invalid(
                "INSERT, UPDATE and DELETE statements must modify a table",
            )),
            _ if kind.is_write() => {
                let table = query
                    .written_table()
                    .ok_or_else(|| self.invalid("cannot determine the written table"))?;
                let Some(entity) = self.model.entity_for_table(&table) else {
                    return Err(self.invalid(format!("writes unknown table '{table}'")));
                };
                let returns = self.write_return(method, false, false)?;
                Ok(Operation::Write {
                    statement,
                    tables: self.model.bundle.affected_tables(&self.model.entities[entity].table),
                    returns,
                })
            }
            _ => {
                let returns = method
                    .returns
                    .as_deref()
                    .ok_or_else(|| self.invalid("a read must declare a return type"))?;
                let shape = self.read_shape(&query, returns)?;
                let tables = self.read_tables(&query);
                let observe = intent == Intent::Observe;
                if observe && tables.is_empty() {
                    return Err(self.invalid("OBSERVE statement reads no known table"));
                }
                Ok(Operation::Read {
                    statement,
                    shape,
                    tables,
                    observe,
                })
            }
        }
    }

    fn bind(&self, query: &AnalyzedQuery, params: &[Param]) -> Result<BoundStatement> {
        let named = query.named_parameters();
        let positional = query.positional_count();
        if !named.is_empty() && positional > 0 {
            return Err(CompileError::MixedBinding {
                method: self.location.clone(),
            });
        }
        if let Some(param) = params
            .iter()
            .find(|p| matches!(p.kind, ParamKind::Entity(_) | ParamKind::EntityList(_)))
        {
            return Err(self.invalid(format!(
                "entity parameter '{}' cannot be bound into an explicit statement",
                param.name
            )));
        }

        let mut errors = Vec::new();
        let mut used = vec![false; params.len()];
        let mut pieces = Vec::new();
        let mut unresolved = BTreeSet::new();
        for segment in query.segments() {
            let index = match segment {
                Segment::Sql(sql) => {
                    pieces.push(Piece::Sql(sql));
                    continue;
                }
                Segment::Named(name) => match params.iter().position(|p| p.name == name) {
                    Some(index) => index,
                    None => {
                        if unresolved.insert(name.clone()) {
                            errors.push(CompileError::UnresolvedBindParameter {
                                method: self.location.clone(),
                                parameter: name,
                            });
                        }
                        continue;
                    }
                },
                Segment::Positional(index) if index < params.len() => index,
                Segment::Positional(index) => {
                    errors.push(self.invalid(format!(
                        "positional parameter {} has no matching method parameter",
                        index + 1
                    )));
                    continue;
                }
            };
            used[index] = true;
            pieces.push(match params[index].kind {
                ParamKind::List(_) => Piece::List(index),
                _ => Piece::Value(index),
            });
        }
        for (param, used) in params.iter().zip(&used) {
            if !used {
                errors.push(CompileError::UnusedParameter {
                    method: self.location.clone(),
                    parameter: param.name.clone(),
                });
            }
        }
        let statement = BoundStatement { pieces };
        let fixed = statement
            .pieces
            .iter()
            .filter(|p| matches!(p, Piece::Value(_)))
            .count();
        if fixed > MAX_BIND_ARGUMENTS {
            errors.push(self.invalid(format!(
                "statement uses {fixed} placeholders, more than {MAX_BIND_ARGUMENTS}"
            )));
        }
        CompileError::collect(errors).map_or(Ok(statement), Err)
    }

    fn read_tables(&self, query: &AnalyzedQuery) -> Vec<String> {
        let mut tables = BTreeSet::new();
        for table in query.tables() {
            if let Some(resolved) = self.model.bundle.resolve_tables(&table) {
                tables.extend(resolved);
            }
        }
        tables.into_iter().collect()
    }

    fn read_shape(&mut self, query: &AnalyzedQuery, returns: &str) -> Result<ReadShape> {
        let returns = normalize(returns);
        let (cardinality, row_type) = if returns == "Vec<u8>" {
            (Cardinality::One, returns.as_str())
        } else if let Some(inner) = generic_argument(&returns, "Vec") {
            (Cardinality::Many, inner)
        } else if let Some(inner) = generic_argument(&returns, "Option") {
            (Cardinality::Optional, inner)
        } else {
            (Cardinality::One, returns.as_str())
        };

        let model = self.model;
        let columns = model.result_columns(query);
        let row = if let Some(entity) = model.entity_named(row_type) {
            let fields = self.map_entity(&model.entities[entity], columns);
            RowShape::Entity { entity, fields }
        } else if let Some(ty) = model.resolver.value(row_type) {
            if let Some(columns) = &columns {
                if columns.len() > 1 {
                    self.warn(format!(
                        "query returns {} columns; only the first is read into {row_type}",
                        columns.len()
                    ));
                }
            }
            RowShape::Value(ty)
        } else {
            return Err(CompileError::UnknownType {
                location: self.location.clone(),
                type_name: row_type.to_string(),
            });
        };
        Ok(ReadShape { cardinality, row })
    }

    fn map_entity(&mut self, entity: &EntityModel, columns: Option<Vec<String>>) -> Vec<FieldSource> {
        let Some(columns) = columns else {
            self.warn(format!(
                "cannot determine the result columns; {} fields are read by name",
                entity.name
            ));
            return entity
                .fields
                .iter()
                .map(|f| FieldSource::Name(f.column.clone()))
                .collect();
        };

        let sources: Vec<FieldSource> = entity
            .fields
            .iter()
            .map(|field| {
                columns
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(&field.column))
                    .map_or(FieldSource::Default, FieldSource::Index)
            })
            .collect();

        if sources.iter().all(|s| *s == FieldSource::Default) {
            self.warn(format!(
                "no result column matches a field of {}; all fields take their default value",
                entity.name
            ));
            return sources;
        }
        let missing: Vec<&str> = entity
            .fields
            .iter()
            .zip(&sources)
            .filter(|(_, s)| **s == FieldSource::Default)
            .map(|(f, _)| f.name.as_str())
            .collect();
        if !missing.is_empty() {
            self.warn(format!(
                "fields of {} missing from the result take their default value: {}",
                entity.name,
                missing.join(", ")
            ));
        }
        let unused: Vec<&str> = columns
            .iter()
            .filter(|c| entity.field_by_column(c).is_none())
            .map(String::as_str)
            .collect();
        if !unused.is_empty() {
            self.warn(format!(
                "result columns not mapped to {}: {}",
                entity.name,
                unused.join(", ")
            ));
        }
        sources
    }

    fn write_return(&self, method: &MethodDecl, single_insert: bool, list_insert: bool) -> Result<WriteReturn> {
        let returns = method.returns.as_deref().map(normalize);
        match returns.as_deref() {
            None | Some("()") => Ok(WriteReturn::Unit),
            Some("u64") if !single_insert && !list_insert => Ok(WriteReturn::Count),
            Some("i64") if single_insert => Ok(WriteReturn::RowId),
            Some("Vec<i64>") if list_insert => Ok(WriteReturn::RowIds),
            Some(other) => Err(self.invalid(format!(
                "unsupported return type '{other}' for a {:?} method",
                method.intent
            ))),
        }
    }

    fn synthesized(&self, method: &MethodDecl, intent: Intent, params: &[Param]) -> Result<Operation> {
        let (entity, list) = match params {
            [Param {
                kind: ParamKind::Entity(e),
                ..
            }] => (*e, false),
            [Param {
                kind: ParamKind::EntityList(e),
                ..
            }] => (*e, true),
            _ => {
                return Err(self.invalid(
                    "a synthesized statement needs exactly one entity or entity list parameter",
                ))
            }
        };
        let model = &self.model.entities[entity];
        let table = depot_schema::quote(&model.table);
        let key: Vec<usize> = model.primary_key.clone();
        let key_clause = key
            .iter()
            .map(|&i| format!("{} = ?", depot_schema::quote(&model.fields[i].column)))
            .collect::<Vec<_>>()
            .join(" AND ");

        let (sql, bind_fields) = match intent {
            Intent::Insert => {
                let conflict = method.on_conflict.unwrap_or_default();
                let columns = model
                    .fields
                    .iter()
                    .map(|f| depot_schema::quote(&f.column))
                    .collect::<Vec<_>>()
                    .join(", ");
                let placeholders = vec!["?"; model.fields.len()].join(", ");
                (
                    format!(
                        "INSERT OR {} INTO {table} ({columns}) VALUES ({placeholders})",
                        conflict.as_sql()
                    ),
                    (0..model.fields.len()).collect(),
                )
            }
            Intent::Update => {
                let conflict = method.on_conflict.unwrap_or_default();
                let values: Vec<usize> = (0..model.fields.len())
                    .filter(|i| !key.contains(i))
                    .collect();
                if values.is_empty() {
                    return Err(self.invalid(format!(
                        "{} has no columns outside its primary key to update",
                        model.name
                    )));
                }
                let assignments = values
                    .iter()
                    .map(|&i| format!("{} = ?", depot_schema::quote(&model.fields[i].column)))
                    .collect::<Vec<_>>()
                    .join(", ");
                let conflict = if conflict == OnConflict::Abort {
                    String::new()
                } else {
                    format!(" OR {}", conflict.as_sql())
                };
                (
                    format!("UPDATE{conflict} {table} SET {assignments} WHERE {key_clause}"),
                    values.into_iter().chain(key.iter().copied()).collect(),
                )
            }
            Intent::Delete => {
                if method.on_conflict.is_some() {
                    return Err(self.invalid("on_conflict does not apply to DELETE"));
                }
                (format!("DELETE FROM {table} WHERE {key_clause}"), key.clone())
            }
            Intent::Query | Intent::Observe => {
                return Err(self.invalid("QUERY and OBSERVE methods require a statement"));
            }
            Intent::Transaction => {
                return Err(self.invalid("a TRANSACTION runs its steps and takes no statement"));
            }
        };

        let returns = self.write_return(method, intent == Intent::Insert && !list, intent == Intent::Insert && list)?;
        Ok(Operation::EntityWrite {
            entity,
            sql,
            bind_fields,
            list,
            tables: self.model.bundle.affected_tables(&model.table),
            returns,
        })
    }
}

fn declared_return(method: &MethodDecl) -> String {
    method
        .returns
        .as_deref()
        .map_or_else(|| "()".to_string(), normalize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::Declaration;

    fn extract_json(daos: &str) -> Result<Extraction> {
        let json = format!(
            r#"{{
                "database": {{ "name": "WordDatabase", "version": 1 }},
                "entities": [{{
                    "name": "Word",
                    "table": "word_table",
                    "fields": [
                        {{ "name": "word", "type": "String" }},
                        {{ "name": "date", "type": "chrono::DateTime<chrono::Utc>" }}
                    ],
                    "primary_key": ["word"]
                }}, {{
                    "name": "Note",
                    "fields": [
                        {{ "name": "id", "type": "i64" }},
                        {{ "name": "body", "type": "Option<String>" }}
                    ],
                    "primary_key": ["id"],
                    "auto_generate": true
                }}, {{
                    "name": "Definition",
                    "fields": [
                        {{ "name": "id", "type": "i64" }},
                        {{ "name": "word", "type": "String" }}
                    ],
                    "primary_key": ["id"],
                    "foreign_keys": [{{
                        "entity": "Word", "fields": ["word"], "parent_fields": ["word"],
                        "on_delete": "CASCADE"
                    }}]
                }}],
                "views": [{{ "name": "all_words", "query": "SELECT word FROM word_table" }}],
                "daos": {daos}
            }}"#
        );
        let decl = Declaration::from_json(&json).unwrap();
        let model = SchemaModel::build(&decl).unwrap();
        extract(&model, &decl.daos)
    }

    fn single(daos: &str) -> MethodDescriptor {
        extract_json(daos).unwrap().daos.remove(0).methods.remove(0)
    }

    #[test]
    fn test_named_binding() {
        let method = single(
            r#"[{ "name": "WordDao", "methods": [{
                "name": "by_word", "intent": "QUERY",
                "query": "SELECT * FROM word_table WHERE word = :word OR word = :word",
                "params": [{ "name": "word", "type": "String" }],
                "returns": "Option<Word>"
            }]}]"#,
        );
        let Operation::Read {
            statement, shape, tables, observe,
        } = method.operation
        else {
            panic!("expected a read");
        };
        assert_eq!(
            statement.static_sql(),
            "SELECT * FROM word_table WHERE word = ? OR word = ?"
        );
        assert_eq!(statement.bindings(), vec![&Piece::Value(0), &Piece::Value(0)]);
        assert_eq!(shape.cardinality, Cardinality::Optional);
        assert_eq!(
            shape.row,
            RowShape::Entity {
                entity: 0,
                fields: vec![FieldSource::Index(0), FieldSource::Index(1)]
            }
        );
        assert_eq!(tables, vec!["word_table"]);
        assert!(!observe);
    }

    #[test]
    fn test_unresolved_bind_parameter() {
        let err = extract_json(
            r#"[{ "name": "WordDao", "methods": [{
                "name": "by_word", "intent": "QUERY",
                "query": "SELECT * FROM word_table WHERE word = :name",
                "params": [{ "name": "word", "type": "String" }],
                "returns": "Vec<Word>"
            }]}]"#,
        )
        .unwrap_err();
        let errors = err.into_list();
        assert!(errors.iter().any(|e| matches!(
            e,
            CompileError::UnresolvedBindParameter { method, parameter }
                if method == "WordDao::by_word" && parameter == "name"
        )));
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileError::UnusedParameter { parameter, .. } if parameter == "word")));
    }

    #[test]
    fn test_mixed_binding() {
        let err = extract_json(
            r#"[{ "name": "WordDao", "methods": [{
                "name": "by_word", "intent": "QUERY",
                "query": "SELECT * FROM word_table WHERE word = :word AND date = ?",
                "params": [{ "name": "word", "type": "String" }],
                "returns": "Vec<Word>"
            }]}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::MixedBinding { .. }));
    }

    #[test]
    fn test_list_parameter() {
        let method = single(
            r#"[{ "name": "WordDao", "methods": [{
                "name": "find", "intent": "QUERY",
                "query": "SELECT word FROM word_table WHERE word IN (:words)",
                "params": [{ "name": "words", "type": "Vec<String>" }],
                "returns": "Vec<String>"
            }]}]"#,
        );
        let Operation::Read { statement, .. } = method.operation else {
            panic!("expected a read");
        };
        assert!(statement.has_lists());
        assert!(matches!(method.params[0].kind, ParamKind::List(_)));
    }

    #[test]
    fn test_observe_view_resolves_tables() {
        let method = single(
            r#"[{ "name": "WordDao", "methods": [{
                "name": "words", "intent": "OBSERVE",
                "query": "SELECT * FROM all_words",
                "returns": "Vec<String>"
            }]}]"#,
        );
        let Operation::Read { tables, observe, .. } = method.operation else {
            panic!("expected a read");
        };
        assert!(observe);
        assert_eq!(tables, vec!["word_table"]);
    }

    #[test]
    fn test_observe_requires_select() {
        let err = extract_json(
            r#"[{ "name": "WordDao", "methods": [{
                "name": "wipe", "intent": "OBSERVE",
                "query": "DELETE FROM word_table", "returns": "u64"
            }]}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::InvalidDeclaration { .. }));
    }

    #[test]
    fn test_query_delete_is_write() {
        let method = single(
            r#"[{ "name": "WordDao", "methods": [{
                "name": "delete_all", "intent": "QUERY",
                "query": "DELETE FROM word_table", "returns": "u64"
            }]}]"#,
        );
        assert!(method.is_write());
        assert!(matches!(
            method.operation,
            Operation::Write { ref tables, returns: WriteReturn::Count, .. } if *tables == ["word_table"]
        ));
    }

    #[test]
    fn test_cte_prefixed_write_targets_its_statement() {
        let method = single(
            r#"[{ "name": "NoteDao", "methods": [{
                "name": "prune", "intent": "QUERY",
                "query": "WITH kept AS (SELECT word FROM word_table) DELETE FROM note WHERE body NOT IN kept"
            }]}]"#,
        );
        assert!(matches!(
            method.operation,
            Operation::Write { ref tables, .. } if *tables == ["note"]
        ));
    }

    #[test]
    fn test_cascading_write_touches_children() {
        let extraction = extract_json(
            r#"[{ "name": "WordDao", "methods": [
                { "name": "delete", "intent": "DELETE",
                  "params": [{ "name": "word", "type": "Word" }] },
                { "name": "delete_all", "intent": "QUERY", "query": "DELETE FROM word_table" },
                { "name": "delete_definitions", "intent": "QUERY", "query": "DELETE FROM definition" }
            ]}]"#,
        )
        .unwrap();
        let methods = &extraction.daos[0].methods;
        assert!(matches!(
            methods[0].operation,
            Operation::EntityWrite { ref tables, .. } if *tables == ["word_table", "definition"]
        ));
        assert!(matches!(
            methods[1].operation,
            Operation::Write { ref tables, .. } if *tables == ["word_table", "definition"]
        ));
        assert!(matches!(
            methods[2].operation,
            Operation::Write { ref tables, .. } if *tables == ["definition"]
        ));
    }

    #[test]
    fn test_transaction_steps() {
        let extraction = extract_json(
            r#"[{ "name": "WordDao", "methods": [
                { "name": "replace_words", "intent": "TRANSACTION", "returns": "Vec<i64>",
                  "steps": ["delete_all", "insert_all"],
                  "params": [{ "name": "words", "type": "Vec<Word>" }] },
                { "name": "delete_all", "intent": "QUERY", "query": "DELETE FROM word_table" },
                { "name": "insert_all", "intent": "INSERT", "returns": "Vec<i64>",
                  "params": [{ "name": "words", "type": "Vec<Word>" }] }
            ]}]"#,
        )
        .unwrap();
        let methods = &extraction.daos[0].methods;
        assert_eq!(methods.len(), 3);
        let transaction = &methods[2];
        assert_eq!(transaction.name, "replace_words");
        assert!(transaction.is_write());
        assert_eq!(
            transaction.operation,
            Operation::Transaction {
                steps: vec![
                    Step { method: 0, args: Vec::new() },
                    Step { method: 1, args: vec![0] },
                ],
                returns_last: true,
            }
        );
    }

    #[test]
    fn test_transaction_step_errors() {
        let err = extract_json(
            r#"[{ "name": "WordDao", "methods": [
                { "name": "watch", "intent": "OBSERVE",
                  "query": "SELECT * FROM word_table", "returns": "Vec<Word>" },
                { "name": "by_word", "intent": "QUERY", "returns": "Option<Word>",
                  "query": "SELECT * FROM word_table WHERE word = :word",
                  "params": [{ "name": "word", "type": "String" }] },
                { "name": "broken", "intent": "TRANSACTION", "returns": "u64",
                  "steps": ["watch", "missing", "by_word"] }
            ]}]"#,
        )
        .unwrap_err();
        let CompileError::Multiple(errors) = err else {
            panic!("expected several errors, got {err:?}");
        };
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        assert_eq!(messages.len(), 4, "{messages:?}");
        assert!(messages[0].contains("OBSERVE"));
        assert!(messages[1].contains("'missing'"));
        assert!(messages[2].contains("'word'"));
        assert!(messages[3].contains("last step returns 'Option<Word>'"));
    }

    #[test]
    fn test_transaction_helper_name_collision() {
        let err = extract_json(
            r#"[{ "name": "WordDao", "methods": [
                { "name": "delete_all", "intent": "QUERY", "query": "DELETE FROM word_table" },
                { "name": "delete_all_in_transaction", "intent": "QUERY", "query": "DELETE FROM note" }
            ]}]"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("delete_all_in_transaction"));
    }

    #[test]
    fn test_synthesized_insert() {
        let method = single(
            r#"[{ "name": "WordDao", "methods": [{
                "name": "insert", "intent": "INSERT", "on_conflict": "IGNORE",
                "params": [{ "name": "word", "type": "Word" }]
            }]}]"#,
        );
        let Operation::EntityWrite { sql, bind_fields, list, returns, .. } = method.operation else {
            panic!("expected an entity write");
        };
        assert_eq!(
            sql,
            "INSERT OR IGNORE INTO `word_table` (`word`, `date`) VALUES (?, ?)"
        );
        assert_eq!(bind_fields, vec![0, 1]);
        assert!(!list);
        assert_eq!(returns, WriteReturn::Unit);
    }

    #[test]
    fn test_conflict_strategy_keywords() {
        let extraction = extract_json(
            r#"[{ "name": "WordDao", "methods": [
                { "name": "insert_abort", "intent": "INSERT",
                  "params": [{ "name": "word", "type": "Word" }] },
                { "name": "insert_rollback", "intent": "INSERT", "on_conflict": "ROLLBACK",
                  "params": [{ "name": "word", "type": "Word" }] },
                { "name": "update_rollback", "intent": "UPDATE", "on_conflict": "ROLLBACK",
                  "params": [{ "name": "word", "type": "Word" }] },
                { "name": "update_abort", "intent": "UPDATE",
                  "params": [{ "name": "word", "type": "Word" }] }
            ]}]"#,
        )
        .unwrap();
        let statements: Vec<&str> = extraction.daos[0]
            .methods
            .iter()
            .map(|m| match &m.operation {
                Operation::EntityWrite { sql, .. } => sql.as_str(),
                other => panic!("expected an entity write, got {other:?}"),
            })
            .collect();
        assert_eq!(
            statements,
            vec![
                "INSERT OR ABORT INTO `word_table` (`word`, `date`) VALUES (?, ?)",
                "INSERT OR ROLLBACK INTO `word_table` (`word`, `date`) VALUES (?, ?)",
                "UPDATE OR ROLLBACK `word_table` SET `date` = ? WHERE `word` = ?",
                "UPDATE `word_table` SET `date` = ? WHERE `word` = ?",
            ]
        );
    }

    #[test]
    fn test_synthesized_update_and_delete() {
        let extraction = extract_json(
            r#"[{ "name": "NoteDao", "methods": [
                { "name": "update", "intent": "UPDATE", "returns": "u64",
                  "params": [{ "name": "notes", "type": "Vec<Note>" }] },
                { "name": "delete", "intent": "DELETE",
                  "params": [{ "name": "note", "type": "Note" }] },
                { "name": "insert", "intent": "INSERT", "returns": "i64",
                  "params": [{ "name": "note", "type": "Note" }] }
            ]}]"#,
        )
        .unwrap();
        let methods = &extraction.daos[0].methods;
        let Operation::EntityWrite { sql, bind_fields, list, .. } = &methods[0].operation else {
            panic!("expected an entity write");
        };
        assert_eq!(sql, "UPDATE `note` SET `body` = ? WHERE `id` = ?");
        assert_eq!(bind_fields, &vec![1, 0]);
        assert!(list);
        let Operation::EntityWrite { sql, .. } = &methods[1].operation else {
            panic!("expected an entity write");
        };
        assert_eq!(sql, "DELETE FROM `note` WHERE `id` = ?");
        assert!(matches!(
            methods[2].operation,
            Operation::EntityWrite { returns: WriteReturn::RowId, .. }
        ));
    }

    #[test]
    fn test_field_mismatch_warns() {
        let extraction = extract_json(
            r#"[{ "name": "WordDao", "methods": [{
                "name": "partial", "intent": "QUERY",
                "query": "SELECT word, length(word) AS size FROM word_table",
                "returns": "Vec<Word>"
            }]}]"#,
        )
        .unwrap();
        let messages: Vec<&str> = extraction
            .warnings
            .iter()
            .map(|w| w.message.as_str())
            .collect();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("date"));
        assert!(messages[1].contains("size"));
    }

    #[test]
    fn test_duplicate_method() {
        let err = extract_json(
            r#"[{ "name": "WordDao", "methods": [
                { "name": "all", "intent": "QUERY", "query": "SELECT * FROM word_table", "returns": "Vec<Word>" },
                { "name": "all", "intent": "QUERY", "query": "SELECT * FROM word_table", "returns": "Vec<Word>" }
            ]}]"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::DuplicateDeclaration { kind: "method", ref key } if key == "WordDao::all"
        ));
    }

    #[test]
    fn test_entity_parameter_in_explicit_query() {
        let err = extract_json(
            r#"[{ "name": "WordDao", "methods": [{
                "name": "bad", "intent": "QUERY",
                "query": "DELETE FROM word_table WHERE word = :word",
                "params": [{ "name": "word", "type": "Word" }]
            }]}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::InvalidDeclaration { .. }));
    }
}

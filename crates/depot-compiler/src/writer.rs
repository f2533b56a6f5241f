//! Rust source generation.
//!
//! For every DAO two types are written: `<Dao>Impl`, which executes
//! statements and marshals rows by column position, and `<Dao>Model`, the
//! facade that routes reads to the query executor, writes to the transaction
//! executor and turns `OBSERVE` methods into live queries and callbacks.

use depot_schema::AutoMigration;

use crate::error::Result;
use crate::extractor::{
    BoundStatement, Cardinality, DaoDescriptor, Extraction, FieldSource, MethodDescriptor,
    Operation, Param, ParamKind, Piece, ReadShape, RowShape, Step, WriteReturn,
};
use crate::model::{snake_case, EntityModel, SchemaModel};
use crate::types::{Converter, ValueKind, ValueType};

const ROW_TYPE: &str = "depot_runtime::sqlx::sqlite::SqliteRow";

/// Generates the source of a database, its entities and DAOs.
pub fn generate(
    model: &SchemaModel,
    extraction: &Extraction,
    migrations: &[AutoMigration],
) -> Result<String> {
    let mut out = String::new();
    out.push_str(&format!(
        "// Generated by depot-compiler from the `{}` declaration. Do not edit.\n\n",
        model.name
    ));
    out.push_str("#[allow(unused_imports)]\nuse depot_runtime::sqlx::Row as _;\n");
    out.push_str("#[allow(unused_imports)]\nuse depot_runtime::TypeConverter as _;\n\n");

    out.push_str(&render_schema(model, migrations)?);
    for entity in &model.entities {
        out.push_str(&render_entity(entity));
    }
    for dao in &extraction.daos {
        out.push_str(&render_dao_impl(model, dao));
        out.push_str(&render_dao_model(model, dao));
    }
    out.push_str(&render_database(model, &extraction.daos));
    Ok(out)
}

fn literal(text: &str) -> String {
    format!("{text:?}")
}

fn raw_literal(text: &str) -> String {
    let mut longest = 0;
    let mut run = 0;
    for c in text.chars() {
        if c == '#' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    let hashes = "#".repeat(longest + 1);
    format!("r{hashes}\"{text}\"{hashes}")
}

fn render_schema(model: &SchemaModel, migrations: &[AutoMigration]) -> Result<String> {
    let bundle = &model.bundle;
    let mut out = format!(
        "/// Schema version of this database.\n\
         pub const VERSION: u32 = {};\n\
         \n\
         /// Identity hash of the schema of [`VERSION`].\n\
         pub const IDENTITY_HASH: &str = {};\n\
         \n\
         const BUNDLE_JSON: &str = {};\n\
         \n\
         /// The schema bundle of [`VERSION`].\n\
         pub fn schema() -> depot_runtime::Result<depot_runtime::DatabaseBundle> {{\n\
         \x20   Ok(depot_runtime::DatabaseBundle::from_json(BUNDLE_JSON)?)\n\
         }}\n\n",
        bundle.version,
        literal(&bundle.identity_hash),
        raw_literal(&bundle.to_json()?),
    );

    out.push_str(
        "/// Migrations synthesized from exported schema bundles.\n\
         pub fn auto_migrations() -> Vec<depot_runtime::Migration> {\n\
         \x20   vec![\n",
    );
    for migration in migrations {
        out.push_str(&format!(
            "        depot_runtime::Migration::auto(\n\
             \x20           {},\n\
             \x20           {},\n\
             \x20           vec![\n",
            migration.from, migration.to
        ));
        for statement in &migration.statements {
            out.push_str(&format!(
                "                {}.to_string(),\n",
                literal(statement)
            ));
        }
        out.push_str(&format!(
            "            ],\n\
             \x20           {},\n\
             \x20       ),\n",
            migration.recreates_tables
        ));
    }
    out.push_str("    ]\n}\n\n");
    Ok(out)
}

fn render_entity(entity: &EntityModel) -> String {
    let mut out = format!(
        "/// Row of `{}`.\n\
         #[derive(Debug, Clone, PartialEq)]\n\
         pub struct {} {{\n",
        entity.table, entity.name
    );
    for field in &entity.fields {
        if field.column != field.name {
            out.push_str(&format!("    /// Column `{}`.\n", field.column));
        }
        out.push_str(&format!("    pub {}: {},\n", field.name, field.ty.rust()));
    }
    out.push_str("}\n\n");
    out
}

/// Type of a parameter as taken by the executing methods.
fn borrowed_type(model: &SchemaModel, kind: &ParamKind) -> String {
    match kind {
        ParamKind::Value(ty) => {
            let inner = match &ty.kind {
                ValueKind::Scalar(s) => s.borrowed().to_string(),
                ValueKind::Converted(c) => format!("&{}", c.rust_type),
            };
            if ty.nullable {
                format!("Option<{inner}>")
            } else {
                inner
            }
        }
        ParamKind::List(ty) => format!("&[{}]", ty.rust()),
        ParamKind::Entity(e) => format!("&{}", model.entities[*e].name),
        ParamKind::EntityList(e) => format!("&[{}]", model.entities[*e].name),
    }
}

/// Type of a parameter as taken by the facade and live queries.
fn owned_type(model: &SchemaModel, kind: &ParamKind) -> String {
    match kind {
        ParamKind::Value(ty) => ty.rust(),
        ParamKind::List(ty) => format!("Vec<{}>", ty.rust()),
        ParamKind::Entity(e) => model.entities[*e].name.clone(),
        ParamKind::EntityList(e) => format!("Vec<{}>", model.entities[*e].name),
    }
}

/// Expression borrowing an owned parameter as its executing-method type.
fn borrow_owned(param: &Param) -> String {
    let name = &param.name;
    match &param.kind {
        ParamKind::Value(ValueType {
            kind: ValueKind::Scalar(s),
            nullable,
        }) => {
            if s.is_copy() {
                name.clone()
            } else if *nullable {
                format!("{name}.as_deref()")
            } else {
                format!("&{name}")
            }
        }
        ParamKind::Value(ValueType { nullable: true, .. }) => format!("{name}.as_ref()"),
        _ => format!("&{name}"),
    }
}

fn signature(params: &[Param], render: impl Fn(&ParamKind) -> String) -> String {
    params
        .iter()
        .map(|p| format!(", {}: {}", p.name, render(&p.kind)))
        .collect()
}

fn arguments(params: &[Param], render: impl Fn(&Param) -> String) -> String {
    params.iter().map(render).collect::<Vec<_>>().join(", ")
}

fn row_type(model: &SchemaModel, shape: &ReadShape) -> String {
    let row = match &shape.row {
        RowShape::Entity { entity, .. } => model.entities[*entity].name.clone(),
        RowShape::Value(ty) => ty.rust(),
    };
    match shape.cardinality {
        Cardinality::One => row,
        Cardinality::Optional => format!("Option<{row}>"),
        Cardinality::Many => format!("Vec<{row}>"),
    }
}

const fn write_type(returns: WriteReturn) -> &'static str {
    match returns {
        WriteReturn::Unit => "()",
        WriteReturn::Count => "u64",
        WriteReturn::RowId => "i64",
        WriteReturn::RowIds => "Vec<i64>",
    }
}

fn return_type(model: &SchemaModel, dao: &DaoDescriptor, method: &MethodDescriptor) -> String {
    match &method.operation {
        Operation::Read { shape, .. } => row_type(model, shape),
        Operation::Write { returns, .. } | Operation::EntityWrite { returns, .. } => {
            write_type(*returns).to_string()
        }
        Operation::Transaction {
            steps,
            returns_last: true,
        } => match steps.last() {
            Some(last) => return_type(model, dao, &dao.methods[last.method]),
            None => "()".to_string(),
        },
        Operation::Transaction { .. } => "()".to_string(),
    }
}

/// Emits the body of one executing method, tracking the converters it uses.
struct BodyWriter<'a> {
    model: &'a SchemaModel,
    converters: Vec<String>,
}

impl<'a> BodyWriter<'a> {
    const fn new(model: &'a SchemaModel) -> Self {
        Self {
            model,
            converters: Vec::new(),
        }
    }

    fn converter(&mut self, converter: &Converter) -> String {
        let index = match self.converters.iter().position(|c| *c == converter.converter) {
            Some(index) => index,
            None => {
                self.converters.push(converter.converter.clone());
                self.converters.len() - 1
            }
        };
        format!("converter_{index}")
    }

    fn prelude(&self) -> String {
        self.converters
            .iter()
            .enumerate()
            .map(|(i, path)| {
                format!("        let converter_{i} = self.db.converters().get::<{path}>()?;\n")
            })
            .collect()
    }

    fn decode(&mut self, ty: &ValueType, index: &str) -> String {
        match ty.converter() {
            None => format!("row.try_get::<{}, _>({index})?", ty.rust()),
            Some(c) => {
                let converter = self.converter(c);
                let column = c.column.rust();
                if ty.nullable {
                    format!(
                        "row.try_get::<Option<{column}>, _>({index})?\
                         .map(|v| {converter}.from_column(v))\
                         .transpose()?"
                    )
                } else {
                    format!("{converter}.from_column(row.try_get::<{column}, _>({index})?)?")
                }
            }
        }
    }

    /// Binds a parameter passed in its executing-method form.
    fn bind_param(&mut self, ty: &ValueType, name: &str) -> String {
        match ty.converter() {
            None => name.to_string(),
            Some(c) => {
                let converter = self.converter(c);
                if ty.nullable {
                    format!("{name}.map(|v| {converter}.to_column(v))")
                } else {
                    format!("{converter}.to_column({name})")
                }
            }
        }
    }

    /// Binds a value reached through a reference (`item`) or a place
    /// (`value.field`, when `place` is true).
    fn bind_ref(&mut self, ty: &ValueType, expr: &str, place: bool) -> String {
        let reference = if place {
            format!("&{expr}")
        } else {
            expr.to_string()
        };
        match ty.converter() {
            None => reference,
            Some(c) => {
                let converter = self.converter(c);
                if ty.nullable {
                    format!("{expr}.as_ref().map(|v| {converter}.to_column(v))")
                } else {
                    format!("{converter}.to_column({reference})")
                }
            }
        }
    }

    fn statement(&mut self, statement: &BoundStatement, params: &[Param]) -> String {
        let mut out = String::new();
        if !statement.has_lists() {
            out.push_str(&format!(
                "        let sql = {};\n        let query = depot_runtime::sqlx::query(sql)",
                literal(&statement.static_sql())
            ));
            for piece in statement.bindings() {
                if let Piece::Value(index) = piece {
                    let param = &params[*index];
                    if let ParamKind::Value(ty) = &param.kind {
                        let bind = self.bind_param(ty, &param.name);
                        out.push_str(&format!("\n            .bind({bind})"));
                    }
                }
            }
            out.push_str(";\n");
            return out;
        }

        out.push_str("        let mut builder = depot_runtime::StatementBuilder::new();\n");
        for piece in &statement.pieces {
            match piece {
                Piece::Sql(sql) => {
                    out.push_str(&format!("        builder.push_sql({});\n", literal(sql)));
                }
                Piece::Value(_) => out.push_str("        builder.push_placeholder();\n"),
                Piece::List(index) => out.push_str(&format!(
                    "        builder.push_list({}.len());\n",
                    params[*index].name
                )),
            }
        }
        out.push_str(
            "        let sql = builder.finish()?;\n        \
             let mut query = depot_runtime::sqlx::query(&sql);\n",
        );
        for piece in statement.bindings() {
            match piece {
                Piece::Value(index) => {
                    let param = &params[*index];
                    if let ParamKind::Value(ty) = &param.kind {
                        let bind = self.bind_param(ty, &param.name);
                        out.push_str(&format!("        query = query.bind({bind});\n"));
                    }
                }
                Piece::List(index) => {
                    let param = &params[*index];
                    if let ParamKind::List(ty) = &param.kind {
                        let bind = self.bind_ref(ty, "item", false);
                        out.push_str(&format!(
                            "        for item in {} {{\n            query = query.bind({bind});\n        }}\n",
                            param.name
                        ));
                    }
                }
                Piece::Sql(_) => {}
            }
        }
        out
    }

    fn map_row(&mut self, shape: &ReadShape) -> String {
        let model = self.model;
        let (row, construct) = match &shape.row {
            RowShape::Value(ty) => (ty.rust(), self.decode(ty, "0usize")),
            RowShape::Entity { entity, fields } => {
                let entity = &model.entities[*entity];
                let mut construct = format!("{} {{\n", entity.name);
                for (field, source) in entity.fields.iter().zip(fields) {
                    let value = match source {
                        FieldSource::Index(i) => self.decode(&field.ty, &format!("{i}usize")),
                        FieldSource::Name(column) => self.decode(&field.ty, &literal(column)),
                        FieldSource::Default => "Default::default()".to_string(),
                    };
                    construct.push_str(&format!("                {}: {value},\n", field.name));
                }
                construct.push_str("            }");
                (entity.name.clone(), construct)
            }
        };
        format!(
            "        let map_row = |row: &{ROW_TYPE}| -> depot_runtime::Result<{row}> {{\n\
             \x20           Ok({construct})\n\
             \x20       }};\n"
        )
    }

    fn read(
        &mut self,
        statement: &BoundStatement,
        shape: &ReadShape,
        params: &[Param],
        in_transaction: bool,
    ) -> String {
        let mut body = self.map_row(shape);
        body.push_str(&self.statement(statement, params));
        body.push_str(if in_transaction {
            "        let conn = tx.connection();\n"
        } else {
            "        let mut conn = self.db.acquire().await?;\n"
        });
        body.push_str(match shape.cardinality {
            Cardinality::Many => {
                "        let rows = query.fetch_all(&mut *conn).await?;\n        \
                 rows.iter().map(map_row).collect()\n"
            }
            Cardinality::Optional => {
                "        let row = query.fetch_optional(&mut *conn).await?;\n        \
                 row.as_ref().map(map_row).transpose()\n"
            }
            Cardinality::One => {
                "        let row = query\n            \
                 .fetch_optional(&mut *conn)\n            \
                 .await?\n            \
                 .ok_or_else(|| depot_runtime::Error::EmptyResult {\n                \
                 query: sql.to_string(),\n            \
                 })?;\n        \
                 map_row(&row)\n"
            }
        });
        body
    }

    /// Marks the written tables, only when a row actually changed.
    fn touch_tables(tables: &[String], affected: &str) -> String {
        let mut out = format!("        if {affected} > 0 {{\n");
        for table in tables {
            out.push_str(&format!("            tx.touch({});\n", literal(table)));
        }
        out.push_str("        }\n");
        out
    }

    fn write(&mut self, statement: &BoundStatement, tables: &[String], returns: WriteReturn, params: &[Param]) -> String {
        let mut body = self.statement(statement, params);
        body.push_str("        let result = query.execute(tx.connection()).await?;\n");
        body.push_str(&Self::touch_tables(tables, "result.rows_affected()"));
        body.push_str(match returns {
            WriteReturn::Count => "        Ok(result.rows_affected())\n",
            _ => "        Ok(())\n",
        });
        body
    }

    fn entity_binds(&mut self, entity: &EntityModel, bind_fields: &[usize], value: &str) -> String {
        let mut out = String::new();
        for &index in bind_fields {
            let field = &entity.fields[index];
            let place = format!("{value}.{}", field.name);
            let bind = if entity.auto_generate && field.primary_key {
                format!("({place} != 0).then_some({place})")
            } else {
                self.bind_ref(&field.ty, &place, true)
            };
            out.push_str(&format!("\n            .bind({bind})"));
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn entity_write(
        &mut self,
        entity: usize,
        sql: &str,
        bind_fields: &[usize],
        list: bool,
        tables: &[String],
        returns: WriteReturn,
        param: &Param,
    ) -> String {
        let model = self.model;
        let entity = &model.entities[entity];
        let mut body = format!("        let sql = {};\n", literal(sql));
        if list {
            body.push_str("        let mut affected = 0u64;\n");
            if returns == WriteReturn::RowIds {
                body.push_str(&format!(
                    "        let mut ids = Vec::with_capacity({}.len());\n",
                    param.name
                ));
            }
            body.push_str(&format!("        for value in {} {{\n", param.name));
            let binds = self.entity_binds(entity, bind_fields, "value");
            body.push_str(&format!(
                "            let result = depot_runtime::sqlx::query(sql){binds}\n\
                 \x20               .execute(tx.connection())\n\
                 \x20               .await?;\n\
                 \x20           affected += result.rows_affected();\n"
            ));
            if returns == WriteReturn::RowIds {
                body.push_str(
                    "            ids.push(if result.rows_affected() == 0 {\n                \
                     -1\n            \
                     } else {\n                \
                     result.last_insert_rowid()\n            \
                     });\n",
                );
            }
            body.push_str("        }\n");
        } else {
            let binds = self.entity_binds(entity, bind_fields, &param.name);
            body.push_str(&format!(
                "        let result = depot_runtime::sqlx::query(sql){binds}\n\
                 \x20           .execute(tx.connection())\n\
                 \x20           .await?;\n\
                 \x20       let affected = result.rows_affected();\n"
            ));
        }
        body.push_str(&Self::touch_tables(tables, "affected"));
        body.push_str(match returns {
            WriteReturn::Unit => "        Ok(())\n",
            WriteReturn::Count => "        Ok(affected)\n",
            WriteReturn::RowId => {
                "        Ok(if affected == 0 { -1 } else { result.last_insert_rowid() })\n"
            }
            WriteReturn::RowIds => "        Ok(ids)\n",
        });
        body
    }
}

/// Body of an executing method. Writes and transactions always run on the
/// caller's `tx`; reads use it only when `in_transaction` is set.
fn render_method_body(
    model: &SchemaModel,
    dao: &DaoDescriptor,
    method: &MethodDescriptor,
    in_transaction: bool,
) -> String {
    let mut writer = BodyWriter::new(model);
    let body = match &method.operation {
        Operation::Read {
            statement, shape, ..
        } => writer.read(statement, shape, &method.params, in_transaction),
        Operation::Write {
            statement,
            tables,
            returns,
        } => writer.write(statement, tables, *returns, &method.params),
        Operation::EntityWrite {
            entity,
            sql,
            bind_fields,
            list,
            tables,
            returns,
        } => writer.entity_write(*entity, sql, bind_fields, *list, tables, *returns, &method.params[0]),
        Operation::Transaction {
            steps,
            returns_last,
        } => render_steps(dao, method, steps, *returns_last),
    };
    format!("{}{body}", writer.prelude())
}

fn render_steps(dao: &DaoDescriptor, method: &MethodDescriptor, steps: &[Step], returns_last: bool) -> String {
    let mut out = String::new();
    for (i, step) in steps.iter().enumerate() {
        let args: String = step
            .args
            .iter()
            .map(|&arg| format!(", {}", method.params[arg].name))
            .collect();
        let call = format!(
            "self.{}_in_transaction(tx{args}).await",
            dao.methods[step.method].name
        );
        if returns_last && i + 1 == steps.len() {
            out.push_str(&format!("        {call}\n"));
        } else {
            out.push_str(&format!("        {call}?;\n"));
        }
    }
    if !returns_last {
        out.push_str("        Ok(())\n");
    }
    out
}

fn tables_literal(tables: &[String]) -> String {
    let tables: Vec<String> = tables.iter().map(|t| literal(t)).collect();
    format!("&[{}]", tables.join(", "))
}

fn render_dao_impl(model: &SchemaModel, dao: &DaoDescriptor) -> String {
    let name = format!("{}Impl", dao.name);
    let mut out = format!(
        "/// Executes the statements of `{dao}`.\n\
         #[derive(Clone)]\n\
         pub struct {name} {{\n\
         \x20   db: depot_runtime::Database,\n\
         }}\n\
         \n\
         impl {name} {{\n\
         \x20   /// Creates the DAO over an open database handle.\n\
         \x20   pub fn new(db: depot_runtime::Database) -> Self {{\n\
         \x20       Self {{ db }}\n\
         \x20   }}\n",
        dao = dao.name
    );

    for method in &dao.methods {
        let output = return_type(model, dao, method);
        let borrowed = signature(&method.params, |k| borrowed_type(model, k));
        let m = &method.name;
        match &method.operation {
            Operation::Read {
                tables,
                observe: true,
                ..
            } => {
                let body = render_method_body(model, dao, method, false);
                let owned = signature(&method.params, |k| owned_type(model, k));
                let clones: String = method
                    .params
                    .iter()
                    .map(|p| format!("            let {0} = {0}.clone();\n", p.name))
                    .collect();
                let args = arguments(&method.params, borrow_owned);
                out.push_str(&format!(
                    "\n    async fn fetch_{m}(&self{borrowed}) -> depot_runtime::Result<{output}> {{\n\
                     {body}\
                     \x20   }}\n\
                     \n\
                     \x20   /// Results of `{m}`, re-run whenever {list} change.\n\
                     \x20   pub fn {m}(&self{owned}) -> depot_runtime::LiveQuery<{output}> {{\n\
                     \x20       let dao = self.clone();\n\
                     \x20       self.db.live_query({tables}, move || {{\n\
                     \x20           let dao = dao.clone();\n\
                     {clones}\
                     \x20           async move {{ dao.fetch_{m}({args}).await }}\n\
                     \x20       }})\n\
                     \x20   }}\n",
                    list = tables.join(", "),
                    tables = tables_literal(tables),
                ));
                continue;
            }
            Operation::Read { .. } => {
                let body = render_method_body(model, dao, method, false);
                out.push_str(&format!(
                    "\n    pub async fn {m}(&self{borrowed}) -> depot_runtime::Result<{output}> {{\n\
                     {body}\
                     \x20   }}\n"
                ));
            }
            _ => {
                let args: String = method.params.iter().map(|p| format!(", {}", p.name)).collect();
                out.push_str(&format!(
                    "\n    pub async fn {m}(&self{borrowed}) -> depot_runtime::Result<{output}> {{\n\
                     \x20       let mut tx = self.db.begin_write().await?;\n\
                     \x20       let value = self.{m}_in_transaction(&mut tx{args}).await?;\n\
                     \x20       tx.commit().await?;\n\
                     \x20       Ok(value)\n\
                     \x20   }}\n"
                ));
            }
        }
        let body = render_method_body(model, dao, method, true);
        out.push_str(&format!(
            "\n    /// Runs `{m}` inside `tx` without committing it.\n\
             \x20   pub async fn {m}_in_transaction(\n\
             \x20       &self,\n\
             \x20       tx: &mut depot_runtime::WriteTransaction{borrowed},\n\
             \x20   ) -> depot_runtime::Result<{output}> {{\n\
             {body}\
             \x20   }}\n"
        ));
    }
    out.push_str("}\n\n");
    out
}

fn render_dao_model(model: &SchemaModel, dao: &DaoDescriptor) -> String {
    let name = format!("{}Model", dao.name);
    let inner = format!("{}Impl", dao.name);
    let mut out = format!(
        "/// Facade over [`{inner}`]: reads run on the query executor, writes are\n\
         /// queued on the transaction executor.\n\
         #[derive(Clone)]\n\
         pub struct {name} {{\n\
         \x20   dao: {inner},\n\
         }}\n\
         \n\
         impl {name} {{\n\
         \x20   /// Creates the facade over an open database handle.\n\
         \x20   pub fn new(db: depot_runtime::Database) -> Self {{\n\
         \x20       Self {{ dao: {inner}::new(db) }}\n\
         \x20   }}\n"
    );

    for method in &dao.methods {
        let output = return_type(model, dao, method);
        let owned = signature(&method.params, |k| owned_type(model, k));
        let names = arguments(&method.params, |p| p.name.clone());
        let borrowed = arguments(&method.params, borrow_owned);
        let m = &method.name;
        match &method.operation {
            Operation::Read { observe: true, .. } => {
                out.push_str(&format!(
                    "\n    pub fn {m}(&self{owned}) -> depot_runtime::LiveQuery<{output}> {{\n\
                     \x20       self.dao.{m}({names})\n\
                     \x20   }}\n\
                     \n\
                     \x20   /// Calls `callback` with the results of `{m}` now and after every change.\n\
                     \x20   pub fn observe_{m}<F>(&self{owned}, callback: F) -> depot_runtime::QueryObserver\n\
                     \x20   where\n\
                     \x20       F: Fn(depot_runtime::Result<{output}>) + Send + Sync + 'static,\n\
                     \x20   {{\n\
                     \x20       self.dao.db.observe(self.dao.{m}({names}), callback)\n\
                     \x20   }}\n"
                ));
            }
            Operation::Read { .. } => {
                out.push_str(&format!(
                    "\n    pub async fn {m}(&self{owned}) -> depot_runtime::Result<{output}> {{\n\
                     \x20       let dao = self.dao.clone();\n\
                     \x20       self.dao\n\
                     \x20           .db\n\
                     \x20           .run_query(async move {{ dao.{m}({borrowed}).await }})\n\
                     \x20           .await\n\
                     \x20   }}\n"
                ));
            }
            Operation::Write { .. }
            | Operation::EntityWrite { .. }
            | Operation::Transaction { .. } => {
                out.push_str(&format!(
                    "\n    pub fn {m}(&self{owned}) -> depot_runtime::WriteTicket<{output}> {{\n\
                     \x20       let dao = self.dao.clone();\n\
                     \x20       self.dao\n\
                     \x20           .db\n\
                     \x20           .submit_write(async move {{ dao.{m}({borrowed}).await }})\n\
                     \x20   }}\n"
                ));
            }
        }
    }
    out.push_str("}\n\n");
    out
}

fn render_database(model: &SchemaModel, daos: &[DaoDescriptor]) -> String {
    let name = &model.name;
    let mut out = format!(
        "/// The `{name}` database.\n\
         #[derive(Clone)]\n\
         pub struct {name} {{\n\
         \x20   db: depot_runtime::Database,\n\
         }}\n\
         \n\
         impl {name} {{\n\
         \x20   /// Builder for a file database, with the auto-migrations registered.\n\
         \x20   pub fn builder(name: impl Into<String>) -> depot_runtime::Result<depot_runtime::DatabaseBuilder> {{\n\
         \x20       Ok(depot_runtime::Database::builder(name, schema()?).add_migrations(auto_migrations()))\n\
         \x20   }}\n\
         \n\
         \x20   /// Builder for an in-memory database.\n\
         \x20   pub fn in_memory_builder() -> depot_runtime::Result<depot_runtime::DatabaseBuilder> {{\n\
         \x20       Ok(depot_runtime::Database::in_memory_builder(schema()?))\n\
         \x20   }}\n\
         \n\
         \x20   /// Builds the handle. The database opens on first use.\n\
         \x20   pub fn from_builder(builder: depot_runtime::DatabaseBuilder) -> depot_runtime::Result<Self> {{\n\
         \x20       Ok(Self {{ db: builder.build()? }})\n\
         \x20   }}\n\
         \n\
         \x20   /// The underlying handle.\n\
         \x20   pub fn database(&self) -> &depot_runtime::Database {{\n\
         \x20       &self.db\n\
         \x20   }}\n"
    );
    for dao in daos {
        let accessor = snake_case(&dao.name);
        out.push_str(&format!(
            "\n    pub fn {accessor}(&self) -> {dao}Impl {{\n\
             \x20       {dao}Impl::new(self.db.clone())\n\
             \x20   }}\n\
             \n\
             \x20   pub fn {accessor}_model(&self) -> {dao}Model {{\n\
             \x20       {dao}Model::new(self.db.clone())\n\
             \x20   }}\n",
            dao = dao.name
        ));
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::Declaration;
    use crate::extractor::extract;

    const DECL: &str = r#"{
        "database": { "name": "WordDatabase", "version": 1 },
        "entities": [{
            "name": "Word",
            "table": "word_table",
            "fields": [
                { "name": "word", "type": "String" },
                { "name": "date", "type": "chrono::DateTime<chrono::Utc>" }
            ],
            "primary_key": ["word"]
        }, {
            "name": "Definition",
            "fields": [
                { "name": "id", "type": "i64" },
                { "name": "word", "type": "String" }
            ],
            "primary_key": ["id"],
            "auto_generate": true,
            "foreign_keys": [{
                "entity": "Word", "fields": ["word"], "parent_fields": ["word"],
                "on_delete": "CASCADE"
            }]
        }],
        "daos": [{
            "name": "WordDao",
            "methods": [
                { "name": "get_alphabetized_words", "intent": "OBSERVE",
                  "query": "SELECT * FROM word_table ORDER BY word ASC", "returns": "Vec<Word>" },
                { "name": "find_words", "intent": "QUERY",
                  "query": "SELECT word FROM word_table WHERE word IN (:words)",
                  "params": [{ "name": "words", "type": "Vec<String>" }], "returns": "Vec<String>" },
                { "name": "get", "intent": "QUERY",
                  "query": "SELECT * FROM word_table WHERE word = :word",
                  "params": [{ "name": "word", "type": "String" }], "returns": "Word" },
                { "name": "insert", "intent": "INSERT", "on_conflict": "IGNORE",
                  "params": [{ "name": "word", "type": "Word" }] },
                { "name": "delete_all", "intent": "QUERY", "query": "DELETE FROM word_table" },
                { "name": "replace_with", "intent": "TRANSACTION", "steps": ["delete_all", "insert"],
                  "params": [{ "name": "word", "type": "Word" }] }
            ]
        }]
    }"#;

    fn source() -> String {
        let decl = Declaration::from_json(DECL).unwrap();
        let model = SchemaModel::build(&decl).unwrap();
        let extraction = extract(&model, &decl.daos).unwrap();
        generate(&model, &extraction, &[]).unwrap()
    }

    #[test]
    fn test_entity_struct() {
        let source = source();
        assert!(source.contains("pub struct Word {"));
        assert!(source.contains("    pub date: chrono::DateTime<chrono::Utc>,"));
        assert!(source.contains("pub const VERSION: u32 = 1;"));
    }

    #[test]
    fn test_positional_marshaling() {
        let source = source();
        assert!(source.contains("word: row.try_get::<String, _>(0usize)?"));
        assert!(source.contains("date: converter_0.from_column(row.try_get::<i64, _>(1usize)?)?"));
        assert!(source.contains(
            "let converter_0 = self.db.converters().get::<depot_runtime::convert::DateTimeMillis>()?;"
        ));
    }

    #[test]
    fn test_list_parameter_uses_builder() {
        let source = source();
        assert!(source.contains("builder.push_list(words.len());"));
        assert!(source.contains("for item in words {"));
    }

    #[test]
    fn test_single_row_reports_empty_result() {
        assert!(source().contains("depot_runtime::Error::EmptyResult"));
    }

    #[test]
    fn test_observe_and_facade() {
        let source = source();
        assert!(source.contains("self.db.live_query(&[\"word_table\"], move || {"));
        assert!(source.contains("pub fn observe_get_alphabetized_words<F>(&self, callback: F)"));
        assert!(source.contains(
            "pub fn insert(&self, word: Word) -> depot_runtime::WriteTicket<()> {"
        ));
        assert!(source.contains(".submit_write(async move { dao.delete_all().await })"));
    }

    #[test]
    fn test_insert_binds_and_touches() {
        let source = source();
        assert!(source.contains("\"INSERT OR IGNORE INTO `word_table` (`word`, `date`) VALUES (?, ?)\""));
        assert!(source.contains(".bind(&word.word)"));
        assert!(source.contains(".bind(converter_0.to_column(&word.date))"));
        assert!(source.contains("tx.touch(\"word_table\");"));
    }

    #[test]
    fn test_cascade_touches_child_table() {
        let source = source();
        assert!(source.contains(
            "        if result.rows_affected() > 0 {\n            \
             tx.touch(\"word_table\");\n            \
             tx.touch(\"definition\");\n        }\n"
        ));
    }

    #[test]
    fn test_write_commits_around_transaction_form() {
        let source = source();
        assert!(source.contains(
            "    pub async fn insert(&self, word: &Word) -> depot_runtime::Result<()> {\n        \
             let mut tx = self.db.begin_write().await?;\n        \
             let value = self.insert_in_transaction(&mut tx, word).await?;\n        \
             tx.commit().await?;\n"
        ));
        assert!(source.contains("tx: &mut depot_runtime::WriteTransaction, word: &str,"));
        assert!(source.contains("        let conn = tx.connection();\n"));
    }

    #[test]
    fn test_transaction_runs_steps_in_order() {
        let source = source();
        assert!(source.contains(
            "        self.delete_all_in_transaction(tx).await?;\n        \
             self.insert_in_transaction(tx, word).await?;\n        \
             Ok(())\n"
        ));
        assert!(source.contains(
            "pub fn replace_with(&self, word: Word) -> depot_runtime::WriteTicket<()> {"
        ));
    }

    #[test]
    fn test_raw_literal_hashes() {
        assert_eq!(raw_literal("a\"#b"), "r##\"a\"#b\"##");
        assert_eq!(raw_literal("plain"), "r#\"plain\"#");
    }
}

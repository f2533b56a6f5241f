#![allow(dead_code)]

use std::path::Path;

use depot_compiler::{CompilationOutput, CompileError, Compiler, Declaration};
use depot_schema::{Affinity, DatabaseBundle, Entity, Field};

/// Declaration of the word database at `version`, with `extra_fields`
/// appended to the `Word` entity and `database_extra` merged into the
/// database object.
pub fn words_declaration(version: u32, extra_fields: &str, database_extra: &str) -> String {
    format!(
        r#"{{
            "database": {{ "name": "WordDatabase", "version": {version}{database_extra} }},
            "entities": [{{
                "name": "Word",
                "table": "word_table",
                "fields": [
                    {{ "name": "word", "type": "String" }}{extra_fields}
                ],
                "primary_key": ["word"]
            }}],
            "daos": [{{
                "name": "WordDao",
                "methods": [
                    {{ "name": "get_all_words", "intent": "QUERY",
                       "query": "SELECT * FROM word_table", "returns": "Vec<Word>" }},
                    {{ "name": "insert", "intent": "INSERT", "on_conflict": "IGNORE",
                       "params": [{{ "name": "word", "type": "Word" }}] }}
                ]
            }}]
        }}"#
    )
}

pub fn compile(json: &str, schema_dir: Option<&Path>) -> Result<CompilationOutput, CompileError> {
    let mut compiler = Compiler::new(Declaration::from_json(json)?);
    if let Some(dir) = schema_dir {
        compiler = compiler.schema_dir(dir);
    }
    compiler.compile()
}

/// Exports the version 1 bundle: `word_table(word TEXT NOT NULL PRIMARY KEY)`.
pub fn export_v1(dir: &Path) {
    let v1 = DatabaseBundle::new(
        1,
        vec![Entity::new("word_table")
            .field(Field::new("word", Affinity::Text).not_null())
            .primary_key(&["word"])],
        Vec::new(),
    )
    .unwrap();
    v1.export(dir).unwrap();
}

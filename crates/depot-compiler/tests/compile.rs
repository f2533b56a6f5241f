//! End-to-end compilation of declarations.

mod common;

use common::{compile, export_v1, words_declaration};
use depot_compiler::CompileError;
use depot_schema::{DatabaseBundle, SchemaError};

#[test]
fn test_compile_words() {
    let output = compile(&words_declaration(1, "", ""), None).unwrap();
    assert!(output.source.contains("pub struct WordDatabase {"));
    assert!(output.source.contains("pub struct WordDaoImpl {"));
    assert!(output.source.contains("pub struct WordDaoModel {"));
    assert!(output.warnings.is_empty());
    assert!(output.exported.is_none());
    assert_eq!(output.bundle.version, 1);
}

#[test]
fn test_export_schema() {
    let dir = tempfile::tempdir().unwrap();
    let json = words_declaration(1, "", r#", "export_schema": true"#);
    let output = compile(&json, Some(dir.path())).unwrap();

    let path = output.exported.unwrap();
    assert_eq!(path, dir.path().join("1.json"));
    let exported = DatabaseBundle::load(dir.path(), 1).unwrap();
    assert_eq!(exported.identity_hash, output.bundle.identity_hash);
}

#[test]
fn test_export_without_directory_fails() {
    let json = words_declaration(1, "", r#", "export_schema": true"#);
    let err = compile(&json, None).unwrap_err();
    assert!(matches!(err, CompileError::InvalidDeclaration { .. }));
}

#[test]
fn test_additive_auto_migration() {
    let dir = tempfile::tempdir().unwrap();
    export_v1(dir.path());

    let json = words_declaration(
        2,
        r#", { "name": "date", "type": "i64", "default": "0" }"#,
        r#", "auto_migrations": [{ "from": 1, "to": 2 }]"#,
    );
    let output = compile(&json, Some(dir.path())).unwrap();
    assert!(output.source.contains("depot_runtime::Migration::auto("));
    assert!(output
        .source
        .contains("\"ALTER TABLE `word_table` ADD COLUMN `date` INTEGER NOT NULL DEFAULT 0\""));
}

#[test]
fn test_altered_column_fails_generation() {
    let dir = tempfile::tempdir().unwrap();
    export_v1(dir.path());

    let json = r#"{
        "database": {
            "name": "WordDatabase", "version": 2,
            "auto_migrations": [{ "from": 1, "to": 2 }]
        },
        "entities": [{
            "name": "Word",
            "table": "word_table",
            "fields": [{ "name": "word", "type": "i64" }],
            "primary_key": ["word"]
        }]
    }"#;
    let err = compile(json, Some(dir.path())).unwrap_err();
    assert!(
        matches!(
            &err,
            CompileError::Schema(SchemaError::AlteredColumn { table, column, .. })
                if table == "word_table" && column == "word"
        ),
        "unexpected error: {err}"
    );
    assert!(err.to_string().contains("Altered column 'word_table.word'"));
}

#[test]
fn test_missing_bundle_fails() {
    let dir = tempfile::tempdir().unwrap();
    let json = words_declaration(
        2,
        r#", { "name": "date", "type": "i64", "default": "0" }"#,
        r#", "auto_migrations": [{ "from": 1, "to": 2 }]"#,
    );
    let err = compile(&json, Some(dir.path())).unwrap_err();
    assert!(matches!(
        err,
        CompileError::Schema(SchemaError::MissingBundle { version: 1, .. })
    ));
}

#[test]
fn test_all_errors_are_reported() {
    let json = r#"{
        "database": { "name": "WordDatabase", "version": 1 },
        "entities": [{
            "name": "Word",
            "table": "word_table",
            "fields": [{ "name": "word", "type": "String" }],
            "primary_key": ["word"]
        }],
        "daos": [{
            "name": "WordDao",
            "methods": [
                { "name": "a", "intent": "QUERY",
                  "query": "SELECT * FROM word_table WHERE word = :missing",
                  "returns": "Vec<Word>" },
                { "name": "b", "intent": "QUERY",
                  "query": "SELECT * FROM word_table WHERE word = :word AND word = ?",
                  "params": [{ "name": "word", "type": "String" }],
                  "returns": "Vec<Word>" }
            ]
        }]
    }"#;
    let errors = compile(json, None).unwrap_err().into_list();
    assert_eq!(errors.len(), 2);
    assert!(matches!(
        &errors[0],
        CompileError::UnresolvedBindParameter { method, parameter }
            if method == "WordDao::a" && parameter == "missing"
    ));
    assert!(matches!(&errors[1], CompileError::MixedBinding { method } if method == "WordDao::b"));
}

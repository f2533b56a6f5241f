//! Build-time generator for depot databases.
//!
//! `depot-compiler` reads a JSON declaration of a database (entities, views,
//! data-access objects) and writes the Rust source that executes it against
//! `depot-runtime`:
//!
//! - **Declaration** - the input format ([`Declaration`])
//! - **Schema model** - entities with resolved types and the schema bundle
//!   they imply ([`SchemaModel`])
//! - **Extractor** - one descriptor per DAO method: bind parameters, result
//!   mapping and touched tables ([`extractor`])
//! - **Writer** - the generated `<Dao>Impl` / `<Dao>Model` pair, entity
//!   structs and the database type ([`writer`])
//!
//! Generation fails as a whole when any declaration is invalid, reporting
//! every error at once.
//!
//! # Build script usage
//!
//! ```rust,ignore
//! fn main() {
//!     let out = std::path::PathBuf::from(std::env::var("OUT_DIR").unwrap());
//!     let output = depot_compiler::Compiler::from_path("words.json")
//!         .unwrap()
//!         .schema_dir("schemas")
//!         .compile()
//!         .unwrap();
//!     for warning in &output.warnings {
//!         println!("cargo:warning={warning}");
//!     }
//!     std::fs::write(out.join("words_db.rs"), output.source).unwrap();
//! }
//! ```

pub mod declaration;
pub mod error;
pub mod extractor;
pub mod model;
pub mod query;
pub mod types;
pub mod writer;

use std::path::{Path, PathBuf};

use depot_schema::{AutoMigration, DatabaseBundle};
use tracing::{debug, info, warn};

pub use declaration::Declaration;
pub use error::{CompileError, Result, Warning};
pub use extractor::{DaoDescriptor, MethodDescriptor};
pub use model::SchemaModel;

/// Output of one compilation.
#[derive(Debug, Clone)]
pub struct CompilationOutput {
    /// Generated Rust source.
    pub source: String,
    /// Schema bundle of the declared version.
    pub bundle: DatabaseBundle,
    /// Path the bundle was exported to, when exported.
    pub exported: Option<PathBuf>,
    /// Non-fatal findings.
    pub warnings: Vec<Warning>,
}

/// Compiles one declaration.
#[derive(Debug, Clone)]
pub struct Compiler {
    declaration: Declaration,
    schema_dir: Option<PathBuf>,
    export_schema: Option<bool>,
}

impl Compiler {
    /// Creates a compiler for a parsed declaration.
    #[must_use]
    pub const fn new(declaration: Declaration) -> Self {
        Self {
            declaration,
            schema_dir: None,
            export_schema: None,
        }
    }

    /// Creates a compiler for a declaration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Declaration::from_path(path)?))
    }

    /// Directory holding exported schema bundles, one `<version>.json` each.
    #[must_use]
    pub fn schema_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.schema_dir = Some(dir.into());
        self
    }

    /// Overrides the declaration's `export_schema` switch.
    #[must_use]
    pub fn export_schema(mut self, export: bool) -> Self {
        self.export_schema = Some(export);
        self
    }

    /// Builds the schema model only.
    pub fn schema(&self) -> Result<SchemaModel> {
        SchemaModel::build(&self.declaration)
    }

    /// Validates every declaration and generates the source.
    pub fn compile(&self) -> Result<CompilationOutput> {
        let decl = &self.declaration;
        let model = SchemaModel::build(decl)?;
        let extraction = extractor::extract(&model, &decl.daos)?;
        let migrations = self.auto_migrations(&model.bundle)?;
        let source = writer::generate(&model, &extraction, &migrations)?;

        let export = self.export_schema.unwrap_or(decl.database.export_schema);
        let exported = match (&self.schema_dir, export) {
            (Some(dir), true) => {
                let path = model.bundle.export(dir)?;
                info!(path = %path.display(), version = model.bundle.version, "Exported schema");
                Some(path)
            }
            (None, true) => {
                return Err(CompileError::invalid(
                    format!("database {}", decl.database.name),
                    "export_schema requires a schema directory",
                ));
            }
            _ => None,
        };

        info!(
            database = %decl.database.name,
            daos = extraction.daos.len(),
            migrations = migrations.len(),
            "Generated database"
        );
        Ok(CompilationOutput {
            source,
            bundle: model.bundle,
            exported,
            warnings: extraction.warnings,
        })
    }

    fn auto_migrations(&self, current: &DatabaseBundle) -> Result<Vec<AutoMigration>> {
        let specs = &self.declaration.database.auto_migrations;
        if specs.is_empty() {
            return Ok(Vec::new());
        }
        let Some(dir) = &self.schema_dir else {
            return Err(CompileError::invalid(
                format!("database {}", self.declaration.database.name),
                "auto_migrations require a schema directory",
            ));
        };

        let load = |version: u32| -> Result<DatabaseBundle> {
            if version == current.version {
                Ok(current.clone())
            } else {
                Ok(DatabaseBundle::load(dir, version)?)
            }
        };

        let mut errors = Vec::new();
        let mut migrations = Vec::new();
        for spec in specs {
            if spec.to > current.version {
                errors.push(CompileError::invalid(
                    format!("auto migration {} -> {}", spec.from, spec.to),
                    format!("target is newer than the declared version {}", current.version),
                ));
                continue;
            }
            let generated = load(spec.from).and_then(|from| {
                let to = load(spec.to)?;
                Ok(AutoMigration::generate(&from, &to, spec)?)
            });
            match generated {
                Ok(migration) => {
                    debug!(
                        from = migration.from,
                        to = migration.to,
                        statements = migration.statements.len(),
                        "Synthesized auto migration"
                    );
                    migrations.push(migration);
                }
                Err(e) => {
                    warn!(from = spec.from, to = spec.to, "Auto migration failed");
                    errors.push(e);
                }
            }
        }
        CompileError::collect(errors).map_or(Ok(migrations), Err)
    }
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::declaration::{Declaration, Intent, OnConflict};
    pub use crate::error::{CompileError, Result, Warning};
    pub use crate::{CompilationOutput, Compiler};
}

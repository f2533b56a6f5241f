//! depot CLI
//!
//! Command-line front end of the generator.

use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use depot_compiler::prelude::*;
use depot_schema::{diff, DatabaseBundle, IndexChange};

/// Generates type-safe data-access code for depot databases.
#[derive(Parser)]
#[command(name = "depot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding exported schema bundles.
    #[arg(short, long, env = "DEPOT_SCHEMA_DIR")]
    schema_dir: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate Rust source from a declaration.
    Generate {
        /// Declaration file.
        declaration: PathBuf,

        /// Output file (stdout if not specified).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Do not export the schema bundle even if the declaration asks for it.
        #[arg(long)]
        no_export: bool,
    },

    /// Export the schema bundle of a declaration.
    ExportSchema {
        /// Declaration file.
        declaration: PathBuf,
    },

    /// Compare two exported schema bundles.
    Diff {
        /// Older bundle.
        from: PathBuf,

        /// Newer bundle.
        to: PathBuf,
    },

    /// Validate a declaration without writing anything.
    Check {
        /// Declaration file.
        declaration: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Generate {
            declaration,
            output,
            no_export,
        } => {
            let mut compiler = Compiler::from_path(&declaration)?;
            if let Some(dir) = &cli.schema_dir {
                compiler = compiler.schema_dir(dir);
            }
            if no_export {
                compiler = compiler.export_schema(false);
            }
            let result = compiler.compile()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &result.source)?;
                    info!(path = %path.display(), "Wrote generated source");
                }
                None => print!("{}", result.source),
            }
        }

        Commands::ExportSchema { declaration } => {
            let Some(dir) = cli.schema_dir else {
                bail!("--schema-dir (or DEPOT_SCHEMA_DIR) is required to export a schema");
            };
            let model = Compiler::from_path(&declaration)?.schema()?;
            let path = model.bundle.export(&dir)?;
            println!("{}", path.display());
        }

        Commands::Diff { from, to } => {
            let from = DatabaseBundle::from_json(&std::fs::read_to_string(&from)?)?;
            let to = DatabaseBundle::from_json(&std::fs::read_to_string(&to)?)?;
            let changes = diff(&from, &to);

            println!("\nSchema {} -> {}:", from.version, to.version);
            println!("{:-<60}", "");
            if changes.is_empty() {
                println!(" No changes.");
            }
            for table in &changes.added_tables {
                println!(" + table {table}");
            }
            for table in &changes.removed_tables {
                println!(" - table {table}");
            }
            for column in &changes.added_columns {
                println!(" + column {}.{}", column.table, column.column);
            }
            for column in &changes.removed_columns {
                println!(" - column {}.{}", column.table, column.column);
            }
            for column in &changes.altered_columns {
                println!(" ~ column {}.{} ({})", column.table, column.column, column.change);
            }
            for index in &changes.altered_indices {
                let sign = match index.change {
                    IndexChange::Added => '+',
                    IndexChange::Removed => '-',
                    IndexChange::Changed => '~',
                };
                println!(" {sign} index {} on {}", index.name, index.table);
            }
            for table in &changes.rebuilt_tables {
                println!(" ~ table {table} (recreated)");
            }
            for view in &changes.changed_views {
                println!(" ~ view {view}");
            }
            println!();

            if !changes.altered_columns.is_empty() {
                bail!(
                    "{} altered column(s) require an explicit migration",
                    changes.altered_columns.len()
                );
            }
        }

        Commands::Check { declaration } => {
            let mut compiler = Compiler::from_path(&declaration)?.export_schema(false);
            if let Some(dir) = &cli.schema_dir {
                compiler = compiler.schema_dir(dir);
            }
            match compiler.compile() {
                Ok(result) => {
                    for warning in &result.warnings {
                        warn!("{warning}");
                    }
                    info!(
                        version = result.bundle.version,
                        warnings = result.warnings.len(),
                        "Declaration is valid"
                    );
                }
                Err(error) => {
                    for error in error.into_list() {
                        eprintln!("error: {error}");
                    }
                    bail!("declaration is invalid");
                }
            }
        }
    }

    Ok(())
}

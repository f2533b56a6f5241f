use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=words.json");
    println!("cargo:rerun-if-changed=schemas/1.json");

    let output = depot_compiler::Compiler::from_path("words.json")?
        .schema_dir("schemas")
        .compile()?;
    for warning in &output.warnings {
        println!("cargo:warning={warning}");
    }

    let out = PathBuf::from(std::env::var("OUT_DIR")?);
    std::fs::write(out.join("words_db.rs"), output.source)?;
    Ok(())
}

//! Inspect command implementation.

use std::path::Path;

use enclave_core::Archive;

use crate::colors;

pub fn execute(package: &Path) -> anyhow::Result<()> {
    let archive = Archive::open(package)?;
    let manifest = archive.manifest();

    println!(
        "{}Package{} {} {}(format {}){}",
        colors::BOLD,
        colors::RESET,
        manifest.name.as_deref().unwrap_or("<unnamed>"),
        colors::DIM,
        manifest.format,
        colors::RESET
    );
    println!("{}", "─".repeat(50));

    if manifest.modules.is_empty() {
        println!("(no objects)");
        return Ok(());
    }
    for (key, names) in &manifest.modules {
        println!("{}{}/{}", colors::CYAN, key, colors::RESET);
        for name in names {
            println!("  {}", name);
        }
    }
    Ok(())
}

//! Run command implementation.
//!
//! Loads a packaged model onto a pool and calls it once with the package's
//! example input.

use std::time::Instant;

use crate::ModelArgs;
use crate::colors;
use crate::loaded::{LoadedModel, describe};

pub fn execute(args: &ModelArgs) -> anyhow::Result<()> {
    let loaded = LoadedModel::load(args)?;

    colors::begin_step("Calling", &args.object);
    let start = Instant::now();
    let result = loaded.model.call(&loaded.example);
    let call_time = start.elapsed();
    colors::finish_step(result.is_ok());
    let output = result?;

    println!("\n{}Output:{}", colors::BOLD, colors::RESET);
    println!("{}", "─".repeat(50));
    println!("{}", describe(&output));
    println!("{}", "─".repeat(50));
    println!(
        "{}Completed{} in {:.2}ms (load: {:.2}ms)",
        colors::GREEN,
        colors::RESET,
        call_time.as_secs_f64() * 1000.0,
        loaded.load_time.as_secs_f64() * 1000.0
    );
    Ok(())
}

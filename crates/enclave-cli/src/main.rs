//! Enclave CLI - load packages onto a pool of isolated instances.

mod bench;
mod colors;
mod inspect;
mod loaded;
mod pack;
mod run;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "enclave")]
#[command(about = "Run packaged models on a pool of isolated instances")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Which model and example to load from a package.
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Path to the package directory
    package: PathBuf,

    /// Storage key holding the model
    #[arg(long, default_value = "model")]
    key: String,

    /// Object name of the model
    #[arg(long, default_value = "model.pkl")]
    object: String,

    /// Object name of the example input
    #[arg(long, default_value = "example.pkl")]
    example: String,

    /// Number of instances (defaults to ENCLAVE_POOL_SIZE, then the CPU count)
    #[arg(short, long)]
    interpreters: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a demo package (Linear + Sigmoid)
    Pack {
        /// Output directory
        dir: PathBuf,

        /// Input features of the linear layer
        #[arg(long, default_value = "20")]
        in_features: usize,

        /// Output features of the linear layer
        #[arg(long, default_value = "10")]
        out_features: usize,

        /// Seed for the generated weights
        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// List the objects stored in a package
    Inspect {
        /// Path to the package directory
        package: PathBuf,
    },

    /// Call a packaged model once with its example input
    Run {
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Call a packaged model from many threads and check the results agree
    Bench {
        #[command(flatten)]
        model: ModelArgs,

        /// Number of calling threads
        #[arg(short, long, default_value = "4")]
        threads: usize,

        /// Calls per thread
        #[arg(short = 'n', long, default_value = "100")]
        iterations: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Helper to format enclave-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<enclave_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Pack {
            dir,
            in_features,
            out_features,
            seed,
        } => pack::execute(&dir, in_features, out_features, seed).map_err(format_error)?,

        Commands::Inspect { package } => inspect::execute(&package).map_err(format_error)?,

        Commands::Run { model } => run::execute(&model).map_err(format_error)?,

        Commands::Bench {
            model,
            threads,
            iterations,
        } => bench::execute(&model, threads, iterations).map_err(format_error)?,
    }

    Ok(())
}

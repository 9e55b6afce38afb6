//! Bench command implementation.
//!
//! Shares one model across several threads and checks that every call returns
//! exactly the single-threaded baseline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use anyhow::{Context, bail};
use enclave_core::Value;

use crate::ModelArgs;
use crate::colors;
use crate::loaded::{LoadedModel, describe};

fn same_output(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Tensor(a), Value::Tensor(b)) => a.equal(b),
        (Value::Tuple(a), Value::Tuple(b)) | (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| same_output(a, b))
        }
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
        (Value::Str(a), Value::Str(b)) => a == b,
        _ => false,
    }
}

pub fn execute(args: &ModelArgs, threads: usize, iterations: usize) -> anyhow::Result<()> {
    if threads == 0 {
        bail!("--threads must be at least 1");
    }
    let loaded = LoadedModel::load(args)?;
    let baseline = loaded
        .model
        .call(&loaded.fresh_example()?)
        .context("baseline call")?;
    println!("{}Baseline{} {}", colors::DIM, colors::RESET, describe(&baseline));

    println!(
        "{}Running{} {} thread(s) x {} call(s) on {} instance(s)",
        colors::CYAN,
        colors::RESET,
        threads,
        iterations,
        loaded.pool.size()
    );

    let mismatches = AtomicUsize::new(0);
    let start = Instant::now();
    thread::scope(|s| -> anyhow::Result<()> {
        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            handles.push(s.spawn(|| -> anyhow::Result<()> {
                let input = loaded.fresh_example()?;
                for _ in 0..iterations {
                    let output = loaded.model.call(&input)?;
                    if !same_output(&output, &baseline) {
                        mismatches.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("bench thread panicked"))??;
        }
        Ok(())
    })?;
    let elapsed = start.elapsed();

    let total = threads * iterations;
    let mismatches = mismatches.into_inner();
    if mismatches > 0 {
        println!(
            "{}✗ {} of {} results differ from the baseline{}",
            colors::RED,
            mismatches,
            total,
            colors::RESET
        );
        bail!("{} result(s) differ from the baseline", mismatches);
    }

    println!(
        "{}Completed{} {} calls in {:.2}s ({:.0} calls/s), all identical to baseline",
        colors::GREEN,
        colors::RESET,
        total,
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_core::Tensor;

    #[test]
    fn test_same_output_is_bitwise() {
        let a = Value::Tensor(Tensor::ones(&[2]).unwrap());
        let b = Value::Tensor(Tensor::ones(&[2]).unwrap());
        let c = Value::Tensor(Tensor::zeros(&[2]).unwrap());
        assert!(same_output(&a, &b));
        assert!(!same_output(&a, &c));
        assert!(!same_output(&Value::Float(0.0), &Value::Float(-0.0)));
    }
}

//! Pool, package and model set up from command-line arguments.

use std::time::{Duration, Instant};

use anyhow::Context;
use enclave_core::{Model, Package, Pool, PoolConfig, Tensor, Value};

use crate::ModelArgs;
use crate::colors;

/// A model loaded onto a fresh pool, with its example input.
///
/// Field order matters: the model and package are released before the pool.
pub struct LoadedModel {
    pub model: Model,
    pub example: Vec<Value>,
    _package: Package,
    pub pool: Pool,
    pub load_time: Duration,
}

impl LoadedModel {
    pub fn load(args: &ModelArgs) -> anyhow::Result<Self> {
        let start = Instant::now();

        let mut config = PoolConfig::from_env();
        if let Some(size) = args.interpreters {
            config.size = size;
        }
        let pool = Pool::with_config(config)?;

        println!(
            "{}Loading{} {} {}({} instances){}",
            colors::CYAN,
            colors::RESET,
            args.package.display(),
            colors::DIM,
            pool.size(),
            colors::RESET
        );

        let package = pool
            .load_package(&args.package)
            .with_context(|| format!("loading {}", args.package.display()))?;
        let model = package.load_object(&args.key, &args.object)?;

        let example = {
            let session = package.acquire_session()?;
            session
                .attr("load_pickle")?
                .call_values(&[Value::from(args.key.as_str()), Value::from(args.example.as_str())])?
                .to_value()?
        };
        let example = match example {
            Value::Tuple(items) | Value::List(items) => items,
            single => vec![single],
        };

        Ok(Self {
            model,
            example,
            _package: package,
            pool,
            load_time: start.elapsed(),
        })
    }

    /// Host-owned copy of the example, free to be claimed by any instance.
    pub fn fresh_example(&self) -> anyhow::Result<Vec<Value>> {
        self.example.iter().map(detach).collect()
    }
}

fn detach(value: &Value) -> anyhow::Result<Value> {
    Ok(match value {
        Value::Tensor(t) => Value::Tensor(Tensor::new(t.shape().to_vec(), t.data().to_vec())?),
        Value::Tuple(items) => Value::Tuple(items.iter().map(detach).collect::<anyhow::Result<_>>()?),
        Value::List(items) => Value::List(items.iter().map(detach).collect::<anyhow::Result<_>>()?),
        other => other.clone(),
    })
}

/// One-line summary of a call result.
pub fn describe(value: &Value) -> String {
    match value {
        Value::Tensor(t) => {
            let preview: Vec<String> = t.data().iter().take(5).map(|x| format!("{:.4}", x)).collect();
            let more = if t.numel() > 5 { ", ..." } else { "" };
            format!("tensor {:?} [{}{}]", t.shape(), preview.join(", "), more)
        }
        other => format!("{:?}", other),
    }
}

//! Pack command implementation.
//!
//! Writes a small demo package: a Linear + Sigmoid model with seeded weights
//! and an example input of ones.

use std::path::Path;

use anyhow::bail;
use enclave_core::{PackageWriter, Pickled, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::colors;

/// Weights drawn uniformly from [-0.5, 0.5).
fn random_tensor(rng: &mut StdRng, shape: Vec<usize>) -> anyhow::Result<Tensor> {
    let count = Tensor::zeros(&shape)?.numel();
    let data = (0..count).map(|_| rng.gen_range(-0.5f32..0.5)).collect();
    Ok(Tensor::new(shape, data)?)
}

pub fn execute(dir: &Path, in_features: usize, out_features: usize, seed: u64) -> anyhow::Result<()> {
    if in_features == 0 || out_features == 0 {
        bail!("feature counts must be positive");
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let weight = random_tensor(&mut rng, vec![out_features, in_features])?;
    let bias = random_tensor(&mut rng, vec![out_features])?;

    let model = Pickled::sequential([
        Pickled::linear(&weight, Some(&bias)),
        Pickled::module("nn.Sigmoid"),
    ]);
    let example = Pickled::Tuple {
        items: vec![Pickled::tensor(&Tensor::ones(&[1, in_features])?)],
    };

    let mut writer = PackageWriter::create(dir)?.name("demo");
    writer.add("model", "model.pkl", &model)?;
    writer.add("model", "example.pkl", &example)?;
    let root = writer.finish()?;

    println!(
        "{}Packed{} Linear({} -> {}) + Sigmoid into {}",
        colors::GREEN,
        colors::RESET,
        in_features,
        out_features,
        root.display()
    );
    Ok(())
}

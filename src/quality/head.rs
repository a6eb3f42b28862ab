use std::{fs, path::Path};

use anyhow::{bail, Context, Result};
use ndarray::{Array1, Array2, ArrayView1};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const FEATURES: usize = 512;
pub const HIDDEN: usize = 256;

/// `Linear(512, 256) -> ReLU -> Linear(256, 1) -> Sigmoid`
#[derive(Debug, Clone)]
pub struct RegressionHead {
    fc1_weight: Array2<f32>,
    fc1_bias: Array1<f32>,
    fc2_weight: Array2<f32>,
    fc2_bias: Array1<f32>,
}

/// On-disk form of the head, row-major `[out][in]` like a torch state dict.
#[derive(Debug, Serialize, Deserialize)]
pub struct HeadWeights {
    pub fc1_weight: Vec<Vec<f32>>,
    pub fc1_bias: Vec<f32>,
    pub fc2_weight: Vec<Vec<f32>>,
    pub fc2_bias: Vec<f32>,
}

impl RegressionHead {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path).with_context(|| format!("could not read {}", path.display()))?;
        let weights: HeadWeights = serde_json::from_slice(&raw)
            .with_context(|| format!("could not parse head weights in {}", path.display()))?;
        Self::from_weights(weights)
    }

    pub fn from_weights(w: HeadWeights) -> Result<Self> {
        Ok(Self {
            fc1_weight: matrix("fc1_weight", w.fc1_weight, HIDDEN, FEATURES)?,
            fc1_bias: vector("fc1_bias", w.fc1_bias, HIDDEN)?,
            fc2_weight: matrix("fc2_weight", w.fc2_weight, 1, HIDDEN)?,
            fc2_bias: vector("fc2_bias", w.fc2_bias, 1)?,
        })
    }

    /// Fresh layers drawn the way torch initialises `nn.Linear`:
    /// uniform in `±1/sqrt(fan_in)` for weights and biases alike.
    pub fn untrained(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut uniform = |rows: usize, cols: usize| {
            let bound = 1.0 / (cols as f32).sqrt();
            let w = Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-bound..bound));
            let b = Array1::from_shape_fn(rows, |_| rng.gen_range(-bound..bound));
            (w, b)
        };
        let (fc1_weight, fc1_bias) = uniform(HIDDEN, FEATURES);
        let (fc2_weight, fc2_bias) = uniform(1, HIDDEN);
        Self {
            fc1_weight,
            fc1_bias,
            fc2_weight,
            fc2_bias,
        }
    }

    pub fn forward(&self, features: ArrayView1<f32>) -> Result<f32> {
        if features.len() != FEATURES {
            bail!("expected {} backbone features, got {}", FEATURES, features.len());
        }
        let hidden = (self.fc1_weight.dot(&features) + &self.fc1_bias).mapv(|v| v.max(0.0));
        let logit = self.fc2_weight.dot(&hidden)[0] + self.fc2_bias[0];
        Ok(sigmoid(logit))
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn matrix(name: &str, rows: Vec<Vec<f32>>, n_rows: usize, n_cols: usize) -> Result<Array2<f32>> {
    if rows.len() != n_rows || rows.iter().any(|r| r.len() != n_cols) {
        bail!("{} must be {}x{}", name, n_rows, n_cols);
    }
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Ok(Array2::from_shape_vec((n_rows, n_cols), flat)?)
}

fn vector(name: &str, values: Vec<f32>, len: usize) -> Result<Array1<f32>> {
    if values.len() != len {
        bail!("{} must have {} values, got {}", name, len, values.len());
    }
    Ok(Array1::from_vec(values))
}

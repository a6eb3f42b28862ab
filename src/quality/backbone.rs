//! Pretrained ResNet-18 feature extractor, run through ONNX Runtime.
//!
//! The model is the torchvision network with its final `fc` layer removed,
//! exported to ONNX. It takes a `1x3x224x224` normalized tensor and yields
//! 512 pooled features (shaped `1x512` or `1x512x1x1` depending on export).

use std::path::Path;

use anyhow::{bail, Context, Result};
use ndarray::{Array1, ArrayView4};
use ort::session::{builder::GraphOptimizationLevel, Session};
use tracing::info;

use crate::error::CompressError;

pub struct OnnxBackbone {
    session: Session,
    input_name: String,
    output_name: String,
}

impl OnnxBackbone {
    pub fn load(path: &Path, threads: usize) -> Result<Self, CompressError> {
        if !path.exists() {
            return Err(CompressError::ModelNotFound(path.to_path_buf()));
        }

        info!("loading backbone model from {}", path.display());
        let mut builder = Session::builder()
            .context("failed to create onnx session builder")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("failed to set optimization level")?;
        if threads > 0 {
            builder = builder
                .with_intra_threads(threads)
                .context("failed to set intra-op threads")?;
        }
        let session = builder
            .commit_from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .context("backbone model has no inputs")?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .context("backbone model has no outputs")?;

        Ok(Self {
            session,
            input_name,
            output_name,
        })
    }

    /// Pooled feature vector for one normalized frame.
    pub fn features(&self, input: ArrayView4<f32>) -> Result<Array1<f32>> {
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input]?)
            .context("backbone inference failed")?;
        let features = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .context("backbone output is not a float tensor")?;

        let flat: Vec<f32> = features.iter().copied().collect();
        if flat.len() != super::head::FEATURES {
            bail!(
                "backbone produced {} features, expected {}",
                flat.len(),
                super::head::FEATURES
            );
        }
        Ok(Array1::from_vec(flat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quality_backbone.onnx");
        match OnnxBackbone::load(&path, 0) {
            Err(CompressError::ModelNotFound(p)) => assert_eq!(p, path),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("loaded a model that does not exist"),
        }
    }
}

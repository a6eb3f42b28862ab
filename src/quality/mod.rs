//! Learned, no-reference quality estimate for encoded videos.
//!
//! A handful of frames is sampled across the clip, each one is scored by
//! [`QualityNet`] and the scores are averaged.

mod backbone;
pub mod frames;
pub mod head;
pub mod tensor;

use std::path::Path;

use anyhow::{anyhow, Result};
use ndarray::ArrayView4;
use tracing::{debug, info, instrument, warn};

pub use backbone::OnnxBackbone;
use frames::{FfmpegFrames, FrameSource};
use head::RegressionHead;

use crate::{
    config::{QualityConfig, Tools},
    error::CompressError,
    jobs::compress::VideoQuality,
};

pub const BACKBONE_FILE: &str = "quality_backbone.onnx";
pub const HEAD_FILE: &str = "quality_head.json";
const UNTRAINED_HEAD_SEED: u64 = 0x5eed;

/// Scores a single normalized `1x3xHxW` frame in [0,1].
pub trait FrameScorer: Send + Sync {
    fn score(&self, input: ArrayView4<f32>) -> Result<f32>;
}

pub struct QualityNet {
    backbone: OnnxBackbone,
    head: RegressionHead,
}

impl QualityNet {
    pub fn load(config: &QualityConfig) -> Result<Self, CompressError> {
        let backbone = OnnxBackbone::load(&config.model_dir.join(BACKBONE_FILE), config.threads)?;

        let head_path = config.model_dir.join(HEAD_FILE);
        let head = if head_path.exists() {
            info!("loading regression head from {}", head_path.display());
            RegressionHead::load(&head_path)?
        } else if config.allow_untrained_head {
            warn!(
                "{} not found, scoring with an untrained regression head",
                head_path.display()
            );
            RegressionHead::untrained(UNTRAINED_HEAD_SEED)
        } else {
            return Err(CompressError::ModelNotFound(head_path));
        };

        Ok(Self { backbone, head })
    }
}

impl FrameScorer for QualityNet {
    fn score(&self, input: ArrayView4<f32>) -> Result<f32> {
        let features = self.backbone.features(input)?;
        self.head.forward(features.view())
    }
}

pub struct QualityAssessor {
    frames: Box<dyn FrameSource>,
    scorer: Box<dyn FrameScorer>,
    samples: usize,
}

impl QualityAssessor {
    pub fn new(frames: Box<dyn FrameSource>, scorer: Box<dyn FrameScorer>, samples: usize) -> Self {
        Self {
            frames,
            scorer,
            samples,
        }
    }

    /// Load the network from the model directory and decode frames with ffmpeg.
    pub fn load(config: &QualityConfig, tools: &Tools) -> Result<Self, CompressError> {
        let net = QualityNet::load(config)?;
        Ok(Self::new(
            Box::new(FfmpegFrames::new(tools.clone())),
            Box::new(net),
            config.sample_frames,
        ))
    }
}

impl VideoQuality for QualityAssessor {
    #[instrument(skip(self, video), fields(video = %video.display()))]
    fn assess(&self, video: &Path) -> Result<f64, CompressError> {
        let frames = self.frames.frames(video, self.samples)?;
        if frames.is_empty() {
            return Err(CompressError::NoFramesExtracted);
        }

        let mut total = 0.0f64;
        for (i, frame) in frames.iter().enumerate() {
            let input = tensor::to_input_tensor(frame);
            let score = self.scorer.score(input.view())?;
            if !score.is_finite() {
                return Err(anyhow!("frame {} scored {}", i, score).into());
            }
            debug!("frame {} score {:.4}", i, score);
            total += score as f64;
        }

        let mean = (total / frames.len() as f64).clamp(0.0, 1.0);
        info!("quality {:.4} over {} frames", mean, frames.len());
        Ok(mean)
    }
}

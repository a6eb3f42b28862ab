mod avc;
mod compressor;
mod encode;
mod process;
mod settings;

use std::{
    path::{Path, PathBuf},
    process::Command,
};

pub use avc::LibX264;
pub use compressor::*;
pub use encode::EncodeProgress;
pub use process::CompressJob;
pub use settings::*;

/// Everything the encoder needs to know about one output rendition.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeSettings {
    /// Constant rate factor (0-51 for x264)
    pub crf: u8,
    /// Encoder speed preset name, e.g. "veryfast"
    pub speed: &'static str,
    /// Target video bitrate in Mbps
    pub bitrate_mbps: f64,
    pub width: u32,
    pub height: u32,
}

impl TranscodeSettings {
    pub fn new(settings: &CompressionSettings, (width, height): (u32, u32)) -> Self {
        let params = settings.preset.params();
        Self {
            crf: params.crf,
            speed: params.speed,
            bitrate_mbps: settings.bitrate_mbps,
            width,
            height,
        }
    }
}

/// Generate encoder arguments for ffmpeg
pub trait Transcoder: Send + Sync {
    fn transcode(&self, settings: &TranscodeSettings, ff: &mut Command);
}

/// `dir/clip.mp4` -> `dir/clip_compressed.mp4`
pub fn compressed_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match input.extension() {
        Some(ext) => format!("{}_compressed.{}", stem, ext.to_string_lossy()),
        None => format!("{}_compressed", stem),
    };
    input.with_file_name(name)
}

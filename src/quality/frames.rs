use std::{
    path::Path,
    process::{Command, Stdio},
};

use anyhow::Context;
use tracing::{debug, warn};

use crate::{config::Tools, error::CompressError, jobs::probe::probe_video};

/// Side length of the square frames fed to the network.
pub const INPUT_SIZE: u32 = 224;

/// A decoded frame as packed RGB24.
#[derive(Debug, Clone, PartialEq)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RgbFrame {
    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }
}

/// Produces up to `samples` evenly spaced frames of a video.
pub trait FrameSource: Send + Sync {
    fn frames(&self, video: &Path, samples: usize) -> Result<Vec<RgbFrame>, CompressError>;
}

/// `samples` indices spread linearly over `0..=frame_count-1`, truncated
/// towards zero. Short clips repeat indices, those are only kept once.
pub fn sample_indices(frame_count: u64, samples: usize) -> Vec<u64> {
    if frame_count == 0 || samples == 0 {
        return Vec::new();
    }
    if samples == 1 {
        return vec![0];
    }

    let last = (frame_count - 1) as u128;
    let steps = samples as u128 - 1;
    // i * last / steps <= last, so narrowing back is lossless
    let mut indices: Vec<u64> = (0..samples as u128)
        .map(|i| (i * last / steps) as u64)
        .collect();
    indices.dedup();
    indices
}

/// Split raw decoder output into whole frames, dropping a truncated tail.
pub fn split_frames(raw: &[u8], width: u32, height: u32) -> Vec<RgbFrame> {
    let len = RgbFrame::byte_len(width, height);
    raw.chunks_exact(len)
        .map(|chunk| RgbFrame {
            width,
            height,
            data: chunk.to_vec(),
        })
        .collect()
}

/// Decodes the sampled frames with ffmpeg, already scaled to the network input size.
pub struct FfmpegFrames {
    tools: Tools,
}

impl FfmpegFrames {
    pub fn new(tools: Tools) -> Self {
        Self { tools }
    }
}

impl FrameSource for FfmpegFrames {
    fn frames(&self, video: &Path, samples: usize) -> Result<Vec<RgbFrame>, CompressError> {
        let info = match probe_video(&self.tools.ffprobe, video) {
            Ok(info) => info,
            // an unreadable container simply has no frames to score
            Err(CompressError::Probe { reason, .. }) => {
                warn!("could not probe {} for sampling: {}", video.display(), reason);
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        let indices = sample_indices(info.frame_count, samples);
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        debug!("sampling frames {:?} of {}", indices, video.display());

        let output = Command::new(&self.tools.ffmpeg)
            .args(["-hide_banner", "-v", "error", "-i"])
            .arg(video)
            .args(["-an", "-sn", "-vf"])
            .arg(select_filter(&indices))
            .args(["-fps_mode", "passthrough", "-frames:v"])
            .arg(indices.len().to_string())
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to execute {}", self.tools.ffmpeg.display()))?;

        let frames = split_frames(&output.stdout, INPUT_SIZE, INPUT_SIZE);
        if !output.status.success() {
            warn!(
                "ffmpeg frame extraction exited with {:?} after {} frames: {}",
                output.status.code(),
                frames.len(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(frames)
    }
}

fn select_filter(indices: &[u64]) -> String {
    let terms = indices
        .iter()
        .map(|i| format!("eq(n\\,{})", i))
        .collect::<Vec<_>>()
        .join("+");
    format!(
        "select={},scale={}:{}:flags=bilinear",
        terms, INPUT_SIZE, INPUT_SIZE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_span_whole_clip() {
        assert_eq!(
            sample_indices(100, 10),
            vec![0, 11, 22, 33, 44, 55, 66, 77, 88, 99]
        );
        assert_eq!(sample_indices(1000, 3), vec![0, 499, 999]);
    }

    #[test]
    fn indices_truncate_like_integer_linspace() {
        // 0, 2.67, 5.33, 8 -> 0, 2, 5, 8
        assert_eq!(sample_indices(9, 4), vec![0, 2, 5, 8]);
    }

    #[test]
    fn huge_frame_counts_do_not_overflow() {
        let n = u64::MAX / 2;
        let indices = sample_indices(n, 10);
        assert_eq!(indices.len(), 10);
        assert_eq!(indices[0], 0);
        assert_eq!(indices[9], n - 1);
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn short_clips_sample_each_frame_once() {
        assert_eq!(sample_indices(3, 10), vec![0, 1, 2]);
        assert_eq!(sample_indices(1, 10), vec![0]);
    }

    #[test]
    fn empty_clip_has_nothing_to_sample() {
        assert!(sample_indices(0, 10).is_empty());
        assert!(sample_indices(50, 0).is_empty());
        assert_eq!(sample_indices(50, 1), vec![0]);
    }

    #[test]
    fn split_drops_partial_frames() {
        let len = RgbFrame::byte_len(2, 2);
        let mut raw = vec![7u8; len * 2];
        raw.extend_from_slice(&[1, 2, 3]);
        let frames = split_frames(&raw, 2, 2);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.data.len() == len));
        assert!(split_frames(&raw[..len - 1], 2, 2).is_empty());
    }

    #[test]
    fn select_filter_escapes_commas() {
        assert_eq!(
            select_filter(&[0, 12]),
            "select=eq(n\\,0)+eq(n\\,12),scale=224:224:flags=bilinear"
        );
    }

    #[test]
    fn missing_ffprobe_is_a_processing_error() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("x.mp4");
        std::fs::write(&video, b"junk").unwrap();
        let source = FfmpegFrames::new(Tools {
            ffmpeg: "/nonexistent/ffmpeg".into(),
            ffprobe: "/nonexistent/ffprobe".into(),
        });
        assert!(matches!(
            source.frames(&video, 10),
            Err(CompressError::Processing(_))
        ));
    }
}

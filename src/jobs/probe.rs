use std::{path::Path, process::Command};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CompressError;

/// Output when running ffprobe -v error -print_format json -show_streams <video>
#[derive(Serialize, Deserialize, Debug)]
pub struct FfProbeStreamsOutput {
    pub streams: Option<Vec<Stream>>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Stream {
    pub index: Option<i64>,
    pub codec_name: Option<String>,
    pub codec_type: Option<CodecType>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub r_frame_rate: Option<String>,
    pub avg_frame_rate: Option<String>,
    pub nb_frames: Option<String>,
    pub duration: Option<String>,
    pub tags: Option<Tags>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Copy, Clone)]
#[serde(rename_all = "snake_case")]
pub enum CodecType {
    Attachment,
    Audio,
    Data,
    Subtitle,
    Video,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Tags {
    #[serde(rename = "DURATION", alias = "DURATION-eng")]
    pub duration_eng: Option<String>,
    #[serde(rename = "NUMBER_OF_FRAMES", alias = "NUMBER_OF_FRAMES-eng")]
    pub number_of_frames_eng: Option<String>,
}

/// Dimensions and length of the first video stream of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    /// Best-effort frame count, 0 when the container does not say.
    pub frame_count: u64,
}

impl VideoInfo {
    pub fn from_streams(streams: &[Stream]) -> anyhow::Result<Self> {
        let stream = streams
            .iter()
            .find(|s| s.codec_type == Some(CodecType::Video))
            .context("could not find video stream")?;

        let width = stream.width.context("could not get width of video stream")?;
        let height = stream
            .height
            .context("could not get height of video stream")?;
        if width <= 0 || height <= 0 {
            return Err(anyhow!("invalid video dimensions {}x{}", width, height));
        }

        Ok(Self {
            width: u32::try_from(width)?,
            height: u32::try_from(height)?,
            frame_count: frame_count(stream),
        })
    }
}

/// Run ffprobe against `path` and read the first video stream.
pub fn probe_video(ffprobe: &Path, path: &Path) -> Result<VideoInfo, CompressError> {
    let probe_err = |reason: String| CompressError::Probe {
        path: path.to_path_buf(),
        reason,
    };

    let output = Command::new(ffprobe)
        .args(["-v", "error", "-print_format", "json", "-show_streams"])
        .arg(path)
        .output()
        .with_context(|| format!("failed to execute {}", ffprobe.display()))?;

    if !output.status.success() {
        return Err(probe_err(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let parsed: FfProbeStreamsOutput =
        serde_json::from_slice(&output.stdout).map_err(|e| probe_err(e.to_string()))?;
    let streams = parsed
        .streams
        .ok_or_else(|| probe_err("could not find streams".into()))?;
    let info = VideoInfo::from_streams(&streams).map_err(|e| probe_err(e.to_string()))?;

    debug!(
        "probed {}: {}x{}, {} frames",
        path.display(),
        info.width,
        info.height,
        info.frame_count
    );
    Ok(info)
}

fn frame_count(stream: &Stream) -> u64 {
    // mp4 reports nb_frames, mkv only carries the statistics tag
    let counted = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .or_else(|| {
            stream
                .tags
                .as_ref()
                .and_then(|t| t.number_of_frames_eng.as_deref())
                .and_then(|n| n.parse::<u64>().ok())
        })
        .filter(|&n| n > 0);
    if let Some(n) = counted {
        return n;
    }

    let fps = stream
        .r_frame_rate
        .as_deref()
        .or(stream.avg_frame_rate.as_deref())
        .and_then(parse_frame_rate);
    let duration = stream
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| {
            stream
                .tags
                .as_ref()
                .and_then(|t| t.duration_eng.as_deref())
                .and_then(parse_timestamp)
        });

    match (fps, duration) {
        (Some(fps), Some(duration)) if fps > 0.0 && duration > 0.0 => {
            (fps * duration).round() as u64
        }
        _ => 0,
    }
}

/// Parse ffprobe's "30000/1001" style rates.
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.parse().ok()?,
    };
    rate.is_finite().then_some(rate)
}

/// Parse "HH:MM:SS.fraction" into seconds.
fn parse_timestamp(raw: &str) -> Option<f64> {
    let mut parts = raw.trim().splitn(3, ':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + s)
}

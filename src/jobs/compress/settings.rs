use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jobs::probe::VideoInfo;

pub const DEFAULT_BITRATE_MBPS: f64 = 5.0;

#[derive(Error, Debug, PartialEq)]
pub enum SettingsError {
    #[error("unknown preset '{0}', expected one of: low, medium, high, custom")]
    UnknownPreset(String),
    #[error("unknown resolution '{0}', expected one of: original, 1080p, 720p, 480p")]
    UnknownResolution(String),
    #[error("bitrate must be a positive number of Mbps, got {0}")]
    InvalidBitrate(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Low,
    Medium,
    High,
    Custom,
}

/// Encoder parameters a preset stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PresetParams {
    pub crf: u8,
    /// x264 speed preset name.
    pub speed: &'static str,
}

impl Preset {
    pub const ALL: [Preset; 4] = [Preset::Low, Preset::Medium, Preset::High, Preset::Custom];

    pub fn params(self) -> PresetParams {
        match self {
            Preset::Low => PresetParams {
                crf: 28,
                speed: "veryfast",
            },
            Preset::Medium | Preset::Custom => PresetParams {
                crf: 23,
                speed: "medium",
            },
            Preset::High => PresetParams {
                crf: 18,
                speed: "slow",
            },
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Preset::Low => "low",
            Preset::Medium => "medium",
            Preset::High => "high",
            Preset::Custom => "custom",
        }
    }
}

impl FromStr for Preset {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Preset::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SettingsError::UnknownPreset(s.to_string()))
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetResolution {
    #[serde(rename = "original")]
    Original,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
}

impl TargetResolution {
    pub const ALL: [TargetResolution; 4] = [
        TargetResolution::Original,
        TargetResolution::P1080,
        TargetResolution::P720,
        TargetResolution::P480,
    ];

    /// Fixed output height, `None` keeps the source size.
    pub fn height(self) -> Option<u32> {
        match self {
            TargetResolution::Original => None,
            TargetResolution::P1080 => Some(1080),
            TargetResolution::P720 => Some(720),
            TargetResolution::P480 => Some(480),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TargetResolution::Original => "original",
            TargetResolution::P1080 => "1080p",
            TargetResolution::P720 => "720p",
            TargetResolution::P480 => "480p",
        }
    }

    /// Output frame size for a source of the given size, keeping its aspect ratio.
    pub fn output_dimensions(self, source: &VideoInfo) -> (u32, u32) {
        match self.height() {
            None => (source.width, source.height),
            Some(height) => {
                let aspect = source.width as f64 / source.height as f64;
                let width = (height as f64 * aspect).round() as u32;
                (width, height)
            }
        }
    }
}

impl FromStr for TargetResolution {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetResolution::ALL
            .into_iter()
            .find(|r| r.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SettingsError::UnknownResolution(s.to_string()))
    }
}

impl fmt::Display for TargetResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub preset: Preset,
    pub bitrate_mbps: f64,
    pub target_resolution: TargetResolution,
}

impl CompressionSettings {
    pub fn new(
        preset: Preset,
        bitrate_mbps: f64,
        target_resolution: TargetResolution,
    ) -> Result<Self, SettingsError> {
        if !bitrate_mbps.is_finite() || bitrate_mbps <= 0.0 {
            return Err(SettingsError::InvalidBitrate(bitrate_mbps));
        }
        Ok(Self {
            preset,
            bitrate_mbps,
            target_resolution,
        })
    }

    /// Build settings from the loosely typed values of a request form.
    pub fn parse(preset: &str, bitrate_mbps: f64, resolution: &str) -> Result<Self, SettingsError> {
        Self::new(preset.parse()?, bitrate_mbps, resolution.parse()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(width: u32, height: u32) -> VideoInfo {
        VideoInfo {
            width,
            height,
            frame_count: 0,
        }
    }

    #[test]
    fn preset_table() {
        assert_eq!(Preset::Low.params(), PresetParams { crf: 28, speed: "veryfast" });
        assert_eq!(Preset::Medium.params(), PresetParams { crf: 23, speed: "medium" });
        assert_eq!(Preset::High.params(), PresetParams { crf: 18, speed: "slow" });
        assert_eq!(Preset::Custom.params(), Preset::Medium.params());
    }

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!("High".parse::<Preset>().unwrap(), Preset::High);
        assert_eq!(" custom ".parse::<Preset>().unwrap(), Preset::Custom);
        assert_eq!("Original".parse::<TargetResolution>().unwrap(), TargetResolution::Original);
        assert_eq!("720P".parse::<TargetResolution>().unwrap(), TargetResolution::P720);
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert_eq!(
            "ultra".parse::<Preset>().unwrap_err(),
            SettingsError::UnknownPreset("ultra".into())
        );
        assert_eq!(
            "4k".parse::<TargetResolution>().unwrap_err(),
            SettingsError::UnknownResolution("4k".into())
        );
    }

    #[test]
    fn bitrate_must_be_positive() {
        for bad in [0.0, -1.5, f64::NAN, f64::INFINITY] {
            assert!(CompressionSettings::parse("medium", bad, "original").is_err());
        }
        let ok = CompressionSettings::parse("low", 0.1, "480p").unwrap();
        assert_eq!(ok.preset, Preset::Low);
        assert_eq!(ok.target_resolution, TargetResolution::P480);
    }

    #[test]
    fn original_keeps_source_size() {
        for (w, h) in [(1920, 1080), (641, 479), (3840, 1600)] {
            assert_eq!(TargetResolution::Original.output_dimensions(&source(w, h)), (w, h));
        }
    }

    #[test]
    fn scaled_sizes() {
        assert_eq!(TargetResolution::P720.output_dimensions(&source(1920, 1080)), (1280, 720));
        assert_eq!(TargetResolution::P480.output_dimensions(&source(1280, 720)), (853, 480));
        assert_eq!(TargetResolution::P1080.output_dimensions(&source(1440, 1080)), (1440, 1080));
        // upscaling is allowed, the table is absolute
        assert_eq!(TargetResolution::P1080.output_dimensions(&source(640, 480)), (1440, 1080));
    }

    #[test]
    fn aspect_ratio_is_preserved_within_rounding() {
        let sources = [(1920, 1080), (1280, 720), (720, 576), (1080, 1920), (4096, 2160), (333, 211)];
        for (w, h) in sources {
            for target in TargetResolution::ALL {
                let (ow, oh) = target.output_dimensions(&source(w, h));
                let expected = oh as f64 * w as f64 / h as f64;
                assert!(
                    (ow as f64 - expected).abs() <= 0.5,
                    "{}x{} -> {} gave {}x{}",
                    w,
                    h,
                    target,
                    ow,
                    oh
                );
            }
        }
    }
}

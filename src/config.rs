use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

use crate::error::AppError;

const DEFAULT_BIND: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 3000);
const DEFAULT_DB: &str = "sqlite.db";
const DEFAULT_MODEL_DIR: &str = "models";
const DEFAULT_SAMPLE_FRAMES: usize = 10;

/// Runtime configuration, read from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub tools: Tools,
    pub quality: QualityConfig,
}

/// Locations of the external ffmpeg binaries.
#[derive(Debug, Clone)]
pub struct Tools {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QualityConfig {
    pub model_dir: PathBuf,
    pub sample_frames: usize,
    /// Score with a freshly initialised regression head when no trained
    /// weights are present instead of refusing to start.
    pub allow_untrained_head: bool,
    /// ONNX Runtime intra-op threads, 0 leaves the runtime default.
    pub threads: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            sample_frames: DEFAULT_SAMPLE_FRAMES,
            allow_untrained_head: false,
            threads: 0,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let sample_frames: usize = parse_var("QUALITY_SAMPLE_FRAMES", DEFAULT_SAMPLE_FRAMES)?;
        if sample_frames == 0 {
            return Err(AppError::InvalidConfig {
                key: "QUALITY_SAMPLE_FRAMES",
                value: "0".into(),
            });
        }

        Ok(Self {
            bind: parse_var("SQUEEZE_BIND", DEFAULT_BIND)?,
            db_path: path_var("SQUEEZE_DB", DEFAULT_DB)?,
            tools: Tools {
                ffmpeg: path_var("FFMPEG_PATH", "ffmpeg")?,
                ffprobe: path_var("FFPROBE_PATH", "ffprobe")?,
            },
            quality: QualityConfig {
                model_dir: path_var("MODEL_DIR", DEFAULT_MODEL_DIR)?,
                sample_frames,
                allow_untrained_head: parse_var("QUALITY_ALLOW_UNTRAINED_HEAD", false)?,
                threads: parse_var("QUALITY_THREADS", 0)?,
            },
        })
    }
}

fn optional_var(key: &'static str) -> Result<Option<String>, AppError> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn path_var(key: &'static str, default: &str) -> Result<PathBuf, AppError> {
    Ok(optional_var(key)?
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default)))
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, AppError> {
    match optional_var(key)? {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::InvalidConfig { key, value: raw }),
        None => Ok(default),
    }
}

use std::{
    io::{self, BufRead, BufReader, Read},
    path::Path,
    process::{Command, Stdio},
    thread,
};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{TranscodeSettings, Transcoder};
use crate::error::CompressError;

/// One block of ffmpeg's `-progress` output.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeProgress {
    pub frame: u64,
    pub fps: f64,
    pub bitrate: String,
    pub total_size_b: u64,
    pub out_time_us: u64,
    pub speed: String,
    /// Share of the source frames encoded so far, if the frame count is known.
    pub fraction: Option<f64>,
}

/// Run ffmpeg to completion, forwarding progress blocks as they arrive.
///
/// Returns only after the process has exited, so the output file is
/// complete when this succeeds.
pub fn run_encoder(
    ffmpeg: &Path,
    input: &Path,
    output: &Path,
    transcoder: &dyn Transcoder,
    settings: &TranscodeSettings,
    total_frames: u64,
    on_progress: &mut dyn FnMut(&EncodeProgress),
) -> Result<(), CompressError> {
    let mut ff = Command::new(ffmpeg);
    ff.args(["-hide_banner", "-v", "error", "-y", "-i"]).arg(input);
    transcoder.transcode(settings, &mut ff);
    ff.args(["-progress", "pipe:1", "-nostats"]).arg(output);

    debug!(
        "ffmpeg command: {} {:?}",
        ffmpeg.display(),
        ff.get_args().collect::<Vec<_>>()
    );

    let mut child = ff
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to execute {}", ffmpeg.display()))?;

    let mut stderr = child
        .stderr
        .take()
        .context("could not get stderr from child ffmpeg")?;
    // drain stderr concurrently so a chatty encoder can't block on a full pipe
    let diagnostics = thread::spawn(move || {
        let mut buf = String::new();
        let _ = stderr.read_to_string(&mut buf);
        buf
    });

    let stdout = child
        .stdout
        .take()
        .context("could not get stdout from child ffmpeg")?;
    let progress = read_progress(BufReader::new(stdout), total_frames, on_progress);

    let status = child.wait().context("failed waiting for ffmpeg")?;
    let diagnostics = diagnostics
        .join()
        .map_err(|_| anyhow!("ffmpeg stderr reader panicked"))?;

    info!("encoding complete - status: {:?}", status.code());

    if !status.success() {
        let diagnostics = diagnostics.trim();
        return Err(CompressError::Encode {
            diagnostics: if diagnostics.is_empty() {
                format!("ffmpeg exited with {}", status)
            } else {
                diagnostics.to_string()
            },
        });
    }
    progress.context("failed to read ffmpeg progress")?;

    Ok(())
}

/// Parse `key=value` progress blocks until ffmpeg reports `progress=end`.
pub fn read_progress<R: BufRead>(
    reader: R,
    total_frames: u64,
    on_progress: &mut dyn FnMut(&EncodeProgress),
) -> io::Result<()> {
    let mut progress = EncodeProgress::default();

    for line in reader.lines() {
        let line = line?;
        let Some((key, value)) = parse_line(&line) else {
            continue;
        };
        match key {
            "frame" => {
                progress.frame = value.parse().unwrap_or(0);
                progress.fraction = (total_frames > 0)
                    .then(|| (progress.frame as f64 / total_frames as f64).clamp(0.0, 1.0));
            }
            "fps" => progress.fps = value.parse().unwrap_or(0.0),
            "bitrate" => progress.bitrate = value.to_string(),
            "out_time_us" => progress.out_time_us = value.parse().unwrap_or(0),
            "speed" => progress.speed = value.to_string(),
            "total_size" => progress.total_size_b = value.parse().unwrap_or(0),
            "progress" => {
                if value != "continue" {
                    if total_frames > 0 {
                        progress.fraction = Some(1.0);
                    }
                    on_progress(&progress);
                    break;
                }
                on_progress(&progress);
            }
            _ => {}
        }
    }

    Ok(())
}

fn parse_line(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.trim().split_once('=')?;
    // ffmpeg pads some values with spaces
    Some((key.trim_end(), value.trim_start()))
}

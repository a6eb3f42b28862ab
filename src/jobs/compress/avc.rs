use std::process::Command;

use tracing::debug;

use super::{TranscodeSettings, Transcoder};

pub struct LibX264;

impl Transcoder for LibX264 {
    fn transcode(&self, settings: &TranscodeSettings, ff: &mut Command) {
        let (width, height) = (even(settings.width), even(settings.height));
        if (width, height) != (settings.width, settings.height) {
            debug!(
                "rounding frame size {}x{} to {}x{} for 4:2:0",
                settings.width, settings.height, width, height
            );
        }

        ff
        // convert to h264
        .arg("-c:v")
        .arg("libx264")
        .arg("-c:a")
        .arg("aac")
        .arg("-b:v")
        .arg(format!("{}M", settings.bitrate_mbps))
        .arg("-s")
        .arg(format!("{}x{}", width, height))
        // set CRF
        .arg("-crf")
        .arg(settings.crf.to_string())
        // set preset
        .arg("-preset")
        .arg(settings.speed);
    }
}

// yuv420p can't hold odd luma dimensions
fn even(n: u32) -> u32 {
    n + (n & 1)
}

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{
    compressed_output_path,
    encode::{run_encoder, EncodeProgress},
    CompressionSettings, LibX264, TranscodeSettings, Transcoder,
};
use crate::{config::Tools, error::CompressError, jobs::probe::probe_video};

/// Anything that can put a number in [0,1] on how good a video looks.
pub trait VideoQuality: Send + Sync {
    fn assess(&self, video: &Path) -> Result<f64, CompressError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionResult {
    pub output_path: PathBuf,
    pub quality_score: f64,
    /// Output size over input size, below 1 when the file shrank.
    pub compression_ratio: f64,
}

/// Where a run currently is, as reported to the progress callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Progress {
    Probing,
    Encoding {
        progress: Option<f64>,
        #[serde(flatten)]
        encoder: EncodeProgress,
    },
    Assessing,
}

pub struct VideoCompressor {
    tools: Tools,
    transcoder: Box<dyn Transcoder>,
    quality: Arc<dyn VideoQuality>,
}

impl VideoCompressor {
    pub fn new(tools: Tools, quality: Arc<dyn VideoQuality>) -> Self {
        Self::with_transcoder(tools, Box::new(LibX264), quality)
    }

    pub fn with_transcoder(
        tools: Tools,
        transcoder: Box<dyn Transcoder>,
        quality: Arc<dyn VideoQuality>,
    ) -> Self {
        Self {
            tools,
            transcoder,
            quality,
        }
    }

    /// Encode `input` with `settings` next to the original and score the result.
    #[instrument(skip(self, input, settings, on_progress), fields(input = %input.display()))]
    pub fn compress(
        &self,
        input: &Path,
        settings: &CompressionSettings,
        mut on_progress: impl FnMut(Progress),
    ) -> Result<CompressionResult, CompressError> {
        if !input.exists() {
            return Err(CompressError::InputNotFound(input.to_path_buf()));
        }

        on_progress(Progress::Probing);
        let info = probe_video(&self.tools.ffprobe, input)?;

        let dims = settings.target_resolution.output_dimensions(&info);
        let transcode = TranscodeSettings::new(settings, dims);
        let output = compressed_output_path(input);
        info!(
            "compressing {} ({}x{}) -> {} ({}x{}, preset {}, crf {}, {} Mbps)",
            input.display(),
            info.width,
            info.height,
            output.display(),
            dims.0,
            dims.1,
            settings.preset,
            transcode.crf,
            settings.bitrate_mbps
        );

        run_encoder(
            &self.tools.ffmpeg,
            input,
            &output,
            self.transcoder.as_ref(),
            &transcode,
            info.frame_count,
            &mut |p: &EncodeProgress| {
                on_progress(Progress::Encoding {
                    progress: p.fraction,
                    encoder: p.clone(),
                })
            },
        )?;

        // the encoder has exited, sizes are final
        let compression_ratio = compression_ratio(input, &output)?;
        debug!("compression ratio: {:.4}", compression_ratio);

        on_progress(Progress::Assessing);
        let quality_score = self.quality.assess(&output)?;
        info!(
            "finished {}: quality {:.4}, ratio {:.4}",
            output.display(),
            quality_score,
            compression_ratio
        );

        Ok(CompressionResult {
            output_path: output,
            quality_score,
            compression_ratio,
        })
    }
}

/// `size(output) / size(input)`
pub fn compression_ratio(input: &Path, output: &Path) -> anyhow::Result<f64> {
    let input_size = fs::metadata(input)
        .with_context(|| format!("could not stat {}", input.display()))?
        .len();
    let output_size = fs::metadata(output)
        .with_context(|| format!("could not stat {}", output.display()))?
        .len();
    if input_size == 0 {
        anyhow::bail!("input file {} is empty", input.display());
    }
    Ok(output_size as f64 / input_size as f64)
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[derive(Default)]
    struct CountingQuality {
        calls: AtomicUsize,
    }

    impl VideoQuality for CountingQuality {
        fn assess(&self, _video: &Path) -> Result<f64, CompressError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(0.5)
        }
    }

    fn compressor(quality: Arc<dyn VideoQuality>) -> VideoCompressor {
        // binaries that can't exist, so any spawn attempt fails differently
        VideoCompressor::new(
            Tools {
                ffmpeg: PathBuf::from("/nonexistent/ffmpeg"),
                ffprobe: PathBuf::from("/nonexistent/ffprobe"),
            },
            quality,
        )
    }

    #[test]
    fn missing_input_fails_before_any_process() {
        let quality = Arc::new(CountingQuality::default());
        let c = compressor(quality.clone());
        let settings = CompressionSettings::parse("medium", 5.0, "720p").unwrap();
        let mut stages = Vec::new();

        let err = c
            .compress(Path::new("/definitely/not/here.mp4"), &settings, |p| stages.push(p))
            .unwrap_err();

        assert!(matches!(err, CompressError::InputNotFound(ref p) if p == Path::new("/definitely/not/here.mp4")));
        assert!(stages.is_empty());
        assert_eq!(quality.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn probe_failure_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("clip.mp4");
        fs::write(&input, b"not really a video").unwrap();
        let quality = Arc::new(CountingQuality::default());
        let settings = CompressionSettings::parse("low", 1.0, "original").unwrap();

        let err = compressor(quality.clone())
            .compress(&input, &settings, |_| {})
            .unwrap_err();

        assert!(matches!(err, CompressError::Processing(_)));
        assert_eq!(quality.calls.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("clip_compressed.mp4").exists());
    }

    const PROBE_720P: &str = r#"#!/bin/sh
cat <<'JSON'
{"streams":[{"codec_type":"audio"},{"codec_type":"video","width":1280,"height":720,"nb_frames":"20"}]}
JSON
"#;

    /// Writes an executable shell script standing in for an ffmpeg binary.
    #[cfg(unix)]
    fn fake_tool(dir: &Path, name: &str, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// ffmpeg that logs its arguments, writes 1000 bytes to the output and
    /// reports two progress blocks.
    #[cfg(unix)]
    fn encoding_tools(dir: &Path) -> Tools {
        let args = dir.join("args.txt");
        let ffmpeg = format!(
            r#"#!/bin/sh
echo "$@" > '{}'
for out; do :; done
head -c 1000 /dev/zero > "$out"
printf 'frame=10\nfps=25.0\nprogress=continue\nframe=20\nprogress=end\n'
"#,
            args.display()
        );
        Tools {
            ffmpeg: fake_tool(dir, "ffmpeg", &ffmpeg),
            ffprobe: fake_tool(dir, "ffprobe", PROBE_720P),
        }
    }

    fn input_of(dir: &Path, len: usize) -> PathBuf {
        let input = dir.join("clip.mp4");
        fs::write(&input, vec![1u8; len]).unwrap();
        input
    }

    fn stage_summary(stages: &[Progress]) -> Vec<String> {
        stages
            .iter()
            .map(|p| match p {
                Progress::Probing => "probing".to_string(),
                Progress::Encoding { progress, .. } => format!("encoding {:?}", progress),
                Progress::Assessing => "assessing".to_string(),
            })
            .collect()
    }

    #[cfg(unix)]
    #[test]
    fn full_run_encodes_measures_and_scores() {
        let dir = tempfile::tempdir().unwrap();
        let input = input_of(dir.path(), 4000);
        let quality = Arc::new(CountingQuality::default());
        let c = VideoCompressor::new(encoding_tools(dir.path()), quality.clone());
        let settings = CompressionSettings::parse("low", 2.0, "480p").unwrap();
        let mut stages = Vec::new();

        let result = c.compress(&input, &settings, |p| stages.push(p)).unwrap();

        let output = dir.path().join("clip_compressed.mp4");
        assert_eq!(result.output_path, output);
        assert_eq!(result.compression_ratio, 0.25);
        assert_eq!(result.quality_score, 0.5);
        assert_eq!(fs::metadata(&output).unwrap().len(), 1000);
        assert_eq!(quality.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            stage_summary(&stages),
            ["probing", "encoding Some(0.5)", "encoding Some(1.0)", "assessing"]
        );

        let args = fs::read_to_string(dir.path().join("args.txt")).unwrap();
        assert!(args.starts_with("-hide_banner -v error -y -i "), "{}", args);
        assert!(
            args.contains("-c:v libx264 -c:a aac -b:v 2M -s 854x480 -crf 28 -preset veryfast -progress pipe:1 -nostats"),
            "{}",
            args
        );
    }

    #[cfg(unix)]
    #[test]
    fn encoder_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let input = input_of(dir.path(), 4000);
        let tools = Tools {
            ffmpeg: fake_tool(
                dir.path(),
                "ffmpeg",
                "#!/bin/sh\necho 'Unknown encoder libx264' >&2\nexit 1\n",
            ),
            ffprobe: fake_tool(dir.path(), "ffprobe", PROBE_720P),
        };
        let quality = Arc::new(CountingQuality::default());
        let settings = CompressionSettings::parse("medium", 5.0, "original").unwrap();
        let mut stages = Vec::new();

        let err = VideoCompressor::new(tools, quality.clone())
            .compress(&input, &settings, |p| stages.push(p))
            .unwrap_err();

        match err {
            CompressError::Encode { diagnostics } => {
                assert_eq!(diagnostics, "Unknown encoder libx264")
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(stage_summary(&stages), ["probing"]);
        assert_eq!(quality.calls.load(Ordering::SeqCst), 0);
    }

    struct StreamCopy;

    impl Transcoder for StreamCopy {
        fn transcode(&self, settings: &TranscodeSettings, ff: &mut std::process::Command) {
            ff.args(["-c", "copy", "-metadata"])
                .arg(format!("comment={}x{}", settings.width, settings.height));
        }
    }

    #[cfg(unix)]
    #[test]
    fn transcoder_decides_encoder_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let input = input_of(dir.path(), 2000);
        let c = VideoCompressor::with_transcoder(
            encoding_tools(dir.path()),
            Box::new(StreamCopy),
            Arc::new(CountingQuality::default()),
        );
        let settings = CompressionSettings::parse("high", 5.0, "1080p").unwrap();

        let result = c.compress(&input, &settings, |_| {}).unwrap();
        assert_eq!(result.compression_ratio, 0.5);

        let args = fs::read_to_string(dir.path().join("args.txt")).unwrap();
        assert!(args.contains("-c copy -metadata comment=1920x1080 -progress pipe:1"), "{}", args);
        assert!(!args.contains("libx264"), "{}", args);
    }

    #[test]
    fn ratio_is_output_over_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mp4");
        let output = dir.path().join("in_compressed.mp4");
        fs::File::create(&input).unwrap().write_all(&[0u8; 4000]).unwrap();
        fs::File::create(&output).unwrap().write_all(&[0u8; 1000]).unwrap();

        assert_eq!(compression_ratio(&input, &output).unwrap(), 0.25);
    }

    #[test]
    fn ratio_needs_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mp4");
        fs::write(&input, b"abc").unwrap();
        assert!(compression_ratio(&input, &dir.path().join("missing.mp4")).is_err());
    }

    #[test]
    fn progress_serializes_with_stage_tag() {
        let json = serde_json::to_value(Progress::Encoding {
            progress: Some(0.5),
            encoder: EncodeProgress {
                frame: 10,
                ..Default::default()
            },
        })
        .unwrap();
        assert_eq!(json["stage"], "encoding");
        assert_eq!(json["progress"], 0.5);
        assert_eq!(json["frame"], 10);
        assert_eq!(serde_json::to_value(Progress::Assessing).unwrap()["stage"], "assessing");
    }
}

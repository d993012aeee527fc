//! Media conversion through an ffmpeg subprocess.

use crate::error::Result;
use crate::ingest::classify::MediaTarget;

use anyhow::Context as _;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Converts a local media file into a provider-native format.
#[async_trait::async_trait]
pub trait MediaConverter: Send + Sync + 'static {
    /// Convert `input` into `output` (which may already exist and is overwritten).
    async fn convert(&self, input: &Path, output: &Path, target: MediaTarget) -> Result<()>;
}

/// `ffmpeg` backed converter.
#[derive(Debug, Clone)]
pub struct FfmpegConverter {
    program: String,
}

impl Default for FfmpegConverter {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegConverter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn arguments(input: &Path, output: &Path, target: MediaTarget) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-i".into(),
            input.display().to_string(),
        ];

        match target {
            MediaTarget::Png => {}
            MediaTarget::StillFrame => args.extend(["-frames:v".into(), "1".into()]),
            MediaTarget::Mp3 => args.extend([
                "-vn".into(),
                "-codec:a".into(),
                "libmp3lame".into(),
                "-q:a".into(),
                "2".into(),
            ]),
            MediaTarget::Mp4 => args.extend([
                "-movflags".into(),
                "+faststart".into(),
                "-pix_fmt".into(),
                "yuv420p".into(),
                // libx264 needs even dimensions.
                "-vf".into(),
                "scale=trunc(iw/2)*2:trunc(ih/2)*2".into(),
                "-c:v".into(),
                "libx264".into(),
            ]),
        }

        args.push(output.display().to_string());
        args
    }
}

#[async_trait::async_trait]
impl MediaConverter for FfmpegConverter {
    async fn convert(&self, input: &Path, output: &Path, target: MediaTarget) -> Result<()> {
        let args = Self::arguments(input, output, target);

        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to execute: {}", self.program))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(anyhow::anyhow!(
                "{} exited with {}: {}",
                self.program,
                result.status.code().unwrap_or(-1),
                stderr.trim()
            )
            .into());
        }

        let metadata = tokio::fs::metadata(output)
            .await
            .with_context(|| format!("conversion produced no output: {}", output.display()))?;
        if metadata.len() == 0 {
            return Err(anyhow::anyhow!("conversion produced an empty file").into());
        }

        tracing::debug!(
            input = %input.display(),
            output = %output.display(),
            ?target,
            "media converted"
        );
        Ok(())
    }
}

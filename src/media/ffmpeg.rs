use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{run_tool, Clip, FrameSampler, SamplerError};
use crate::domain::models::{RawTitle, TimeWindow};

// Keep only the bottom half of each frame, where title cards usually sit
const CROP_LOWER_HALF: &str = "crop=in_w:in_h/2:0:in_h/2";

/// Cuts sampling clips with ffmpeg into a scratch directory.
pub struct FfmpegSampler {
    ffmpeg: PathBuf,
    clip_dir: PathBuf,
    counter: AtomicU64,
}

impl FfmpegSampler {
    pub fn new(ffmpeg: PathBuf, clip_dir: PathBuf) -> Self {
        Self {
            ffmpeg,
            clip_dir,
            counter: AtomicU64::new(0),
        }
    }

    fn clip_path(&self, title: &RawTitle, window: TimeWindow) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let id: String = title
            .id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.clip_dir.join(format!(
            "title.{id}.{}-{}.{n}.m4v",
            window.start_minute, window.end_minute
        ))
    }
}

#[async_trait]
impl FrameSampler for FfmpegSampler {
    async fn sample(&self, title: &RawTitle, window: TimeWindow) -> Result<Clip, SamplerError> {
        // The guard exists before ffmpeg starts writing, so a failed or
        // cancelled run still removes whatever partial file it left.
        let clip = Clip::new(self.clip_path(title, window), window);
        debug!(title = %title.id, window = %window, clip = %clip.path().display(), "Starting ffmpeg copy");

        run_tool(&self.ffmpeg, clip_args(&title.source, window, clip.path())).await?;

        if !clip.path().exists() {
            return Err(SamplerError::MissingOutput(clip.path().to_path_buf()));
        }
        Ok(clip)
    }
}

fn clip_args(source: &Path, window: TimeWindow, output: &Path) -> Vec<OsString> {
    vec![
        "-y".into(),
        "-ss".into(),
        window.start().as_secs().to_string().into(),
        "-i".into(),
        source.as_os_str().to_owned(),
        "-t".into(),
        window.length().as_secs().to_string().into(),
        "-filter:v".into(),
        CROP_LOWER_HALF.into(),
        "-an".into(),
        output.as_os_str().to_owned(),
    ]
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

pub async fn probe_duration(ffprobe: &Path, path: &Path) -> Result<Duration> {
    let output = run_tool(
        ffprobe,
        [
            OsString::from("-v"),
            "quiet".into(),
            "-print_format".into(),
            "json".into(),
            "-show_format".into(),
            path.as_os_str().to_owned(),
        ],
    )
    .await
    .context("Failed to run ffprobe")?;

    parse_duration(&output.stdout)
}

fn parse_duration(json: &[u8]) -> Result<Duration> {
    let info: FfprobeOutput = serde_json::from_slice(json)?;
    let seconds: f64 = info
        .format
        .duration
        .context("ffprobe reported no duration")?
        .parse()
        .context("ffprobe reported an invalid duration")?;
    Duration::try_from_secs_f64(seconds).context("ffprobe reported an invalid duration")
}

/// Builds a [`RawTitle`] for an already ripped file.
pub async fn probe_title(ffprobe: &Path, path: &Path, disc_index: u32) -> Result<RawTitle> {
    let size_bytes = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Failed to stat {path:?}"))?
        .len();
    let duration = probe_duration(ffprobe, path).await?;
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("title")
        .to_string();

    Ok(RawTitle {
        id: name.clone(),
        name,
        source: path.to_path_buf(),
        size_bytes,
        duration,
        disc_index,
    })
}

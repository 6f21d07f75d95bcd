use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cli::Cli;
use crate::domain::episodes::Subset;
use crate::ocr::video_intelligence::RecognizerSettings;
use crate::workflows::matcher::MatchWeights;
use crate::workflows::retry::RetryPolicy;
use crate::workflows::selector::SelectionPolicy;

pub const TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";
pub const BUCKET_ENV: &str = "EPISODE_IMPORTER_BUCKET";

const DEFAULT_WORKERS: usize = 3;

#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct ConfigFile {
    pub gcs_bucket: Option<String>,
    pub project: Option<String>,
    pub access_token: Option<String>,
    pub confidence: Option<f64>,
    pub min_span_confidence: Option<f32>,
    pub workers: Option<usize>,
}

impl ConfigFile {
    /// Reads `path`; a missing file is an empty configuration.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {path:?}"))?;
        toml::from_str(&content).with_context(|| format!("Invalid config file {path:?}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolPaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub makemkvcon: PathBuf,
    pub handbrake: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            makemkvcon: PathBuf::from("makemkvcon"),
            handbrake: PathBuf::from("HandBrakeCLI"),
        }
    }
}

/// Settings fixed for the whole run, shared read-only by every title pipeline.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub selection: SelectionPolicy,
    pub confidence_threshold: f64,
    pub subset: Option<Subset>,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub weights: MatchWeights,
    pub tools: ToolPaths,
    pub recognizer: RecognizerSettings,
}

impl EngineConfig {
    pub fn new(confidence_threshold: f64) -> Self {
        Self {
            selection: SelectionPolicy::default(),
            confidence_threshold,
            subset: None,
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
            weights: MatchWeights::default(),
            tools: ToolPaths::default(),
            recognizer: RecognizerSettings::default(),
        }
    }
}

/// Folds command line, environment and config file into one configuration.
/// Earlier sources win: command line, then environment, then file.
pub fn resolve<E>(cli: &Cli, file: &ConfigFile, env: E) -> Result<EngineConfig>
where
    E: Fn(&str) -> Option<String>,
{
    let Some(confidence) = cli.confidence.or(file.confidence) else {
        bail!("No confidence threshold set. Pass --confidence or add `confidence = 0.6` to {:?}", get_config_path());
    };
    if !(0.0..=1.0).contains(&confidence) {
        bail!("Confidence threshold must be between 0 and 1, got {confidence}");
    }

    let workers = cli.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS);
    if workers == 0 {
        bail!("At least one worker is required");
    }

    let Some(staging) = cli
        .gcs_bucket
        .clone()
        .or_else(|| env(BUCKET_ENV))
        .or_else(|| file.gcs_bucket.clone())
    else {
        bail!("No staging bucket for text detection. Pass --gcs-bucket, set {BUCKET_ENV} or add gcs_bucket to {:?}", get_config_path());
    };

    let mut recognizer = RecognizerSettings {
        staging,
        project: cli.project.clone().or_else(|| file.project.clone()),
        access_token: env(TOKEN_ENV).or_else(|| file.access_token.clone()),
        ..RecognizerSettings::default()
    };
    if let Some(min) = file.min_span_confidence {
        if !(0.0..=1.0).contains(&min) {
            bail!("min_span_confidence must be between 0 and 1, got {min}");
        }
        recognizer.min_span_confidence = min;
    }

    let defaults = ToolPaths::default();
    let tools = ToolPaths {
        ffmpeg: cli.ffmpeg.clone().unwrap_or(defaults.ffmpeg),
        ffprobe: cli.ffprobe.clone().unwrap_or(defaults.ffprobe),
        makemkvcon: cli.makemkvcon.clone().unwrap_or(defaults.makemkvcon),
        handbrake: cli.handbrake.clone().unwrap_or(defaults.handbrake),
    };

    Ok(EngineConfig {
        selection: cli.extraction_mode.clone(),
        confidence_threshold: confidence,
        subset: cli.subset.clone(),
        workers,
        retry: RetryPolicy::default(),
        weights: MatchWeights::default(),
        tools,
        recognizer,
    })
}

fn get_config_dir_path() -> PathBuf {
    xdir::config()
        .map(|path| path.join("episode-importer"))
        // If the standard path could not be found (e.g.`$HOME` is not set),
        // default to the current directory.
        .unwrap_or_default()
}

pub fn get_config_path() -> PathBuf {
    get_config_dir_path().join("config.toml")
}

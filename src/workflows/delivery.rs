use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, error, info};

use crate::domain::episodes::EpisodeSelector;
use crate::domain::models::{EpisodeCandidate, IdentificationOutcome};
use crate::media::handbrake::{HandBrake, Preset};
use crate::workflows::engine::{RunReport, TitleOutcome};
use crate::workflows::renamer;

pub const BATCH_SCRIPT: &str = "transcode.sh";

/// Episodes transcoded with a higher quality preset than the rest.
#[derive(Debug, Clone)]
pub struct HqRouting {
    pub preset: Preset,
    /// Route episodes titled `... Part <n>`
    pub multipart: bool,
    pub episodes: Option<EpisodeSelector>,
}

impl HqRouting {
    pub fn applies_to(&self, episode: &EpisodeCandidate) -> bool {
        (self.multipart && is_multipart(&episode.title))
            || self
                .episodes
                .as_ref()
                .is_some_and(|selector| selector.contains(episode))
    }
}

fn is_multipart(title: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Part \d+$").expect("static pattern is valid"))
        .is_match(title.trim_end())
}

/// Puts resolved titles into the library, either transcoded or as raw copies.
pub struct Delivery {
    pub library: PathBuf,
    pub show: String,
    pub handbrake: HandBrake,
    pub preset: Option<Preset>,
    pub hq: Option<HqRouting>,
    /// Copy raw titles and script the transcodes instead of running them
    pub title_only: bool,
}

impl Delivery {
    /// Preset `episode` is transcoded with, if any.
    pub fn preset_for(&self, episode: &EpisodeCandidate) -> Option<&Preset> {
        match &self.hq {
            Some(hq) if hq.applies_to(episode) => {
                debug!(episode = %episode, preset = %hq.preset.name, "Using HQ preset");
                Some(&hq.preset)
            }
            _ => self.preset.as_ref(),
        }
    }

    /// Delivers every resolved title of `report`. A failing title is logged
    /// and skipped. Returns the files written to the library.
    pub async fn deliver(&self, report: &RunReport) -> Result<Vec<PathBuf>> {
        let mut delivered = Vec::new();
        let mut script = Vec::new();

        for outcome in &report.outcomes {
            match self.deliver_title(outcome, &mut script).await {
                Ok(Some(path)) => delivered.push(path),
                Ok(None) => info!(title = %outcome.title.id, "Not delivering abandoned title"),
                Err(e) => error!(title = %outcome.title.id, "Delivery failed: {e:#}"),
            }
        }

        if !script.is_empty() {
            let path = self.library.join(BATCH_SCRIPT);
            let mut content = String::from("#!/bin/sh\nset -e\n");
            for line in &script {
                content.push_str(line);
                content.push('\n');
            }
            tokio::fs::write(&path, content)
                .await
                .with_context(|| format!("Failed to write {path:?}"))?;
            info!(script = %path.display(), commands = script.len(), "Wrote transcode script");
        }

        Ok(delivered)
    }

    async fn deliver_title(
        &self,
        outcome: &TitleOutcome,
        script: &mut Vec<String>,
    ) -> Result<Option<PathBuf>> {
        let IdentificationOutcome::Resolved { episode, .. } = &outcome.outcome else {
            return Ok(None);
        };
        let source = &outcome.title.source;

        match self.preset_for(episode) {
            Some(preset) if !self.title_only => {
                let destination = renamer::library_path(&self.library, &self.show, episode, "m4v");
                self.handbrake.transcode(preset, source, &destination).await?;
                Ok(Some(destination))
            }
            preset => {
                let destination = renamer::library_path(&self.library, &self.show, episode, "mkv");
                copy(source, &destination).await?;
                if let Some(preset) = preset {
                    let output = destination.with_extension("m4v");
                    script.push(self.handbrake.command_line(preset, &destination, &output));
                }
                Ok(Some(destination))
            }
        }
    }
}

async fn copy(source: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    info!(source = %source.display(), destination = %destination.display(), "Copying title");
    tokio::fs::copy(source, destination)
        .await
        .with_context(|| format!("Failed to copy {source:?} to {destination:?}"))?;
    Ok(())
}

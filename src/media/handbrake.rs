use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::run_tool;

/// A HandBrake preset export holding exactly one preset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preset {
    pub file: PathBuf,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct PresetFile {
    #[serde(rename = "PresetList")]
    preset_list: Vec<PresetEntry>,
}

#[derive(Debug, Deserialize)]
struct PresetEntry {
    #[serde(rename = "PresetName")]
    preset_name: String,
}

impl Preset {
    pub fn load(file: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(file).with_context(|| format!("Failed to read preset {file:?}"))?;
        let parsed: PresetFile = serde_json::from_str(&content)
            .with_context(|| format!("Preset file {file:?} in unexpected format"))?;
        let [entry] = parsed.preset_list.as_slice() else {
            bail!(
                "Preset file {file:?} must contain exactly one preset, found {}",
                parsed.preset_list.len()
            );
        };
        Ok(Self {
            file: file.to_path_buf(),
            name: entry.preset_name.clone(),
        })
    }
}

pub struct HandBrake {
    binary: PathBuf,
}

impl HandBrake {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    fn args(&self, preset: &Preset, input: &Path, output: &Path) -> Vec<OsString> {
        vec![
            "--preset-import-file".into(),
            preset.file.as_os_str().to_owned(),
            "-Z".into(),
            preset.name.clone().into(),
            "-i".into(),
            input.as_os_str().to_owned(),
            "-o".into(),
            output.as_os_str().to_owned(),
        ]
    }

    pub async fn transcode(&self, preset: &Preset, input: &Path, output: &Path) -> Result<()> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        info!(input = %input.display(), output = %output.display(), "Start transcode");
        run_tool(&self.binary, self.args(preset, input, output))
            .await
            .with_context(|| format!("Failed to transcode {input:?}"))?;
        info!(output = %output.display(), "Finished transcode");
        Ok(())
    }

    /// Shell line equivalent to [`HandBrake::transcode`], for batch scripts.
    pub fn command_line(&self, preset: &Preset, input: &Path, output: &Path) -> String {
        format!(
            "\"{}\" --preset-import-file \"{}\" -Z \"{}\" -i \"{}\" -o \"{}\"",
            self.binary.display(),
            preset.file.display(),
            preset.name,
            input.display(),
            output.display()
        )
    }
}

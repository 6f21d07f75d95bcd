use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::info;

use super::run_tool;
use crate::domain::models::RawTitle;

// makemkvcon robot-mode attribute ids
const ATTR_NAME: u32 = 2;
const ATTR_DURATION: u32 = 9;
const ATTR_SIZE_BYTES: u32 = 11;
const ATTR_OUTPUT_FILE: u32 = 27;

pub struct MakeMkv {
    binary: PathBuf,
}

impl MakeMkv {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Lists the titles on `device`. Title ids are prefixed with `prefix`
    /// so titles from several discs in one run stay distinct.
    pub async fn titles(&self, device: &str, prefix: &str) -> Result<Vec<RawTitle>> {
        let output = run_tool(&self.binary, ["-r", "info", &format!("dev:{device}")])
            .await
            .context("Failed to read disc titles")?;
        let titles = parse_info(&String::from_utf8_lossy(&output.stdout), prefix);
        info!(device, titles = titles.len(), "Read disc title list");
        Ok(titles)
    }

    /// Rips `title` into `dest_dir` and returns it pointing at the new file.
    pub async fn extract(&self, device: &str, title: &RawTitle, dest_dir: &Path) -> Result<RawTitle> {
        tokio::fs::create_dir_all(dest_dir).await?;
        info!(device, title = %title.id, "Extracting title");
        run_tool(
            &self.binary,
            [
                "-r".to_string(),
                "mkv".to_string(),
                format!("dev:{device}"),
                title.disc_index.to_string(),
                dest_dir.display().to_string(),
            ],
        )
        .await
        .with_context(|| format!("Failed to extract title {}", title.id))?;

        let Some(file_name) = title.source.file_name() else {
            bail!("Disc did not report an output file for title {}", title.id);
        };
        let source = dest_dir.join(file_name);
        if !source.exists() {
            bail!("Extraction of title {} produced no file at {source:?}", title.id);
        }

        Ok(RawTitle {
            source,
            ..title.clone()
        })
    }
}

fn tinfo_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^TINFO:(\d+),(\d+),\d+,"(.*)"$"#).expect("static pattern is valid")
    })
}

#[derive(Default)]
struct TitleInfo {
    name: Option<String>,
    duration: Option<Duration>,
    size_bytes: Option<u64>,
    output_file: Option<String>,
}

/// Parses `makemkvcon -r info` output. Titles are returned in disc order.
pub fn parse_info(output: &str, prefix: &str) -> Vec<RawTitle> {
    let mut titles: BTreeMap<u32, TitleInfo> = BTreeMap::new();

    for line in output.lines() {
        let Some(caps) = tinfo_pattern().captures(line.trim()) else {
            continue;
        };
        let (Ok(index), Ok(attr)) = (caps[1].parse::<u32>(), caps[2].parse::<u32>()) else {
            continue;
        };
        let value = caps[3].to_string();
        let info = titles.entry(index).or_default();
        match attr {
            ATTR_NAME => info.name = Some(value),
            ATTR_DURATION => info.duration = parse_hms(&value),
            ATTR_SIZE_BYTES => info.size_bytes = value.parse().ok(),
            ATTR_OUTPUT_FILE => info.output_file = Some(value),
            _ => {}
        }
    }

    titles
        .into_iter()
        .map(|(index, info)| {
            let output_file = info
                .output_file
                .unwrap_or_else(|| format!("title_t{index:02}.mkv"));
            RawTitle {
                id: format!("{prefix}t{index:02}"),
                name: info.name.unwrap_or_else(|| output_file.clone()),
                source: PathBuf::from(output_file),
                size_bytes: info.size_bytes.unwrap_or(0),
                duration: info.duration.unwrap_or_default(),
                disc_index: index,
            }
        })
        .collect()
}

fn parse_hms(value: &str) -> Option<Duration> {
    let mut parts = value.split(':').map(|p| p.parse::<u64>());
    let (h, m, s) = (parts.next()?.ok()?, parts.next()?.ok()?, parts.next()?.ok()?);
    if parts.next().is_some() {
        return None;
    }
    Some(Duration::from_secs(h * 3600 + m * 60 + s))
}

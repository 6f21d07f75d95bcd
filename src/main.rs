mod cli;
mod config;
mod domain;
mod media;
mod ocr;
mod workflows;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::Cli;
use config::ConfigFile;
use domain::episodes::{load_episode_list, CandidatePool};
use domain::models::{IdentificationOutcome, RawTitle, Resolution};
use media::ffmpeg::{probe_title, FfmpegSampler};
use media::handbrake::{HandBrake, Preset};
use media::makemkv::MakeMkv;
use ocr::video_intelligence::VideoIntelligenceRecognizer;
use workflows::claims::DuplicateClaimError;
use workflows::delivery::{Delivery, HqRouting};
use workflows::engine::{IdentificationEngine, RunReport, TitleOutcome};
use workflows::prompt::TerminalPrompt;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "episode_importer=debug,warn"
    } else {
        "episode_importer=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config_file = ConfigFile::load(&config::get_config_path())?;
    let config = Arc::new(config::resolve(&cli, &config_file, |key| std::env::var(key).ok())?);

    let episodes = load_episode_list(&cli.episodes)?;
    let pool = Arc::new(CandidatePool::new(episodes, config.subset.as_ref())?);
    if pool.is_empty() {
        bail!("Episode list {:?} has no episodes", cli.episodes);
    }
    info!(episodes = pool.len(), "Loaded episode list");

    let preset = cli.preset.as_deref().map(Preset::load).transpose()?;
    let hq = hq_routing(&cli)?;
    if cli.devices.is_empty() && cli.inputs.is_empty() {
        bail!("Nothing to do: pass MKV files or directories, or --device to rip a disc");
    }

    let clips = scratch_dir(cli.tempdir.as_deref(), "episode-importer-clips")?;
    let scratch = scratch_dir(None, "episode-importer")?;
    let rip_dir = cli
        .tempdir
        .clone()
        .unwrap_or_else(|| scratch.path().join("rips"));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received Ctrl+C, cancelling run");
                cancel.cancel();
            }
        }
    });

    let engine = IdentificationEngine::new(
        Arc::clone(&config),
        Arc::clone(&pool),
        Arc::new(FfmpegSampler::new(
            config.tools.ffmpeg.clone(),
            clips.path().to_path_buf(),
        )),
        Arc::new(VideoIntelligenceRecognizer::new(config.recognizer.clone())?),
        Arc::new(TerminalPrompt::new()),
        cancel,
    );

    let mut titles = Vec::new();
    if !cli.devices.is_empty() {
        titles.extend(rip_devices(&engine, &config.tools.makemkvcon, &cli.devices, &rip_dir).await?);
    }
    if !cli.inputs.is_empty() {
        let files = probe_inputs(&config.tools.ffprobe, &cli.inputs, cli.recursive).await?;
        titles.extend(engine.select(&files));
    }
    println!("Identifying {} title(s)", titles.len());

    let report = match engine.run(titles).await {
        Ok(report) => report,
        Err(aborted) => {
            print_summary(&aborted.finalized, &aborted.duplicates);
            if let Some(path) = &cli.report {
                write_report(
                    path,
                    &RunReport {
                        outcomes: aborted.finalized.clone(),
                        claims: aborted.claims.clone(),
                        duplicates: aborted.duplicates.clone(),
                    },
                )?;
            }
            return Err(aborted.into());
        }
    };

    print_summary(&report.outcomes, &report.duplicates);
    if let Some(path) = &cli.report {
        write_report(path, &report)?;
    }

    let delivery = Delivery {
        library: cli.library.clone(),
        show: cli.show.clone(),
        handbrake: HandBrake::new(config.tools.handbrake.clone()),
        preset,
        hq,
        title_only: cli.title_only,
    };
    let delivered = delivery.deliver(&report).await?;
    println!(
        "Delivered {} of {} title(s) to {}",
        delivered.len(),
        report.outcomes.len(),
        cli.library.display()
    );

    Ok(())
}

fn hq_routing(cli: &Cli) -> Result<Option<HqRouting>> {
    let Some(file) = cli.hq_preset.as_deref() else {
        if cli.hq_episodes.is_some() {
            bail!("--hq-episodes needs --hq-preset");
        }
        return Ok(None);
    };
    Ok(Some(HqRouting {
        preset: Preset::load(file)?,
        multipart: !cli.no_hq_multipart,
        episodes: cli.hq_episodes.clone(),
    }))
}

/// Temporary directory under `root`, or under the system temp dir.
fn scratch_dir(root: Option<&Path>, prefix: &str) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    match root {
        Some(root) => {
            fs::create_dir_all(root).with_context(|| format!("Failed to create {root:?}"))?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    }
    .with_context(|| format!("Failed to create {prefix} directory"))
}

/// Lists every disc, applies the extraction policy and rips what it keeps.
async fn rip_devices(
    engine: &IdentificationEngine,
    makemkvcon: &Path,
    devices: &[String],
    rip_dir: &Path,
) -> Result<Vec<RawTitle>> {
    let makemkv = MakeMkv::new(makemkvcon.to_path_buf());
    let mut titles = Vec::new();

    for (disc, device) in devices.iter().enumerate() {
        let listed = makemkv.titles(device, &format!("d{disc}")).await?;
        let dest = rip_dir.join(format!("disc{disc}"));
        for title in engine.select(&listed) {
            titles.push(makemkv.extract(device, &title, &dest).await?);
        }
    }

    Ok(titles)
}

async fn probe_inputs(ffprobe: &Path, inputs: &[PathBuf], recursive: bool) -> Result<Vec<RawTitle>> {
    let mut files = Vec::new();
    for input_path in inputs {
        if input_path.is_file() {
            files.push(input_path.clone());
        } else if input_path.is_dir() {
            files.extend(collect_mkv_files(input_path, recursive)?);
        } else {
            eprintln!("Error: Input path does not exist: {input_path:?}");
        }
    }
    println!("Found {} MKV file(s) to process", files.len());

    let mut titles: Vec<RawTitle> = Vec::new();
    for (index, path) in files.iter().enumerate() {
        match probe_title(ffprobe, path, u32::try_from(index)?).await {
            Ok(mut title) => {
                // Same file name in different directories
                if titles.iter().any(|t| t.id == title.id) {
                    title.id = format!("{}-{index}", title.id);
                }
                titles.push(title);
            }
            Err(e) => warn!(file = %path.display(), "Skipping file: {e:#}"),
        }
    }
    Ok(titles)
}

fn collect_mkv_files(dir_path: &Path, recurse: bool) -> Result<Vec<PathBuf>> {
    let mut mkv_files = Vec::new();
    collect_mkv_files_helper(dir_path, recurse, &mut mkv_files)?;
    mkv_files.sort();
    Ok(mkv_files)
}

fn collect_mkv_files_helper(
    dir_path: &Path,
    recurse: bool,
    mkv_files: &mut Vec<PathBuf>,
) -> Result<()> {
    let entries = fs::read_dir(dir_path)?;

    for entry in entries {
        let entry = entry?;
        let path = entry.path();

        if path.is_file() {
            if path.extension().and_then(|s| s.to_str()) == Some("mkv") {
                mkv_files.push(path);
            }
        } else if path.is_dir() && recurse {
            collect_mkv_files_helper(&path, recurse, mkv_files)?;
        }
    }

    Ok(())
}

fn print_summary(outcomes: &[TitleOutcome], duplicates: &[DuplicateClaimError]) {
    println!();
    println!("Identification results:");
    for outcome in outcomes {
        match &outcome.outcome {
            IdentificationOutcome::Resolved {
                episode,
                resolution: Resolution::Chunk { window, confidence },
            } => println!(
                "  {}: {episode} (on screen at {window}, confidence {confidence:.2})",
                outcome.title.id
            ),
            IdentificationOutcome::Resolved { episode, .. } => {
                println!("  {}: {episode} (entered manually)", outcome.title.id)
            }
            IdentificationOutcome::Abandoned => println!("  {}: skipped", outcome.title.id),
        }
    }
    for duplicate in duplicates {
        println!("Warning: {duplicate}");
    }
}

fn write_report(path: &Path, report: &impl Serialize) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    fs::write(path, json).with_context(|| format!("Failed to write report {path:?}"))?;
    info!(report = %path.display(), "Wrote run report");
    Ok(())
}

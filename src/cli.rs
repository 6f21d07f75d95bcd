use clap::Parser;
use std::path::PathBuf;

use crate::domain::episodes::{EpisodeSelector, Subset};
use crate::workflows::selector::SelectionPolicy;

#[derive(Parser, Debug)]
#[command(name = "episode-importer")]
#[command(about = "Rip TV discs and work out which title is which episode from on-screen text")]
pub struct Cli {
    /// Already ripped MKV files or directories to identify, instead of ripping a disc
    pub inputs: Vec<PathBuf>,

    /// Show name used for the library folder and file names
    #[arg(long)]
    pub show: String,

    /// Tab separated episode list with Season, Episode and Title columns
    #[arg(long)]
    pub episodes: PathBuf,

    /// Library root the identified episodes are delivered to
    #[arg(short = 'o', long = "library")]
    pub library: PathBuf,

    /// Disc drive to rip with makemkvcon (repeatable)
    #[arg(long = "device")]
    pub devices: Vec<String>,

    /// Which titles to identify: 1gb, size:<bytes>, count:<n>, median, name:<a>,<b> or all
    #[arg(long = "extraction-mode", default_value = "1gb")]
    pub extraction_mode: SelectionPolicy,

    /// Only consider episodes in this range, e.g. 1:1-1:8 or 2:*
    #[arg(long)]
    pub subset: Option<Subset>,

    /// Minimum match confidence between 0 and 1 to accept a sampled window
    #[arg(long)]
    pub confidence: Option<f64>,

    /// Titles identified concurrently
    #[arg(long)]
    pub workers: Option<usize>,

    /// HandBrake preset export (JSON with a single preset) used to transcode
    #[arg(long)]
    pub preset: Option<PathBuf>,

    /// Higher quality preset export for multipart episodes and --hq-episodes
    #[arg(long)]
    pub hq_preset: Option<PathBuf>,

    /// Episodes to transcode with the HQ preset, e.g. 1:3,4,2:*
    #[arg(long)]
    pub hq_episodes: Option<EpisodeSelector>,

    /// Do not route "Part <n>" episodes to the HQ preset
    #[arg(long)]
    pub no_hq_multipart: bool,

    /// Copy the raw titles into the library and write the transcode commands to a script
    #[arg(long)]
    pub title_only: bool,

    /// Cloud Storage bucket (optionally with a prefix) used to stage clips
    #[arg(long)]
    pub gcs_bucket: Option<String>,

    /// Google Cloud project billed for text detection
    #[arg(long)]
    pub project: Option<String>,

    /// Directory for ripped titles and sampled clips instead of the system temp dir
    #[arg(long)]
    pub tempdir: Option<PathBuf>,

    /// Write the run report as JSON to this file
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Recursively scan input directories for MKV files
    #[arg(short = 'r', long = "recursive")]
    pub recursive: bool,

    #[arg(long)]
    pub ffmpeg: Option<PathBuf>,

    #[arg(long)]
    pub ffprobe: Option<PathBuf>,

    #[arg(long)]
    pub makemkvcon: Option<PathBuf>,

    #[arg(long = "handbrake")]
    pub handbrake: Option<PathBuf>,

    #[arg(short = 'v', long)]
    pub verbose: bool,
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// One title as reported by the disc (or probed from a ripped file).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RawTitle {
    pub id: String,
    /// Name reported by the disc, used by the name-list extraction policy
    pub name: String,
    pub source: PathBuf,
    pub size_bytes: u64,
    pub duration: Duration,
    pub disc_index: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct EpisodeCandidate {
    pub season: u64,
    pub episode: u64,
    pub title: String,
}

impl EpisodeCandidate {
    pub fn new(season: u64, episode: u64, title: impl Into<String>) -> Self {
        Self {
            season,
            episode,
            title: title.into(),
        }
    }

    pub fn key(&self) -> (u64, u64) {
        (self.season, self.episode)
    }
}

impl fmt::Display for EpisodeCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "S{:02}E{:02} - {}",
            self.season, self.episode, self.title
        )
    }
}

/// A two-minute sampling window, in whole minutes from the start of a title.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    pub start_minute: u32,
    pub end_minute: u32,
}

impl TimeWindow {
    pub const fn new(start_minute: u32, end_minute: u32) -> Self {
        Self {
            start_minute,
            end_minute,
        }
    }

    pub fn start(&self) -> Duration {
        Duration::from_secs(u64::from(self.start_minute) * 60)
    }

    pub fn length(&self) -> Duration {
        Duration::from_secs(u64::from(self.end_minute.saturating_sub(self.start_minute)) * 60)
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{} min", self.start_minute, self.end_minute)
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MatchResult {
    pub candidate: Option<EpisodeCandidate>,
    pub confidence: f64,
    pub window: TimeWindow,
}

impl MatchResult {
    pub fn none(window: TimeWindow) -> Self {
        Self {
            candidate: None,
            confidence: 0.0,
            window,
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Resolution {
    Chunk { window: TimeWindow, confidence: f64 },
    ManualEntry,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IdentificationOutcome {
    Resolved {
        episode: EpisodeCandidate,
        resolution: Resolution,
    },
    Abandoned,
}

impl IdentificationOutcome {
    pub fn episode(&self) -> Option<&EpisodeCandidate> {
        match self {
            IdentificationOutcome::Resolved { episode, .. } => Some(episode),
            IdentificationOutcome::Abandoned => None,
        }
    }
}

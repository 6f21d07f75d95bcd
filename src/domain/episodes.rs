use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

use super::models::EpisodeCandidate;

#[derive(Debug, Error)]
pub enum EpisodeListError {
    #[error("failed to read episode list {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("episode list line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("invalid subset '{0}'")]
    InvalidSubset(String),
    #[error("invalid episode selector '{0}'")]
    InvalidSelector(String),
}

/// The reference list of expected episodes, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpisodeList {
    episodes: Vec<EpisodeCandidate>,
}

impl EpisodeList {
    pub fn new(episodes: Vec<EpisodeCandidate>) -> Self {
        Self { episodes }
    }

    pub fn episodes(&self) -> &[EpisodeCandidate] {
        &self.episodes
    }

    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    pub fn find(&self, season: u64, episode: u64) -> Option<&EpisodeCandidate> {
        self.episodes
            .iter()
            .find(|ep| ep.season == season && ep.episode == episode)
    }

    fn position(&self, season: u64, episode: u64) -> Option<usize> {
        self.episodes
            .iter()
            .position(|ep| ep.season == season && ep.episode == episode)
    }

    /// Returns a new list restricted to `subset`. `self` is left untouched.
    pub fn restrict(&self, subset: &Subset) -> Result<EpisodeList, EpisodeListError> {
        let episodes = match subset {
            Subset::Range { from, to } => {
                let start = self
                    .position(from.0, from.1)
                    .ok_or_else(|| EpisodeListError::InvalidSubset(subset.to_string()))?;
                let end = self
                    .position(to.0, to.1)
                    .ok_or_else(|| EpisodeListError::InvalidSubset(subset.to_string()))?;
                if start > end {
                    return Err(EpisodeListError::InvalidSubset(subset.to_string()));
                }
                self.episodes[start..=end].to_vec()
            }
            Subset::Season(season) => {
                let episodes: Vec<_> = self
                    .episodes
                    .iter()
                    .filter(|ep| ep.season == *season)
                    .cloned()
                    .collect();
                if episodes.is_empty() {
                    return Err(EpisodeListError::InvalidSubset(subset.to_string()));
                }
                episodes
            }
        };
        Ok(EpisodeList { episodes })
    }
}

/// Restriction of the episode list, written `S:E-S:E`, `S:E` or `S:*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subset {
    Range { from: (u64, u64), to: (u64, u64) },
    Season(u64),
}

impl std::fmt::Display for Subset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subset::Range { from, to } if from == to => write!(f, "{}:{}", from.0, from.1),
            Subset::Range { from, to } => write!(f, "{}:{}-{}:{}", from.0, from.1, to.0, to.1),
            Subset::Season(season) => write!(f, "{season}:*"),
        }
    }
}

impl FromStr for Subset {
    type Err = EpisodeListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EpisodeListError::InvalidSubset(s.to_string());
        let s = s.trim();

        if let Some(season) = s.strip_suffix(":*") {
            return season.parse().map(Subset::Season).map_err(|_| invalid());
        }

        let parse_point = |point: &str| -> Result<(u64, u64), EpisodeListError> {
            let (season, episode) = point.trim().split_once(':').ok_or_else(invalid)?;
            Ok((
                season.parse().map_err(|_| invalid())?,
                episode.parse().map_err(|_| invalid())?,
            ))
        };

        match s.split_once('-') {
            Some((from, to)) => Ok(Subset::Range {
                from: parse_point(from)?,
                to: parse_point(to)?,
            }),
            None => {
                let point = parse_point(s)?;
                Ok(Subset::Range {
                    from: point,
                    to: point,
                })
            }
        }
    }
}

/// A list of episodes such as `1:3,4,2:1,3:*`. An episode without a season
/// belongs to the season named before it; `*` takes the whole season.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpisodeSelector {
    episodes: Vec<(u64, Option<u64>)>,
}

impl EpisodeSelector {
    pub fn contains(&self, episode: &EpisodeCandidate) -> bool {
        self.episodes.iter().any(|&(season, selected)| {
            season == episode.season && selected.map_or(true, |e| e == episode.episode)
        })
    }
}

impl FromStr for EpisodeSelector {
    type Err = EpisodeListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EpisodeListError::InvalidSelector(s.to_string());
        let mut episodes = Vec::new();
        let mut season = None;

        for item in s.split(',').map(str::trim) {
            let episode = match item.split_once(':') {
                Some((s, e)) => {
                    season = Some(s.trim().parse().map_err(|_| invalid())?);
                    e.trim()
                }
                None => item,
            };
            let season = season.ok_or_else(invalid)?;
            let episode = match episode {
                "*" => None,
                e => Some(e.parse().map_err(|_| invalid())?),
            };
            episodes.push((season, episode));
        }
        Ok(Self { episodes })
    }
}

/// Full candidate list plus the membership mask produced by an optional
/// subset. Matching scores candidates outside the subset as zero.
#[derive(Debug, Clone)]
pub struct CandidatePool {
    all: EpisodeList,
    allowed: Vec<bool>,
}

impl CandidatePool {
    pub fn new(all: EpisodeList, subset: Option<&Subset>) -> Result<Self, EpisodeListError> {
        let allowed = match subset {
            None => vec![true; all.len()],
            Some(subset) => {
                let restricted = all.restrict(subset)?;
                all.episodes()
                    .iter()
                    .map(|ep| restricted.episodes().contains(ep))
                    .collect()
            }
        };
        Ok(Self { all, allowed })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EpisodeCandidate, bool)> {
        self.all.episodes().iter().zip(self.allowed.iter().copied())
    }

    pub fn allowed(&self) -> impl Iterator<Item = &EpisodeCandidate> {
        self.iter().filter(|(_, allowed)| *allowed).map(|(ep, _)| ep)
    }

    pub fn find(&self, season: u64, episode: u64) -> Option<&EpisodeCandidate> {
        self.all.find(season, episode)
    }

    pub fn len(&self) -> usize {
        self.allowed().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn load_episode_list(path: &Path) -> Result<EpisodeList, EpisodeListError> {
    let content = fs::read_to_string(path).map_err(|source| EpisodeListError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_episode_list(&content)
}

/// Parses a tab separated list with `Season`, `Episode` and `Title` columns.
/// Rows missing any of the three values are skipped.
pub fn parse_episode_list(content: &str) -> Result<EpisodeList, EpisodeListError> {
    let mut lines = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let Some((_, header)) = lines.next() else {
        return Err(EpisodeListError::Parse {
            line: 1,
            message: "episode list is empty".to_string(),
        });
    };

    let columns: Vec<String> = header
        .split('\t')
        .map(|c| c.trim().to_lowercase())
        .collect();
    let column = |name: &str| {
        columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| EpisodeListError::Parse {
                line: 1,
                message: format!("missing '{name}' column"),
            })
    };
    let season_col = column("season")?;
    let episode_col = column("episode")?;
    let title_col = column("title")?;

    let mut episodes = Vec::new();
    for (idx, line) in lines {
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let field = |col: usize| fields.get(col).copied().unwrap_or("");
        let (season, episode, title) = (field(season_col), field(episode_col), field(title_col));
        if season.is_empty() || episode.is_empty() || title.is_empty() {
            continue;
        }

        let number = |value: &str, what: &str| {
            parse_number(value).ok_or_else(|| EpisodeListError::Parse {
                line: idx + 1,
                message: format!("{what} '{value}' is not a number"),
            })
        };
        episodes.push(EpisodeCandidate::new(
            number(season, "season")?,
            number(episode, "episode")?,
            title,
        ));
    }

    Ok(EpisodeList::new(episodes))
}

// Spreadsheet exports sometimes write integers as "3.0"
fn parse_number(value: &str) -> Option<u64> {
    value
        .parse::<u64>()
        .ok()
        .or_else(|| value.strip_suffix(".0").and_then(|v| v.parse().ok()))
}

fn sxxexx_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^s?(\d{1,2})\s*[e:x]\s*(\d{1,3})$").expect("static pattern is valid")
    })
}

/// Accepts `S01E02`, `s1e2`, `1x02` and `1:2`.
pub fn parse_sxxexx(input: &str) -> Option<(u64, u64)> {
    let caps = sxxexx_pattern().captures(input.trim())?;
    let season = caps.get(1)?.as_str().parse().ok()?;
    let episode = caps.get(2)?.as_str().parse().ok()?;
    Some((season, episode))
}

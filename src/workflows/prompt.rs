use async_trait::async_trait;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::domain::episodes::{parse_sxxexx, CandidatePool};
use crate::domain::models::{EpisodeCandidate, RawTitle};

/// Why a title ended up in front of the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptReason {
    PlanExhausted,
    DuplicateClaim,
}

impl fmt::Display for PromptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptReason::PlanExhausted => write!(f, "no sampled window matched with enough confidence"),
            PromptReason::DuplicateClaim => write!(f, "the matched episode was already claimed by another title"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualAnswer {
    Provided(EpisodeCandidate),
    Decline,
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("manual entry interrupted")]
    Interrupted,
    #[error("terminal error: {0}")]
    Terminal(#[from] ReadlineError),
    #[error("prompt task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Operator fallback for titles automated identification could not settle.
#[async_trait]
pub trait ManualEntry: Send + Sync {
    async fn prompt(
        &self,
        title: &RawTitle,
        reason: PromptReason,
        pool: &CandidatePool,
    ) -> Result<ManualAnswer, PromptError>;
}

/// Interactive prompt on the controlling terminal. One title is asked about
/// at a time; other pipelines keep running while a prompt waits.
#[derive(Debug, Default)]
pub struct TerminalPrompt {
    terminal: Mutex<()>,
}

impl TerminalPrompt {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ManualEntry for TerminalPrompt {
    async fn prompt(
        &self,
        title: &RawTitle,
        reason: PromptReason,
        pool: &CandidatePool,
    ) -> Result<ManualAnswer, PromptError> {
        let _terminal = self.terminal.lock().await;
        let title = title.clone();
        let pool = pool.clone();

        tokio::task::spawn_blocking(move || -> Result<ManualAnswer, PromptError> {
            let mut rl = DefaultEditor::new()?;
            ask(&title, reason, &pool, |prompt| match rl.readline(prompt) {
                Ok(line) => Ok(Some(line)),
                Err(ReadlineError::Eof) => Ok(None),
                Err(ReadlineError::Interrupted) => Err(PromptError::Interrupted),
                Err(e) => Err(PromptError::Terminal(e)),
            })
        })
        .await?
    }
}

#[derive(Debug, PartialEq)]
enum Entry {
    Decline,
    Known(EpisodeCandidate),
    Unlisted(u64, u64),
    Invalid,
}

fn parse_entry(line: &str, pool: &CandidatePool) -> Entry {
    let line = line.trim();
    if line.is_empty() {
        return Entry::Decline;
    }
    match parse_sxxexx(line) {
        Some((season, episode)) => match pool.find(season, episode) {
            Some(candidate) => Entry::Known(candidate.clone()),
            None => Entry::Unlisted(season, episode),
        },
        None => Entry::Invalid,
    }
}

/// Runs the question loop against `read_line`, which yields `None` at end
/// of input. End of input declines.
fn ask<F>(
    title: &RawTitle,
    reason: PromptReason,
    pool: &CandidatePool,
    mut read_line: F,
) -> Result<ManualAnswer, PromptError>
where
    F: FnMut(&str) -> Result<Option<String>, PromptError>,
{
    println!();
    println!(
        "Could not identify title {} ({}, {} min): {reason}.",
        title.id,
        title.source.display(),
        title.duration.as_secs() / 60
    );

    loop {
        let Some(line) = read_line("Episode as SxxEyy (blank to skip this title): ")? else {
            return Ok(ManualAnswer::Decline);
        };
        match parse_entry(&line, pool) {
            Entry::Decline => {
                println!("Skipping title {}.", title.id);
                return Ok(ManualAnswer::Decline);
            }
            Entry::Known(candidate) => {
                println!("Using {candidate}.");
                return Ok(ManualAnswer::Provided(candidate));
            }
            Entry::Unlisted(season, episode) => {
                println!("S{season:02}E{episode:02} is not in the episode list.");
                let Some(name) = read_line("Episode title: ")? else {
                    return Ok(ManualAnswer::Decline);
                };
                let name = name.trim();
                if name.is_empty() {
                    println!("A title is required for unlisted episodes.");
                    continue;
                }
                return Ok(ManualAnswer::Provided(EpisodeCandidate::new(
                    season, episode, name,
                )));
            }
            Entry::Invalid => println!("Please enter an episode like S01E02 or 1x02."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::episodes::EpisodeList;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::time::Duration;

    fn pool() -> CandidatePool {
        CandidatePool::new(
            EpisodeList::new(vec![
                EpisodeCandidate::new(1, 1, "Pilot"),
                EpisodeCandidate::new(1, 2, "Second"),
            ]),
            None,
        )
        .unwrap()
    }

    fn title() -> RawTitle {
        RawTitle {
            id: "t03".to_string(),
            name: "title_t03.mkv".to_string(),
            source: PathBuf::from("/rips/title_t03.mkv"),
            size_bytes: 2 << 30,
            duration: Duration::from_secs(42 * 60),
            disc_index: 3,
        }
    }

    fn scripted(lines: &[&str]) -> Result<ManualAnswer, PromptError> {
        let mut lines: VecDeque<String> = lines.iter().map(|l| l.to_string()).collect();
        ask(&title(), PromptReason::PlanExhausted, &pool(), |_| {
            Ok(lines.pop_front())
        })
    }

    #[test]
    fn test_parse_entry() {
        let pool = pool();
        assert_eq!(parse_entry("  ", &pool), Entry::Decline);
        assert_eq!(
            parse_entry("s01e02", &pool),
            Entry::Known(EpisodeCandidate::new(1, 2, "Second"))
        );
        assert_eq!(parse_entry("3x04", &pool), Entry::Unlisted(3, 4));
        assert_eq!(parse_entry("episode two", &pool), Entry::Invalid);
    }

    #[test]
    fn test_known_episode() {
        let answer = scripted(&["S01E01"]).unwrap();
        assert_eq!(answer, ManualAnswer::Provided(EpisodeCandidate::new(1, 1, "Pilot")));
    }

    #[test]
    fn test_invalid_input_reprompts() {
        let answer = scripted(&["what", "1x2"]).unwrap();
        assert_eq!(answer, ManualAnswer::Provided(EpisodeCandidate::new(1, 2, "Second")));
    }

    #[test]
    fn test_unlisted_episode_asks_for_title() {
        let answer = scripted(&["S02E05", "", "S02E05", "The Reunion"]).unwrap();
        assert_eq!(
            answer,
            ManualAnswer::Provided(EpisodeCandidate::new(2, 5, "The Reunion"))
        );
    }

    #[test]
    fn test_decline() {
        assert_eq!(scripted(&[""]).unwrap(), ManualAnswer::Decline);
        assert_eq!(scripted(&[]).unwrap(), ManualAnswer::Decline);
    }

    #[test]
    fn test_interrupt_propagates() {
        let result = ask(&title(), PromptReason::DuplicateClaim, &pool(), |_| {
            Err(PromptError::Interrupted)
        });
        assert!(matches!(result, Err(PromptError::Interrupted)));
    }
}

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::domain::models::EpisodeCandidate;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{episode} was identified in title {first_title} and again in title {second_title}")]
pub struct DuplicateClaimError {
    pub episode: EpisodeCandidate,
    pub first_title: String,
    pub second_title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claim {
    pub episode: EpisodeCandidate,
    pub title_id: String,
}

#[derive(Debug, Default)]
struct ClaimLog {
    entries: Vec<Claim>,
    owners: HashMap<(u64, u64), String>,
    duplicates: Vec<DuplicateClaimError>,
}

/// Append-only record of which title claimed which episode. Shared by all
/// title pipelines of a run.
#[derive(Debug, Default)]
pub struct ClaimRegistry {
    log: Mutex<ClaimLog>,
}

impl ClaimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClaimLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `title_id` as the owner of `episode`. Fails, and records the
    /// anomaly, when another title already owns it. Re-claiming by the same
    /// title is a no-op.
    pub fn claim(&self, title_id: &str, episode: &EpisodeCandidate) -> Result<(), DuplicateClaimError> {
        let mut log = self.lock();
        match log.owners.get(&episode.key()) {
            Some(owner) if owner == title_id => Ok(()),
            Some(owner) => {
                let duplicate = DuplicateClaimError {
                    episode: episode.clone(),
                    first_title: owner.clone(),
                    second_title: title_id.to_string(),
                };
                log.duplicates.push(duplicate.clone());
                Err(duplicate)
            }
            None => {
                log.owners.insert(episode.key(), title_id.to_string());
                log.entries.push(Claim {
                    episode: episode.clone(),
                    title_id: title_id.to_string(),
                });
                Ok(())
            }
        }
    }

    /// Records the claim even if the episode is already owned, returning the
    /// anomaly for reporting. Used for operator answers, which are final.
    pub fn force_claim(&self, title_id: &str, episode: &EpisodeCandidate) -> Option<DuplicateClaimError> {
        let mut log = self.lock();
        let duplicate = match log.owners.get(&episode.key()) {
            Some(owner) if owner != title_id => Some(DuplicateClaimError {
                episode: episode.clone(),
                first_title: owner.clone(),
                second_title: title_id.to_string(),
            }),
            _ => None,
        };
        if let Some(duplicate) = &duplicate {
            log.duplicates.push(duplicate.clone());
        } else {
            log.owners.insert(episode.key(), title_id.to_string());
        }
        log.entries.push(Claim {
            episode: episode.clone(),
            title_id: title_id.to_string(),
        });
        duplicate
    }

    pub fn entries(&self) -> Vec<Claim> {
        self.lock().entries.clone()
    }

    pub fn duplicates(&self) -> Vec<DuplicateClaimError> {
        self.lock().duplicates.clone()
    }
}

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::domain::episodes::CandidatePool;
use crate::domain::models::{IdentificationOutcome, RawTitle};
use crate::media::{FrameSampler, SamplerError};
use crate::ocr::{RecognizerError, TextRecognizer};
use crate::workflows::claims::{Claim, ClaimRegistry, DuplicateClaimError};
use crate::workflows::identify::{AttemptRecord, Pipeline, TitleIdentification};
use crate::workflows::matcher::TextMatcher;
use crate::workflows::prompt::{ManualEntry, PromptError};
use crate::workflows::selector::select_titles;

/// Failures that end a run. Anything recoverable is handled per window.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("frame sampling failed: {0}")]
    Sampler(#[source] SamplerError),
    #[error(transparent)]
    Recognizer(RecognizerError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("run cancelled")]
    Cancelled,
    #[error("title worker failed: {0}")]
    Worker(#[from] JoinError),
}

#[derive(Debug, Clone, Serialize)]
pub struct TitleOutcome {
    pub title: RawTitle,
    pub outcome: IdentificationOutcome,
    pub attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// One entry per processed title, in disc order
    pub outcomes: Vec<TitleOutcome>,
    /// Every claim in the order it was recorded
    pub claims: Vec<Claim>,
    pub duplicates: Vec<DuplicateClaimError>,
}

impl RunReport {
    pub fn resolved(&self) -> impl Iterator<Item = &TitleOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, IdentificationOutcome::Resolved { .. }))
    }

    pub fn abandoned(&self) -> impl Iterator<Item = &TitleOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.outcome == IdentificationOutcome::Abandoned)
    }
}

#[derive(Debug, Error)]
#[error("run aborted: {reason}")]
pub struct RunAborted {
    pub reason: EngineError,
    /// Titles that reached a final outcome before the abort
    pub finalized: Vec<TitleOutcome>,
    pub claims: Vec<Claim>,
    pub duplicates: Vec<DuplicateClaimError>,
}

pub struct IdentificationEngine {
    pipeline: Arc<Pipeline>,
}

impl IdentificationEngine {
    pub fn new(
        config: Arc<EngineConfig>,
        pool: Arc<CandidatePool>,
        sampler: Arc<dyn FrameSampler>,
        recognizer: Arc<dyn TextRecognizer>,
        prompt: Arc<dyn ManualEntry>,
        cancel: CancellationToken,
    ) -> Self {
        let matcher = TextMatcher::new(config.weights.clone());
        let workers = config.workers.max(1);
        Self {
            pipeline: Arc::new(Pipeline {
                config,
                sampler,
                recognizer,
                matcher,
                pool,
                claims: Arc::new(ClaimRegistry::new()),
                prompt,
                cancel,
                workers: Semaphore::new(workers),
            }),
        }
    }

    /// Titles the configured extraction policy carries forward.
    pub fn select(&self, titles: &[RawTitle]) -> Vec<RawTitle> {
        let selected = select_titles(titles, &self.pipeline.config.selection);
        info!(
            available = titles.len(),
            selected = selected.len(),
            policy = ?self.pipeline.config.selection,
            "Selected titles"
        );
        selected
    }

    /// Identifies every title concurrently. At most `workers` titles sample
    /// or recognize at once; titles waiting on the operator do not count.
    /// The first fatal error cancels the remaining pipelines.
    pub async fn run(&self, titles: Vec<RawTitle>) -> Result<RunReport, RunAborted> {
        let cancel = self.pipeline.cancel.clone();
        let mut set = JoinSet::new();

        for title in titles {
            let pipeline = Arc::clone(&self.pipeline);
            set.spawn(async move {
                let mut identification = TitleIdentification::new(title);
                let result = identification.identify(&pipeline).await;
                if matches!(&result, Err(e) if !matches!(e, EngineError::Cancelled)) {
                    pipeline.cancel.cancel();
                }
                (identification, result)
            });
        }

        let mut outcomes = Vec::new();
        let mut failure: Option<EngineError> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((identification, Ok(outcome))) => outcomes.push(TitleOutcome {
                    title: identification.title().clone(),
                    outcome,
                    attempts: identification.attempts().to_vec(),
                }),
                Ok((identification, Err(EngineError::Cancelled))) => {
                    debug!(title = %identification.title().id, "Title cancelled");
                }
                Ok((identification, Err(e))) => {
                    error!(title = %identification.title().id, "{e}");
                    if failure.is_none() {
                        failure = Some(e);
                        cancel.cancel();
                    }
                }
                Err(e) => {
                    error!("Title worker failed: {e}");
                    if failure.is_none() {
                        failure = Some(EngineError::Worker(e));
                        cancel.cancel();
                    }
                }
            }
        }

        outcomes.sort_by_key(|o| o.title.disc_index);
        let claims = self.pipeline.claims.entries();
        let duplicates = self.pipeline.claims.duplicates();

        match failure {
            Some(reason) => Err(RunAborted {
                reason,
                finalized: outcomes,
                claims,
                duplicates,
            }),
            None if cancel.is_cancelled() => Err(RunAborted {
                reason: EngineError::Cancelled,
                finalized: outcomes,
                claims,
                duplicates,
            }),
            None => Ok(RunReport {
                outcomes,
                claims,
                duplicates,
            }),
        }
    }
}

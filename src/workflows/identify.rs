use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::domain::episodes::CandidatePool;
use crate::domain::models::{
    EpisodeCandidate, IdentificationOutcome, MatchResult, RawTitle, Resolution, TimeWindow,
};
use crate::media::{FrameSampler, SamplerError};
use crate::ocr::{RecognizedText, RecognizerError, TextRecognizer};
use crate::workflows::claims::ClaimRegistry;
use crate::workflows::engine::EngineError;
use crate::workflows::matcher::TextMatcher;
use crate::workflows::planner::plan_chunks;
use crate::workflows::prompt::{ManualAnswer, ManualEntry, PromptReason};
use crate::workflows::retry::{retry, RetryError, Retryable};

/// Where a title is in its identification.
#[derive(Debug, Clone, PartialEq)]
pub enum TitleState {
    Pending,
    /// Sampling the plan window at `step`
    Attempting { step: usize },
    /// A window matched; waiting to record the claim
    Claiming {
        episode: EpisodeCandidate,
        window: TimeWindow,
        confidence: f64,
    },
    ManualPrompt { reason: PromptReason },
    Resolved {
        episode: EpisodeCandidate,
        resolution: Resolution,
    },
    Abandoned,
}

impl TitleState {
    pub fn outcome(&self) -> Option<IdentificationOutcome> {
        match self {
            TitleState::Resolved {
                episode,
                resolution,
            } => Some(IdentificationOutcome::Resolved {
                episode: episode.clone(),
                resolution: resolution.clone(),
            }),
            TitleState::Abandoned => Some(IdentificationOutcome::Abandoned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Begin,
    /// Result for the current window; failed windows arrive as a result
    /// without a candidate
    Attempted(MatchResult),
    Claimed,
    ClaimConflict,
    Answered(ManualAnswer),
}

/// The single transition function of the per-title state machine. Events
/// that do not apply to `state` leave it unchanged; terminal states never
/// change.
pub fn transition(state: TitleState, event: Event, plan_len: usize, threshold: f64) -> TitleState {
    match (state, event) {
        (TitleState::Pending, Event::Begin) if plan_len == 0 => TitleState::ManualPrompt {
            reason: PromptReason::PlanExhausted,
        },
        (TitleState::Pending, Event::Begin) => TitleState::Attempting { step: 0 },

        (TitleState::Attempting { step }, Event::Attempted(result)) => match result.candidate {
            Some(episode) if result.confidence >= threshold => TitleState::Claiming {
                episode,
                window: result.window,
                confidence: result.confidence,
            },
            _ if step + 1 < plan_len => TitleState::Attempting { step: step + 1 },
            _ => TitleState::ManualPrompt {
                reason: PromptReason::PlanExhausted,
            },
        },

        (
            TitleState::Claiming {
                episode,
                window,
                confidence,
            },
            Event::Claimed,
        ) => TitleState::Resolved {
            episode,
            resolution: Resolution::Chunk { window, confidence },
        },
        (TitleState::Claiming { .. }, Event::ClaimConflict) => TitleState::ManualPrompt {
            reason: PromptReason::DuplicateClaim,
        },

        (TitleState::ManualPrompt { .. }, Event::Answered(ManualAnswer::Provided(episode))) => {
            TitleState::Resolved {
                episode,
                resolution: Resolution::ManualEntry,
            }
        }
        (TitleState::ManualPrompt { .. }, Event::Answered(ManualAnswer::Decline)) => {
            TitleState::Abandoned
        }

        (state, event) => {
            debug!(?state, ?event, "Ignoring event");
            state
        }
    }
}

/// One sampled window of a title, as recorded in the run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub window: TimeWindow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<EpisodeCandidate>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Collaborators and run-wide state shared by every title pipeline.
pub struct Pipeline {
    pub config: Arc<EngineConfig>,
    pub sampler: Arc<dyn FrameSampler>,
    pub recognizer: Arc<dyn TextRecognizer>,
    pub matcher: TextMatcher,
    pub pool: Arc<CandidatePool>,
    pub claims: Arc<ClaimRegistry>,
    pub prompt: Arc<dyn ManualEntry>,
    pub cancel: CancellationToken,
    /// Permits for sampling and recognition. Titles waiting on the operator
    /// hold none.
    pub workers: Semaphore,
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Sampler(#[from] SamplerError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
}

impl Retryable for AttemptError {
    fn is_transient(&self) -> bool {
        match self {
            AttemptError::Sampler(e) => e.is_transient(),
            AttemptError::Recognizer(e) => e.is_transient(),
        }
    }
}

impl From<AttemptError> for EngineError {
    fn from(e: AttemptError) -> Self {
        match e {
            AttemptError::Recognizer(RecognizerError::Cancelled) => EngineError::Cancelled,
            AttemptError::Sampler(e) => EngineError::Sampler(e),
            AttemptError::Recognizer(e) => EngineError::Recognizer(e),
        }
    }
}

/// The clip lives only inside this call, so it is gone before the next
/// window is sampled whether or not recognition succeeded.
async fn sample_and_recognize(
    pipeline: &Pipeline,
    title: &RawTitle,
    window: TimeWindow,
) -> Result<RecognizedText, AttemptError> {
    let clip = pipeline.sampler.sample(title, window).await?;
    let text = pipeline.recognizer.recognize(&clip, &pipeline.cancel).await?;
    debug!(title = %title.id, window = %window, spans = text.spans.len(), "Recognized clip");
    Ok(text)
}

/// Identification of a single title, driven through [`transition`].
#[derive(Debug, Clone)]
pub struct TitleIdentification {
    title: RawTitle,
    plan: Vec<TimeWindow>,
    state: TitleState,
    attempts: Vec<AttemptRecord>,
}

impl TitleIdentification {
    pub fn new(title: RawTitle) -> Self {
        let plan = plan_chunks(title.duration);
        Self {
            title,
            plan,
            state: TitleState::Pending,
            attempts: Vec::new(),
        }
    }

    pub fn title(&self) -> &RawTitle {
        &self.title
    }

    pub fn state(&self) -> &TitleState {
        &self.state
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    /// Drives the title to a terminal state. Calling it again afterwards
    /// returns the same outcome without touching any collaborator.
    pub async fn identify(&mut self, pipeline: &Pipeline) -> Result<IdentificationOutcome, EngineError> {
        loop {
            if let Some(outcome) = self.state.outcome() {
                return Ok(outcome);
            }
            if pipeline.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let event = match self.state.clone() {
                TitleState::Pending => {
                    if self.plan.is_empty() {
                        info!(title = %self.title.id, duration = ?self.title.duration, "Title too short to sample");
                    }
                    Event::Begin
                }
                TitleState::Attempting { step } => {
                    Event::Attempted(self.attempt(pipeline, self.plan[step]).await?)
                }
                TitleState::Claiming { episode, .. } => {
                    match pipeline.claims.claim(&self.title.id, &episode) {
                        Ok(()) => Event::Claimed,
                        Err(duplicate) => {
                            warn!(title = %self.title.id, "{duplicate}");
                            Event::ClaimConflict
                        }
                    }
                }
                TitleState::ManualPrompt { reason } => {
                    let answer = tokio::select! {
                        biased;
                        _ = pipeline.cancel.cancelled() => return Err(EngineError::Cancelled),
                        answer = pipeline.prompt.prompt(&self.title, reason, &pipeline.pool) => answer?,
                    };
                    if let ManualAnswer::Provided(episode) = &answer {
                        if let Some(duplicate) = pipeline.claims.force_claim(&self.title.id, episode) {
                            warn!(title = %self.title.id, "{duplicate}");
                        }
                    }
                    Event::Answered(answer)
                }
                TitleState::Resolved { .. } | TitleState::Abandoned => continue,
            };

            self.state = transition(
                std::mem::replace(&mut self.state, TitleState::Pending),
                event,
                self.plan.len(),
                pipeline.config.confidence_threshold,
            );
            match &self.state {
                TitleState::Resolved {
                    episode,
                    resolution,
                } => info!(title = %self.title.id, episode = %episode, ?resolution, "Identified title"),
                TitleState::Abandoned => info!(title = %self.title.id, "Title abandoned"),
                state => debug!(title = %self.title.id, ?state, "Advanced"),
            }
        }
    }

    /// Samples and matches one window under a worker permit. Windows whose
    /// retries run out count as a non-match; persistent failures and
    /// cancellation end the title.
    async fn attempt(&mut self, pipeline: &Pipeline, window: TimeWindow) -> Result<MatchResult, EngineError> {
        let _permit = tokio::select! {
            biased;
            _ = pipeline.cancel.cancelled() => return Err(EngineError::Cancelled),
            permit = pipeline.workers.acquire() => permit.map_err(|_| EngineError::Cancelled)?,
        };
        let title = &self.title;
        let label = format!("{} {window}", title.id);
        let result = retry(&pipeline.config.retry, &pipeline.cancel, &label, || {
            sample_and_recognize(pipeline, title, window)
        })
        .await;

        match result {
            Ok(text) => {
                let result = pipeline.matcher.match_text(&text, &pipeline.pool, window);
                debug!(
                    title = %title.id,
                    window = %window,
                    candidate = ?result.candidate.as_ref().map(|c| c.to_string()),
                    confidence = result.confidence,
                    "Matched window"
                );
                self.attempts.push(AttemptRecord {
                    window,
                    candidate: result.candidate.clone(),
                    confidence: result.confidence,
                    error: None,
                });
                Ok(result)
            }
            Err(RetryError::Exhausted(e)) => {
                warn!(title = %title.id, window = %window, "Treating window as no match: {e}");
                self.attempts.push(AttemptRecord {
                    window,
                    candidate: None,
                    confidence: 0.0,
                    error: Some(e.to_string()),
                });
                Ok(MatchResult::none(window))
            }
            Err(RetryError::Persistent(e)) => {
                let e = EngineError::from(e);
                // Stop the other titles before this permit frees up
                if !matches!(e, EngineError::Cancelled) {
                    pipeline.cancel.cancel();
                }
                Err(e)
            }
            Err(RetryError::Cancelled) => Err(EngineError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::testing::{self, Behavior, FakePrompt, FakeRecognizer, FakeSampler};
    use std::time::Duration;
    use tempfile::TempDir;

    const PLAN: usize = 5;

    fn hit(window: TimeWindow, confidence: f64) -> Event {
        Event::Attempted(MatchResult {
            candidate: Some(EpisodeCandidate::new(1, 1, "Pilot")),
            confidence,
            window,
        })
    }

    fn miss(window: TimeWindow) -> Event {
        Event::Attempted(MatchResult::none(window))
    }

    #[test]
    fn test_transition_match_then_claim() {
        let window = TimeWindow::new(4, 6);
        let state = transition(TitleState::Pending, Event::Begin, PLAN, 0.6);
        assert_eq!(state, TitleState::Attempting { step: 0 });

        let state = transition(state, hit(window, 0.8), PLAN, 0.6);
        assert!(matches!(state, TitleState::Claiming { .. }));

        let state = transition(state, Event::Claimed, PLAN, 0.6);
        assert_eq!(
            state,
            TitleState::Resolved {
                episode: EpisodeCandidate::new(1, 1, "Pilot"),
                resolution: Resolution::Chunk {
                    window,
                    confidence: 0.8
                },
            }
        );
    }

    #[test]
    fn test_transition_below_threshold_advances() {
        let window = TimeWindow::new(4, 6);
        let state = transition(TitleState::Attempting { step: 0 }, hit(window, 0.59), PLAN, 0.6);
        assert_eq!(state, TitleState::Attempting { step: 1 });

        // exactly at the threshold is accepted
        let state = transition(state, hit(window, 0.6), PLAN, 0.6);
        assert!(matches!(state, TitleState::Claiming { .. }));
    }

    #[test]
    fn test_transition_plan_exhausted() {
        let last = TimeWindow::new(8, 10);
        let state = transition(TitleState::Attempting { step: PLAN - 1 }, miss(last), PLAN, 0.6);
        assert_eq!(
            state,
            TitleState::ManualPrompt {
                reason: PromptReason::PlanExhausted
            }
        );

        let empty_plan = transition(TitleState::Pending, Event::Begin, 0, 0.6);
        assert_eq!(
            empty_plan,
            TitleState::ManualPrompt {
                reason: PromptReason::PlanExhausted
            }
        );
    }

    #[test]
    fn test_transition_claim_conflict_and_answers() {
        let claiming = TitleState::Claiming {
            episode: EpisodeCandidate::new(1, 1, "Pilot"),
            window: TimeWindow::new(4, 6),
            confidence: 0.9,
        };
        let prompt = transition(claiming, Event::ClaimConflict, PLAN, 0.6);
        assert_eq!(
            prompt,
            TitleState::ManualPrompt {
                reason: PromptReason::DuplicateClaim
            }
        );

        let declined = transition(prompt.clone(), Event::Answered(ManualAnswer::Decline), PLAN, 0.6);
        assert_eq!(declined, TitleState::Abandoned);

        let episode = EpisodeCandidate::new(1, 2, "Second Chances");
        let answered = transition(
            prompt,
            Event::Answered(ManualAnswer::Provided(episode.clone())),
            PLAN,
            0.6,
        );
        assert_eq!(
            answered,
            TitleState::Resolved {
                episode,
                resolution: Resolution::ManualEntry
            }
        );
    }

    #[test]
    fn test_terminal_states_ignore_events() {
        let resolved = TitleState::Resolved {
            episode: EpisodeCandidate::new(1, 1, "Pilot"),
            resolution: Resolution::ManualEntry,
        };
        for event in [
            Event::Begin,
            hit(TimeWindow::new(4, 6), 1.0),
            Event::Claimed,
            Event::ClaimConflict,
            Event::Answered(ManualAnswer::Decline),
        ] {
            assert_eq!(transition(resolved.clone(), event.clone(), PLAN, 0.6), resolved);
            assert_eq!(
                transition(TitleState::Abandoned, event, PLAN, 0.6),
                TitleState::Abandoned
            );
        }
    }

    fn pipeline(
        sampler: Arc<FakeSampler>,
        recognizer: Arc<FakeRecognizer>,
        prompt: Arc<FakePrompt>,
    ) -> Pipeline {
        let config = testing::config(0.6, 1);
        Pipeline {
            matcher: TextMatcher::new(config.weights.clone()),
            config,
            sampler,
            recognizer,
            pool: testing::pool(),
            claims: Arc::new(ClaimRegistry::new()),
            prompt,
            cancel: CancellationToken::new(),
            workers: Semaphore::new(1),
        }
    }

    #[tokio::test]
    async fn test_identify_is_idempotent_once_resolved() {
        let temp_dir = TempDir::new().unwrap();
        let sampler = Arc::new(FakeSampler::new(temp_dir.path()));
        let recognizer = Arc::new(
            FakeRecognizer::new().on("t00", 4, Behavior::Text(vec!["S01E01", "Pilot"])),
        );
        let pipeline = pipeline(sampler.clone(), recognizer.clone(), Arc::new(FakePrompt::new()));

        let mut identification = TitleIdentification::new(testing::title(0));
        let first = identification.identify(&pipeline).await.unwrap();
        assert_eq!(first.episode(), Some(&EpisodeCandidate::new(1, 1, "Pilot")));
        assert_eq!(sampler.calls(), 1);
        assert_eq!(recognizer.calls(), 1);

        let again = identification.identify(&pipeline).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(sampler.calls(), 1);
        assert_eq!(recognizer.calls(), 1);
        assert_eq!(testing::clip_files(temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_short_title_goes_straight_to_prompt() {
        let temp_dir = TempDir::new().unwrap();
        let sampler = Arc::new(FakeSampler::new(temp_dir.path()));
        let prompt = Arc::new(FakePrompt::new().answer(
            "t00",
            ManualAnswer::Provided(EpisodeCandidate::new(1, 5, "Finale")),
        ));
        let pipeline = pipeline(sampler.clone(), Arc::new(FakeRecognizer::new()), prompt.clone());

        let mut short = testing::title(0);
        short.duration = Duration::from_secs(90);
        let mut identification = TitleIdentification::new(short);
        let outcome = identification.identify(&pipeline).await.unwrap();

        assert_eq!(
            outcome,
            IdentificationOutcome::Resolved {
                episode: EpisodeCandidate::new(1, 5, "Finale"),
                resolution: Resolution::ManualEntry,
            }
        );
        assert_eq!(sampler.calls(), 0);
        assert_eq!(prompt.asked(), vec![("t00".to_string(), PromptReason::PlanExhausted)]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_count_as_no_match() {
        let temp_dir = TempDir::new().unwrap();
        let sampler = Arc::new(FakeSampler::new(temp_dir.path()));
        let recognizer = Arc::new(
            FakeRecognizer::with_default(Behavior::Transient)
                .on("t00", 8, Behavior::Text(vec!["S01E01 Pilot"])),
        );
        let pipeline = pipeline(sampler.clone(), recognizer.clone(), Arc::new(FakePrompt::new()));

        let mut identification = TitleIdentification::new(testing::title(0));
        let outcome = identification.identify(&pipeline).await.unwrap();

        assert_eq!(
            outcome,
            IdentificationOutcome::Resolved {
                episode: EpisodeCandidate::new(1, 1, "Pilot"),
                resolution: Resolution::Chunk {
                    window: TimeWindow::new(8, 10),
                    confidence: identification.attempts()[4].confidence,
                },
            }
        );
        // four windows with three tries each, then one clean call
        assert_eq!(recognizer.calls(), 13);
        assert_eq!(sampler.calls(), 13);
        assert_eq!(identification.attempts().len(), 5);
        assert!(identification.attempts()[..4].iter().all(|a| a.error.is_some()));
        assert_eq!(testing::clip_files(temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_persistent_failure_ends_title() {
        let temp_dir = TempDir::new().unwrap();
        let sampler = Arc::new(FakeSampler::missing_binary(temp_dir.path()));
        let prompt = Arc::new(FakePrompt::new());
        let pipeline = pipeline(sampler.clone(), Arc::new(FakeRecognizer::new()), prompt.clone());

        let mut identification = TitleIdentification::new(testing::title(0));
        let result = identification.identify(&pipeline).await;

        assert!(matches!(result, Err(EngineError::Sampler(_))));
        assert_eq!(sampler.calls(), 1);
        assert!(prompt.asked().is_empty());
        assert_eq!(identification.state(), &TitleState::Attempting { step: 0 });
        assert!(pipeline.cancel.is_cancelled());
        assert_eq!(pipeline.workers.available_permits(), 1);
    }
}

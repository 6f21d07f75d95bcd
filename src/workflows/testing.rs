//! In-memory collaborators for pipeline tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::domain::episodes::{CandidatePool, EpisodeList};
use crate::domain::models::{EpisodeCandidate, RawTitle, TimeWindow};
use crate::media::{Clip, FrameSampler, SamplerError, ToolError};
use crate::ocr::{RecognizedText, RecognizerError, TextRecognizer};
use crate::workflows::prompt::{ManualAnswer, ManualEntry, PromptError, PromptReason};
use crate::workflows::retry::RetryPolicy;

pub fn title(index: u32) -> RawTitle {
    RawTitle {
        id: format!("t{index:02}"),
        name: format!("title_t{index:02}.mkv"),
        source: PathBuf::from(format!("/rips/title_t{index:02}.mkv")),
        size_bytes: 2 << 30,
        duration: Duration::from_secs(44 * 60),
        disc_index: index,
    }
}

pub fn episodes() -> Vec<EpisodeCandidate> {
    vec![
        EpisodeCandidate::new(1, 1, "Pilot"),
        EpisodeCandidate::new(1, 2, "Second Chances"),
        EpisodeCandidate::new(1, 3, "The Long Night"),
        EpisodeCandidate::new(1, 4, "Crossroads"),
        EpisodeCandidate::new(1, 5, "Finale"),
    ]
}

pub fn pool() -> Arc<CandidatePool> {
    Arc::new(CandidatePool::new(EpisodeList::new(episodes()), None).unwrap())
}

pub fn config(threshold: f64, workers: usize) -> Arc<EngineConfig> {
    let mut config = EngineConfig::new(threshold);
    config.workers = workers;
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    };
    Arc::new(config)
}

/// Writes an empty clip file per call into `dir`, named after the title and
/// window so the fake recognizer can tell them apart.
pub struct FakeSampler {
    dir: PathBuf,
    calls: AtomicUsize,
    missing_binary: bool,
}

impl FakeSampler {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            calls: AtomicUsize::new(0),
            missing_binary: false,
        }
    }

    pub fn missing_binary(dir: &Path) -> Self {
        Self {
            missing_binary: true,
            ..Self::new(dir)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSampler for FakeSampler {
    async fn sample(&self, title: &RawTitle, window: TimeWindow) -> Result<Clip, SamplerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.missing_binary {
            return Err(ToolError::NotFound {
                tool: "ffmpeg".to_string(),
            }
            .into());
        }
        let path = self
            .dir
            .join(format!("{}@{}.{n}.m4v", title.id, window.start_minute));
        std::fs::write(&path, b"clip").map_err(|source| ToolError::Spawn {
            tool: "fake".to_string(),
            source,
        })?;
        Ok(Clip::new(path, window))
    }
}

#[derive(Clone)]
pub enum Behavior {
    Text(Vec<&'static str>),
    Transient,
    Quota,
    /// Blocks until cancelled, signalling `Notify` once in flight
    Hang(Arc<Notify>),
}

pub struct FakeRecognizer {
    script: HashMap<(String, u32), Behavior>,
    default: Behavior,
    calls: AtomicUsize,
}

impl FakeRecognizer {
    pub fn new() -> Self {
        Self::with_default(Behavior::Text(Vec::new()))
    }

    pub fn with_default(default: Behavior) -> Self {
        Self {
            script: HashMap::new(),
            default,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn on(mut self, title: &str, start_minute: u32, behavior: Behavior) -> Self {
        self.script
            .insert((title.to_string(), start_minute), behavior);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn behavior(&self, clip: &Clip) -> Behavior {
        let name = clip
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = name.split('@').next().unwrap_or_default().to_string();
        self.script
            .get(&(id, clip.window().start_minute))
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl TextRecognizer for FakeRecognizer {
    async fn recognize(
        &self,
        clip: &Clip,
        cancel: &CancellationToken,
    ) -> Result<RecognizedText, RecognizerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(clip.path().exists(), "clip must exist while being recognized");

        match self.behavior(clip) {
            Behavior::Text(spans) => Ok(RecognizedText::from_strings(spans)),
            Behavior::Transient => Err(RecognizerError::Transient("503 backend error".to_string())),
            Behavior::Quota => Err(RecognizerError::Quota("RESOURCE_EXHAUSTED".to_string())),
            Behavior::Hang(started) => {
                started.notify_one();
                cancel.cancelled().await;
                Err(RecognizerError::Cancelled)
            }
        }
    }
}

pub struct FakePrompt {
    answers: HashMap<String, ManualAnswer>,
    asked: Mutex<Vec<(String, PromptReason)>>,
    operator: Option<Arc<Notify>>,
}

impl FakePrompt {
    pub fn new() -> Self {
        Self {
            answers: HashMap::new(),
            asked: Mutex::new(Vec::new()),
            operator: None,
        }
    }

    /// Holds every answer until `operator` is notified.
    pub fn waiting_on(mut self, operator: Arc<Notify>) -> Self {
        self.operator = Some(operator);
        self
    }

    pub fn answer(mut self, title: &str, answer: ManualAnswer) -> Self {
        self.answers.insert(title.to_string(), answer);
        self
    }

    pub fn asked(&self) -> Vec<(String, PromptReason)> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl ManualEntry for FakePrompt {
    async fn prompt(
        &self,
        title: &RawTitle,
        reason: PromptReason,
        _pool: &CandidatePool,
    ) -> Result<ManualAnswer, PromptError> {
        self.asked.lock().unwrap().push((title.id.clone(), reason));
        if let Some(operator) = &self.operator {
            operator.notified().await;
        }
        Ok(self
            .answers
            .get(&title.id)
            .cloned()
            .unwrap_or(ManualAnswer::Decline))
    }
}

pub fn clip_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

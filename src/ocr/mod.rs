pub mod video_intelligence;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::media::Clip;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextSpan {
    pub text: String,
    pub confidence: f32,
}

/// Text found in one clip.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecognizedText {
    pub spans: Vec<TextSpan>,
}

impl RecognizedText {
    pub fn from_strings<I, S>(spans: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            spans: spans
                .into_iter()
                .map(|text| TextSpan {
                    text: text.into(),
                    confidence: 1.0,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RecognizerError {
    #[error("text recognition failed: {0}")]
    Transient(String),
    #[error("text recognition quota exhausted: {0}")]
    Quota(String),
    #[error("text recognition service rejected the credentials: {0}")]
    Auth(String),
    #[error("text recognition request rejected: {0}")]
    Rejected(String),
    #[error("text recognition cancelled")]
    Cancelled,
}

impl RecognizerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RecognizerError::Transient(_))
    }
}

/// Remote text detection over a clip. Implementations hide upload, polling
/// and cleanup, and must return [`RecognizerError::Cancelled`] promptly once
/// `cancel` fires, after releasing any remote resources they created.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(
        &self,
        clip: &Clip,
        cancel: &CancellationToken,
    ) -> Result<RecognizedText, RecognizerError>;
}

pub(crate) fn median(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

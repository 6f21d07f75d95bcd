use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{median, RecognizedText, RecognizerError, TextRecognizer, TextSpan};
use crate::media::{run_tool, Clip};

pub const STORAGE_ENDPOINT: &str = "https://storage.googleapis.com";
pub const VIDEO_INTELLIGENCE_ENDPOINT: &str = "https://videointelligence.googleapis.com";

/// Poll waits never exceed this many units
const MAX_POLL_UNITS: u32 = 120;
/// Consecutive transient poll failures tolerated before giving up
const MAX_POLL_FAILURES: u32 = 3;

// google.rpc.Code values reported in failed operations
const RPC_INVALID_ARGUMENT: i32 = 3;
const RPC_NOT_FOUND: i32 = 5;
const RPC_PERMISSION_DENIED: i32 = 7;
const RPC_RESOURCE_EXHAUSTED: i32 = 8;
const RPC_UNAUTHENTICATED: i32 = 16;

#[derive(Debug, Clone)]
pub struct RecognizerSettings {
    /// Staging location, `gs://bucket/optional/prefix` or a bare bucket name
    pub staging: String,
    /// Project billed for the requests
    pub project: Option<String>,
    pub access_token: Option<String>,
    pub gcloud: PathBuf,
    /// Annotations whose median segment confidence is below this are dropped
    pub min_span_confidence: f32,
    pub storage_endpoint: String,
    pub video_endpoint: String,
    pub request_timeout: Duration,
    pub poll_timeout: Duration,
    /// Scale of the poll backoff
    pub poll_unit: Duration,
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            staging: String::new(),
            project: None,
            access_token: None,
            gcloud: PathBuf::from("gcloud"),
            min_span_confidence: 0.9,
            storage_endpoint: STORAGE_ENDPOINT.to_string(),
            video_endpoint: VIDEO_INTELLIGENCE_ENDPOINT.to_string(),
            request_timeout: Duration::from_secs(300),
            poll_timeout: Duration::from_secs(30 * 60),
            poll_unit: Duration::from_secs(1),
        }
    }
}

/// Text detection through Google Cloud Video Intelligence. Clips are staged
/// in Cloud Storage for the duration of one call.
pub struct VideoIntelligenceRecognizer {
    client: reqwest::Client,
    settings: RecognizerSettings,
    bucket: String,
    prefix: String,
    /// Token printed by gcloud, dropped when the service rejects it
    token: Mutex<Option<String>>,
    counter: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Operation {
    #[serde(default)]
    done: bool,
    error: Option<RpcStatus>,
    response: Option<AnnotateVideoResponse>,
}

#[derive(Debug, Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct AnnotateVideoResponse {
    #[serde(rename = "annotationResults", default)]
    annotation_results: Vec<AnnotationResult>,
}

#[derive(Debug, Deserialize)]
struct AnnotationResult {
    #[serde(rename = "textAnnotations", default)]
    text_annotations: Vec<TextAnnotation>,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Vec<TextSegment>,
}

#[derive(Debug, Deserialize)]
struct TextSegment {
    #[serde(default)]
    confidence: f32,
}

impl VideoIntelligenceRecognizer {
    pub fn new(settings: RecognizerSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Self::with_client(settings, client)
    }

    fn with_client(settings: RecognizerSettings, client: reqwest::Client) -> Result<Self> {
        let (bucket, prefix) = split_staging(&settings.staging)?;
        Ok(Self {
            client,
            settings,
            bucket,
            prefix,
            token: Mutex::new(None),
            counter: AtomicU64::new(0),
        })
    }

    async fn token(&self) -> Result<String, RecognizerError> {
        if let Some(token) = &self.settings.access_token {
            return Ok(token.clone());
        }
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let output = run_tool(&self.settings.gcloud, ["auth", "print-access-token"])
            .await
            .map_err(|e| RecognizerError::Auth(e.to_string()))?;
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(RecognizerError::Auth(
                "gcloud returned an empty access token".to_string(),
            ));
        }
        debug!("Fetched access token from gcloud");
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Drops `stale` from the cache unless another request already replaced it.
    async fn forget_token(&self, stale: &str) {
        let mut cached = self.token.lock().await;
        if cached.as_deref() == Some(stale) {
            *cached = None;
        }
    }

    /// Sends the request built by `build` with the current token. A gcloud
    /// token that comes back 401 has likely expired, so it is fetched again
    /// and the request resent once.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, RecognizerError>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let token = self.token().await?;
        let response = self
            .with_project(build(&token))
            .send()
            .await
            .map_err(transport)?;
        if response.status() != StatusCode::UNAUTHORIZED || self.settings.access_token.is_some() {
            return Ok(response);
        }

        info!("Access token rejected, fetching a new one");
        self.forget_token(&token).await;
        let token = self.token().await?;
        self.with_project(build(&token))
            .send()
            .await
            .map_err(transport)
    }

    fn object_name(&self, clip: &Clip) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let file = clip
            .path()
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "clip.m4v".to_string());
        format!("{}ocr_{nanos:08x}{n:04x}/{file}", self.prefix)
    }

    fn with_project(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.settings.project {
            Some(project) => request.header("x-goog-user-project", project),
            None => request,
        }
    }

    async fn upload(&self, clip: &Clip, object: &str) -> Result<(), RecognizerError> {
        let body = tokio::fs::read(clip.path()).await.map_err(|e| {
            RecognizerError::Transient(format!("failed to read clip {:?}: {e}", clip.path()))
        })?;
        debug!(object, bytes = body.len(), "Starting upload");

        let url = format!(
            "{}/upload/storage/v1/b/{}/o",
            self.settings.storage_endpoint, self.bucket
        );
        let response = self
            .send(|token| {
                self.client
                    .post(url.as_str())
                    .bearer_auth(token)
                    .query(&[("uploadType", "media"), ("name", object)])
                    .header(CONTENT_TYPE, "video/mp4")
                    .body(body.clone())
            })
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn start_annotation(&self, object: &str) -> Result<String, RecognizerError> {
        let body = serde_json::json!({
            "inputUri": format!("gs://{}/{}", self.bucket, object),
            "features": ["TEXT_DETECTION"],
        });
        let url = format!("{}/v1/videos:annotate", self.settings.video_endpoint);
        let response = self
            .send(|token| self.client.post(url.as_str()).bearer_auth(token).json(&body))
            .await?;
        let started: AnnotateResponse = check(response).await?.json().await.map_err(transport)?;
        Ok(started.name)
    }

    async fn poll(&self, operation: &str) -> Result<Operation, RecognizerError> {
        let url = format!("{}/v1/{operation}", self.settings.video_endpoint);
        let response = self
            .send(|token| self.client.get(url.as_str()).bearer_auth(token))
            .await?;
        check(response).await?.json().await.map_err(transport)
    }

    async fn cancel_operation(&self, operation: &str) {
        let url = format!("{}/v1/{operation}:cancel", self.settings.video_endpoint);
        match self
            .send(|token| self.client.post(url.as_str()).bearer_auth(token))
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(operation, "Cancelled text detection")
            }
            Ok(response) => warn!(operation, status = %response.status(), "Failed to cancel text detection"),
            Err(e) => warn!(operation, "Failed to cancel text detection: {e}"),
        }
    }

    async fn delete_object(&self, object: &str) -> Result<(), RecognizerError> {
        let url = format!(
            "{}/storage/v1/b/{}/o/{}",
            self.settings.storage_endpoint,
            self.bucket,
            urlencoding::encode(object)
        );
        let response = self
            .send(|token| self.client.delete(url.as_str()).bearer_auth(token))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }

    async fn upload_and_detect(
        &self,
        clip: &Clip,
        object: &str,
        cancel: &CancellationToken,
    ) -> Result<RecognizedText, RecognizerError> {
        tokio::select! {
            _ = cancel.cancelled() => return Err(RecognizerError::Cancelled),
            uploaded = self.upload(clip, object) => uploaded?,
        }

        let operation = self.start_annotation(object).await?;
        info!(operation = %operation, window = %clip.window(), "Starting OCR text recognition");

        // From here on every early return cancels the remote operation
        let started = Instant::now();
        let mut round = 0;
        let mut failures = 0;
        loop {
            let delay = poll_delay(round, self.settings.poll_unit);
            let polled = tokio::select! {
                _ = cancel.cancelled() => None,
                polled = async {
                    tokio::time::sleep(delay).await;
                    self.poll(&operation).await
                } => Some(polled),
            };

            match polled {
                None => {
                    self.cancel_operation(&operation).await;
                    return Err(RecognizerError::Cancelled);
                }
                Some(Ok(status)) => {
                    failures = 0;
                    // A failed operation is already finished
                    if let Some(spans) = spans_from_operation(status, self.settings.min_span_confidence)? {
                        debug!(operation = %operation, spans = spans.len(), "Text detection finished");
                        return Ok(RecognizedText { spans });
                    }
                }
                Some(Err(e)) if e.is_transient() && failures + 1 < MAX_POLL_FAILURES => {
                    failures += 1;
                    warn!(operation = %operation, failures, "Polling text detection failed: {e}");
                }
                Some(Err(e)) => {
                    self.cancel_operation(&operation).await;
                    return Err(e);
                }
            }

            if started.elapsed() > self.settings.poll_timeout {
                self.cancel_operation(&operation).await;
                return Err(RecognizerError::Transient(format!(
                    "timed out after {:?} waiting for {operation}",
                    self.settings.poll_timeout
                )));
            }
            round += 1;
        }
    }
}

#[async_trait]
impl TextRecognizer for VideoIntelligenceRecognizer {
    async fn recognize(
        &self,
        clip: &Clip,
        cancel: &CancellationToken,
    ) -> Result<RecognizedText, RecognizerError> {
        let object = self.object_name(clip);
        let result = self.upload_and_detect(clip, &object, cancel).await;

        // The staged copy goes away on every path, cancellation included
        if let Err(e) = self.delete_object(&object).await {
            warn!(object = %object, "Failed to delete staged clip: {e}");
        }
        result
    }
}

fn split_staging(staging: &str) -> Result<(String, String)> {
    let trimmed = staging.trim().trim_start_matches("gs://").trim_matches('/');
    let (bucket, prefix) = match trimmed.split_once('/') {
        Some((bucket, prefix)) => (bucket, format!("{prefix}/")),
        None => (trimmed, String::new()),
    };
    if bucket.is_empty() {
        anyhow::bail!("A gs:// staging bucket is required for text detection");
    }
    Ok((bucket.to_string(), prefix))
}

/// Waits between operation polls: 2^round + 10 units, capped at 120 units
/// (two minutes at the default one-second unit).
fn poll_delay(round: u32, unit: Duration) -> Duration {
    let units = 2u32
        .saturating_pow(round)
        .saturating_add(10)
        .min(MAX_POLL_UNITS);
    unit * units
}

fn transport(e: reqwest::Error) -> RecognizerError {
    RecognizerError::Transient(e.to_string())
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, RecognizerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

fn classify_status(status: StatusCode, body: &str) -> RecognizerError {
    let detail = format!("HTTP {status}: {}", body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RecognizerError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => RecognizerError::Quota(detail),
        _ if body.contains("RESOURCE_EXHAUSTED") => RecognizerError::Quota(detail),
        StatusCode::REQUEST_TIMEOUT => RecognizerError::Transient(detail),
        s if s.is_client_error() => RecognizerError::Rejected(detail),
        _ => RecognizerError::Transient(detail),
    }
}

fn spans_from_operation(
    operation: Operation,
    min_span_confidence: f32,
) -> Result<Option<Vec<TextSpan>>, RecognizerError> {
    if let Some(status) = operation.error {
        let detail = format!("operation failed with code {}: {}", status.code, status.message);
        return Err(match status.code {
            RPC_RESOURCE_EXHAUSTED => RecognizerError::Quota(detail),
            RPC_PERMISSION_DENIED | RPC_UNAUTHENTICATED => RecognizerError::Auth(detail),
            RPC_INVALID_ARGUMENT | RPC_NOT_FOUND => RecognizerError::Rejected(detail),
            _ => RecognizerError::Transient(detail),
        });
    }
    if !operation.done {
        return Ok(None);
    }

    let spans = operation
        .response
        .into_iter()
        .flat_map(|r| r.annotation_results)
        .flat_map(|r| r.text_annotations)
        .filter_map(|annotation| {
            let confidences: Vec<f32> = annotation.segments.iter().map(|s| s.confidence).collect();
            let confidence = median(&confidences)?;
            (confidence >= min_span_confidence).then_some(TextSpan {
                text: annotation.text,
                confidence,
            })
        })
        .collect();
    Ok(Some(spans))
}

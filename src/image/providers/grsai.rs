//! Grsai try-on provider: submit a draw job, then poll until it finishes.

use crate::error::{sanitize_error_message, ProviderFailure, Result, TryOnError};
use crate::image::provider::{cancellable, ProviderAdapter, ProviderKind};
use crate::image::types::{AspectRatio, GenerationRequest, ImageReference};
use crate::progress::{ProgressReporter, Stage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://grsai.dakka.com.cn";
const DRAW_ENDPOINT: &str = "/v1/draw/nano-banana";
const RESULT_ENDPOINT: &str = "/v1/draw/result";

/// Default delay between status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);
/// Default limit on polling, measured from the submit acknowledgement.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(120_000);

/// Application code for a job that does not exist or was cleaned up.
const TASK_NOT_FOUND_CODE: i64 = -22;

/// `webHook` value that turns off push delivery, so results must be polled.
const WEBHOOK_DISABLED: &str = "-1";

/// Placeholder in prompts that stands for the garment image.
///
/// The draw API takes no inline images, so the placeholder is spelled out.
pub const GARMENT_PLACEHOLDER: &str = "[garment]";
const GARMENT_DESCRIPTION: &str = "this garment";

/// Grsai draw model variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GrsaiModel {
    /// Nano Banana, fast tier.
    #[default]
    NanoBananaFast,
    /// Nano Banana.
    NanoBanana,
}

impl GrsaiModel {
    /// Returns the API model identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NanoBananaFast => "nano-banana-fast",
            Self::NanoBanana => "nano-banana",
        }
    }
}

/// Builder for `GrsaiProvider`.
#[derive(Debug, Clone)]
pub struct GrsaiProviderBuilder {
    api_key: Option<String>,
    model: GrsaiModel,
    base_url: Option<String>,
    poll_interval: Duration,
    timeout: Duration,
    client: Option<reqwest::Client>,
}

impl Default for GrsaiProviderBuilder {
    fn default() -> Self {
        Self {
            api_key: None,
            model: GrsaiModel::default(),
            base_url: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
            client: None,
        }
    }
}

impl GrsaiProviderBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the API key. Falls back to `GRSAI_API_KEY` env var.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the model variant.
    pub fn model(mut self, model: GrsaiModel) -> Self {
        self.model = model;
        self
    }

    /// Overrides the API host.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the delay between status polls.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the maximum time to wait for the job.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shares an existing HTTP client.
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Builds the provider, resolving the API key.
    pub fn build(self) -> Result<GrsaiProvider> {
        let api_key = self
            .api_key
            .or_else(|| std::env::var("GRSAI_API_KEY").ok())
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or(TryOnError::NoAvailableKey)?;

        Ok(GrsaiProvider {
            client: self.client.unwrap_or_default(),
            api_key,
            model: self.model,
            base_url: self
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            poll_interval: self.poll_interval,
            timeout: self.timeout,
        })
    }
}

/// Grsai try-on provider.
#[derive(Debug)]
pub struct GrsaiProvider {
    client: reqwest::Client,
    api_key: String,
    model: GrsaiModel,
    base_url: String,
    poll_interval: Duration,
    timeout: Duration,
}

/// Tracks one remote job from submit acknowledgement to terminal state.
#[derive(Debug)]
struct JobState {
    job_id: String,
    stage: Stage,
    progress_percent: u8,
    started_at: Instant,
}

impl JobState {
    fn new(job_id: String) -> Self {
        Self {
            job_id,
            stage: Stage::Pending,
            progress_percent: 10,
            started_at: Instant::now(),
        }
    }

    fn record(&mut self, stage: Stage, percent: u8) {
        self.stage = stage;
        self.progress_percent = self.progress_percent.max(percent);
    }
}

/// What one status poll tells the loop to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PollStep {
    /// Nothing usable yet; ask again after the interval.
    Retry(String),
    /// The job is running at this percentage.
    Running(u8),
    /// The job finished; the image is at this URL.
    Done(String),
}

impl GrsaiProvider {
    /// Creates a new `GrsaiProviderBuilder`.
    pub fn builder() -> GrsaiProviderBuilder {
        GrsaiProviderBuilder::new()
    }

    fn authorization(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    /// Phase 1: submits the draw job and returns its identifier.
    async fn submit_job(
        &self,
        request: &GenerationRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<String> {
        progress.emit(Stage::Requesting, 5);

        let body = DrawRequest {
            model: self.model.as_str(),
            prompt: describe_garment(request.prompt()),
            aspect_ratio: request.aspect_ratio().unwrap_or_default(),
            web_hook: WEBHOOK_DISABLED,
        };

        let send = self
            .client
            .post(format!("{}{}", self.base_url, DRAW_ENDPOINT))
            .header("Authorization", self.authorization())
            .json(&body)
            .send();
        let response = cancellable(cancel, send).await??;
        let status = response.status();
        let text = cancellable(cancel, response.text()).await??;

        if !status.is_success() {
            return Err(ProviderFailure::Api {
                status: status.as_u16(),
                message: error_message(&text, status),
            }
            .into());
        }

        let envelope: Envelope<SubmitData> = serde_json::from_str(&text).map_err(|e| {
            TryOnError::MalformedResponse(format!("unreadable submit response: {e}"))
        })?;

        match envelope.code {
            Some(0) => {}
            code => {
                return Err(ProviderFailure::Rejected {
                    code: code.unwrap_or_default(),
                    message: sanitize_error_message(envelope.msg.as_deref().unwrap_or_default()),
                }
                .into())
            }
        }

        let job_id = envelope
            .data
            .and_then(|d| d.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TryOnError::MalformedResponse("submit response has no job id".into()))?;

        progress.emit(Stage::Pending, 10);
        Ok(job_id)
    }

    /// Phase 2: polls the job until it finishes, fails, or the timeout passes.
    async fn poll_until_ready(
        &self,
        job_id: String,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.poll_loop(job_id, progress, cancel, |id| async move {
            self.poll_once(&id, cancel).await
        })
        .await
    }

    /// Drives `poll` until the job reaches a terminal state.
    ///
    /// The timeout bounds the whole loop, including a poll still in flight
    /// when the deadline passes.
    async fn poll_loop<F, Fut>(
        &self,
        job_id: String,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
        mut poll: F,
    ) -> Result<String>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<(u16, String)>>,
    {
        let mut job = JobState::new(job_id);
        let deadline = job.started_at + self.timeout;

        loop {
            if job.started_at.elapsed() > self.timeout {
                return Err(self.give_up(&job));
            }

            let (status, text) =
                match tokio::time::timeout_at(deadline, poll(job.job_id.clone())).await {
                    Ok(polled) => polled?,
                    Err(_) => return Err(self.give_up(&job)),
                };

            match interpret_poll(&job.job_id, status, &text)? {
                PollStep::Done(url) => {
                    job.record(Stage::Succeeded, 100);
                    progress.emit(Stage::Succeeded, 100);
                    tracing::debug!(
                        job_id = %job.job_id,
                        elapsed_ms = job.started_at.elapsed().as_millis() as u64,
                        "Grsai job complete"
                    );
                    return Ok(url);
                }
                PollStep::Running(percent) => {
                    job.record(Stage::Running, percent);
                    progress.emit(Stage::Running, percent);
                }
                PollStep::Retry(reason) => {
                    tracing::debug!(job_id = %job.job_id, %reason, "Grsai job not ready");
                }
            }

            cancellable(cancel, tokio::time::sleep(self.poll_interval)).await?;
        }
    }

    fn give_up(&self, job: &JobState) -> TryOnError {
        tracing::warn!(
            job_id = %job.job_id,
            stage = %job.stage,
            percent = job.progress_percent,
            "gave up polling Grsai job"
        );
        TryOnError::PollTimeout(self.timeout)
    }

    async fn poll_once(&self, job_id: &str, cancel: &CancellationToken) -> Result<(u16, String)> {
        let send = self
            .client
            .post(format!("{}{}", self.base_url, RESULT_ENDPOINT))
            .header("Authorization", self.authorization())
            .json(&PollRequest { id: job_id })
            .send();
        let response = cancellable(cancel, send).await??;
        let status = response.status().as_u16();
        let text = cancellable(cancel, response.text()).await??;
        Ok((status, text))
    }
}

/// Replaces the garment placeholder with a textual reference.
fn describe_garment(prompt: &str) -> String {
    prompt.replace(GARMENT_PLACEHOLDER, GARMENT_DESCRIPTION)
}

fn error_message(text: &str, status: reqwest::StatusCode) -> String {
    serde_json::from_str::<Envelope<serde_json::Value>>(text)
        .ok()
        .and_then(|e| e.msg)
        .filter(|m| !m.is_empty())
        .map(|m| sanitize_error_message(&m))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string())
}

/// Classifies one status poll response.
fn interpret_poll(job_id: &str, status: u16, text: &str) -> Result<PollStep> {
    if (500..=599).contains(&status) {
        return Ok(PollStep::Retry(format!("server error {status}")));
    }
    if !(200..=299).contains(&status) {
        let status_code = reqwest::StatusCode::from_u16(status)
            .unwrap_or(reqwest::StatusCode::BAD_REQUEST);
        return Err(ProviderFailure::Api {
            status,
            message: error_message(text, status_code),
        }
        .into());
    }

    let envelope: Envelope<PollData> = serde_json::from_str(text)
        .map_err(|e| TryOnError::MalformedResponse(format!("unreadable poll response: {e}")))?;

    match envelope.code {
        Some(0) => {}
        Some(TASK_NOT_FOUND_CODE) => return Err(TryOnError::TaskNotFound(job_id.to_string())),
        code => {
            return Ok(PollStep::Retry(format!(
                "application code {}",
                code.map_or_else(|| "missing".to_string(), |c| c.to_string())
            )))
        }
    }

    let data = envelope
        .data
        .ok_or_else(|| TryOnError::MalformedResponse("poll response has no data".into()))?;

    match data.status.as_deref() {
        Some("running") => Ok(PollStep::Running(clamp_percent(data.progress))),
        Some("succeeded") => data
            .results
            .into_iter()
            .filter_map(|r| r.url)
            .find(|url| !url.is_empty())
            .map(PollStep::Done)
            .ok_or_else(|| {
                TryOnError::MalformedResponse("job succeeded but no image URL was returned".into())
            }),
        Some("failed") => {
            let reason = [data.failure_reason, data.error]
                .into_iter()
                .flatten()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" - ");
            Err(ProviderFailure::JobFailed {
                reason: if reason.is_empty() {
                    "no reason given".to_string()
                } else {
                    sanitize_error_message(&reason)
                },
            }
            .into())
        }
        other => Ok(PollStep::Retry(format!(
            "status {}",
            other.unwrap_or("missing")
        ))),
    }
}

fn clamp_percent(progress: Option<f64>) -> u8 {
    match progress {
        Some(p) if p.is_finite() => p.clamp(0.0, 100.0).round() as u8,
        _ => 0,
    }
}

#[async_trait]
impl ProviderAdapter for GrsaiProvider {
    async fn submit(
        &self,
        request: &GenerationRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ImageReference> {
        progress.emit(Stage::Starting, 0);

        let result = async {
            let job_id = self.submit_job(request, progress, cancel).await?;
            tracing::debug!(job_id = %job_id, model = self.model.as_str(), "submitted Grsai job");
            self.poll_until_ready(job_id, progress, cancel).await
        }
        .await;

        match result {
            Ok(url) => Ok(ImageReference::Remote(url)),
            Err(e) => {
                tracing::debug!("Grsai generation failed: {e}");
                progress.fail();
                Err(e)
            }
        }
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Grsai
    }
}

// Request/Response types
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DrawRequest {
    model: &'static str,
    prompt: String,
    aspect_ratio: AspectRatio,
    web_hook: &'static str,
}

#[derive(Debug, Serialize)]
struct PollRequest<'a> {
    id: &'a str,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: Option<i64>,
    msg: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct SubmitData {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PollData {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    results: Vec<PollResult>,
    #[serde(default)]
    failure_reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PollResult {
    #[serde(default)]
    url: Option<String>,
}

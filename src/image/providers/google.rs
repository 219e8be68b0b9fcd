//! Google Gemini try-on provider: one synchronous request per generation.

use crate::error::{sanitize_error_message, ProviderFailure, Result, TryOnError};
use crate::image::provider::{cancellable, ProviderAdapter, ProviderKind};
use crate::image::types::{GenerationRequest, ImageReference, InlineImage};
use crate::keys::{CredentialRecord, KeyPool};
use crate::progress::{ProgressReporter, Stage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Error text the API uses when it rejects a credential (matched case-insensitively).
const INVALID_KEY_MARKER: &str = "api key not valid";

/// Finish reasons that mean the output was withheld by a safety filter.
const SAFETY_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "IMAGE_SAFETY",
    "PROHIBITED_CONTENT",
    "IMAGE_PROHIBITED_CONTENT",
    "BLOCKLIST",
];

/// Gemini image model variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GoogleModel {
    /// Gemini 2.5 Flash Image preview.
    #[default]
    FlashImagePreview,
    /// Gemini 2.5 Flash Image.
    FlashImage,
}

impl GoogleModel {
    /// Returns the API model identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlashImagePreview => "gemini-2.5-flash-image-preview",
            Self::FlashImage => "gemini-2.5-flash-image",
        }
    }
}

/// Builder for `GoogleProvider`.
#[derive(Debug, Clone, Default)]
pub struct GoogleProviderBuilder {
    key_pool: Option<Arc<KeyPool>>,
    model: GoogleModel,
    base_url: Option<String>,
    client: Option<reqwest::Client>,
}

impl GoogleProviderBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the credential pool. Falls back to `GOOGLE_API_KEYS` / `GOOGLE_API_KEY`
    /// (comma separated) in an in-memory pool.
    pub fn key_pool(mut self, pool: Arc<KeyPool>) -> Self {
        self.key_pool = Some(pool);
        self
    }

    /// Sets the Gemini model variant.
    pub fn model(mut self, model: GoogleModel) -> Self {
        self.model = model;
        self
    }

    /// Overrides the models endpoint base URL.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Shares an existing HTTP client.
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Builds the provider, resolving the credential pool.
    pub fn build(self) -> Result<GoogleProvider> {
        let key_pool = match self.key_pool {
            Some(pool) => pool,
            None => {
                let keys = ["GOOGLE_API_KEYS", "GOOGLE_API_KEY"]
                    .iter()
                    .filter_map(|var| std::env::var(var).ok())
                    .map(|raw| parse_key_list(&raw))
                    .find(|keys| !keys.is_empty())
                    .ok_or(TryOnError::NoAvailableKey)?;
                Arc::new(KeyPool::in_memory(keys))
            }
        };

        Ok(GoogleProvider {
            client: self.client.unwrap_or_default(),
            key_pool,
            model: self.model,
            base_url: self
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

/// Splits a comma separated key list, dropping blanks.
fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect()
}

/// Gemini try-on provider.
pub struct GoogleProvider {
    client: reqwest::Client,
    key_pool: Arc<KeyPool>,
    model: GoogleModel,
    base_url: String,
}

impl GoogleProvider {
    /// Creates a new `GoogleProviderBuilder`.
    pub fn builder() -> GoogleProviderBuilder {
        GoogleProviderBuilder::new()
    }

    /// The credential pool this provider draws from.
    pub fn key_pool(&self) -> &Arc<KeyPool> {
        &self.key_pool
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", self.base_url, self.model.as_str())
    }

    async fn submit_impl(
        &self,
        request: &GenerationRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ImageReference> {
        progress.emit(Stage::Starting, 0);

        let credential = self.key_pool.acquire_next()?;
        let subject = request.subject_image().parse()?;
        let garment = request.garment_image().parse()?;

        progress.emit(Stage::Requesting, 25);
        let body =
            GoogleRequest::try_on(request.prompt(), [subject, garment], request.temperature());

        progress.emit(Stage::Running, 50);
        let send = self
            .client
            .post(self.endpoint())
            .query(&[("key", credential.value.as_str())])
            .json(&body)
            .send();
        let response = cancellable(cancel, send).await?.map_err(network_error)?;

        progress.emit(Stage::Processing, 75);
        let status = response.status();
        let text = cancellable(cancel, response.text())
            .await?
            .map_err(network_error)?;

        if !status.is_success() {
            return Err(self.api_error(status.as_u16(), &text, &credential)?);
        }

        let image = parse_generate_response(&text)?;
        self.key_pool.report_valid(&credential.value)?;
        progress.emit(Stage::Succeeded, 100);

        Ok(ImageReference::Inline(image))
    }

    /// Classifies a non-success response, invalidating the credential when the
    /// back end says it was rejected.
    fn api_error(
        &self,
        status: u16,
        text: &str,
        credential: &CredentialRecord,
    ) -> Result<TryOnError> {
        let message = serde_json::from_str::<GoogleErrorBody>(text)
            .ok()
            .and_then(|body| body.error)
            .and_then(|error| error.message)
            .unwrap_or_else(|| text.to_string());

        if message.to_lowercase().contains(INVALID_KEY_MARKER) {
            self.key_pool.report_invalid(&credential.value)?;
            return Ok(ProviderFailure::InvalidKey.into());
        }

        Ok(ProviderFailure::Api {
            status,
            message: sanitize_error_message(&message),
        }
        .into())
    }

    /// Checks a credential with a minimal text request.
    ///
    /// Returns `Ok(false)` when the API answers with any error, and propagates
    /// transport failures so callers can leave the credential's status alone.
    pub async fn verify_key(&self, key: &str) -> Result<bool> {
        let body = GoogleRequest::text_only("test");
        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", key)])
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        let text = response.text().await.unwrap_or_default();
        tracing::debug!(
            status = status.as_u16(),
            message = %sanitize_error_message(&text),
            "credential verification rejected"
        );
        Ok(false)
    }
}

/// Strips the request URL from transport errors: it carries the credential.
fn network_error(err: reqwest::Error) -> TryOnError {
    TryOnError::Network(err.without_url())
}

fn parse_generate_response(text: &str) -> Result<InlineImage> {
    let response: GoogleResponse = serde_json::from_str(text)
        .map_err(|e| TryOnError::MalformedResponse(format!("unreadable Gemini response: {e}")))?;

    // Prompt-level blocks come back as HTTP 200 with no candidates.
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(TryOnError::SafetyBlocked(reason));
    }

    let candidate = response.candidates.into_iter().next().ok_or_else(|| {
        TryOnError::MalformedResponse("no candidates in Gemini response".into())
    })?;

    if let Some(reason) = candidate.finish_reason {
        if SAFETY_FINISH_REASONS.contains(&reason.as_str()) {
            return Err(TryOnError::SafetyBlocked(reason));
        }
    }

    let inline = candidate
        .content
        .into_iter()
        .flat_map(|content| content.parts)
        .find_map(|part| part.inline_data)
        .filter(|data| !data.data.is_empty())
        .ok_or_else(|| {
            TryOnError::MalformedResponse("no image data in Gemini response".into())
        })?;

    Ok(InlineImage {
        mime_type: inline
            .mime_type
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "image/png".to_string()),
        data: inline.data,
    })
}

#[async_trait]
impl ProviderAdapter for GoogleProvider {
    async fn submit(
        &self,
        request: &GenerationRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ImageReference> {
        let result = self.submit_impl(request, progress, cancel).await;
        if let Err(ref e) = result {
            tracing::debug!(model = self.model.as_str(), "Gemini generation failed: {e}");
            progress.fail();
        }
        result
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }
}

// Request/Response types
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleRequest {
    contents: Vec<GoogleContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GoogleGenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GoogleContent {
    parts: Vec<GoogleRequestPart>,
}

/// A part in a Gemini request - text or inline image data.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GoogleRequestPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GoogleInlineData,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GoogleGenerationConfig {
    temperature: f32,
}

impl GoogleRequest {
    /// Prompt first, then each image in order.
    fn try_on(prompt: &str, images: [InlineImage; 2], temperature: f32) -> Self {
        let mut parts = vec![GoogleRequestPart::Text {
            text: prompt.to_string(),
        }];
        parts.extend(images.into_iter().map(|image| GoogleRequestPart::InlineData {
            inline_data: GoogleInlineData {
                mime_type: image.mime_type,
                data: image.data,
            },
        }));

        Self {
            contents: vec![GoogleContent { parts }],
            generation_config: Some(GoogleGenerationConfig { temperature }),
        }
    }

    fn text_only(text: &str) -> Self {
        Self {
            contents: vec![GoogleContent {
                parts: vec![GoogleRequestPart::Text {
                    text: text.to_string(),
                }],
            }],
            generation_config: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleResponse {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    #[serde(default, alias = "prompt_feedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleCandidate {
    #[serde(default)]
    content: Option<GoogleContentResponse>,
    #[serde(default, alias = "finish_reason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default, alias = "block_reason")]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleContentResponse {
    #[serde(default)]
    parts: Vec<GooglePartResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GooglePartResponse {
    #[serde(default, alias = "inline_data")]
    inline_data: Option<InlineDataResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineDataResponse {
    #[serde(default, alias = "mime_type")]
    mime_type: Option<String>,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorBody {
    #[serde(default)]
    error: Option<GoogleErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::types::EncodedImage;
    use crate::keys::{KeyPoolState, KeyStatus, MemoryKeyStore};
    use crate::progress::ProgressEvent;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GENERATE_PATH: &str = "/v1beta/models/gemini-2.5-flash-image-preview:generateContent";

    fn request() -> GenerationRequest {
        GenerationRequest::new(
            EncodedImage::new("data:image/png;base64,c3ViamVjdA=="),
            EncodedImage::new("data:image/jpeg;base64,Z2FybWVudA=="),
            "Dress the person in this garment",
        )
        .with_temperature(0.4)
    }

    fn pool(keys: &[(&str, KeyStatus)]) -> Arc<KeyPool> {
        Arc::new(KeyPool::new(MemoryKeyStore::new(KeyPoolState {
            records: keys
                .iter()
                .map(|(k, s)| CredentialRecord::with_status(*k, *s))
                .collect(),
            cursor: None,
        })))
    }

    fn provider(server: &MockServer, pool: Arc<KeyPool>) -> GoogleProvider {
        GoogleProvider::builder()
            .key_pool(pool)
            .base_url(format!("{}/v1beta/models", server.uri()))
            .build()
            .unwrap()
    }

    fn status_of(pool: &KeyPool, key: &str) -> KeyStatus {
        pool.snapshot()
            .unwrap()
            .records
            .into_iter()
            .find(|r| r.value == key)
            .unwrap()
            .status
    }

    fn image_response() -> serde_json::Value {
        json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "Here you go"},
                    {"inlineData": {"mimeType": "image/jpeg", "data": "/9j/4AAQ"}}
                ]},
                "finishReason": "STOP"
            }]
        })
    }

    #[test]
    fn test_google_model_as_str() {
        assert_eq!(
            GoogleModel::FlashImagePreview.as_str(),
            "gemini-2.5-flash-image-preview"
        );
        assert_eq!(GoogleModel::FlashImage.as_str(), "gemini-2.5-flash-image");
        assert_eq!(GoogleModel::default(), GoogleModel::FlashImagePreview);
    }

    #[test]
    fn test_parse_key_list() {
        assert_eq!(parse_key_list("a, b,,c "), ["a", "b", "c"]);
        assert!(parse_key_list(" , ").is_empty());
    }

    #[test]
    fn test_request_serialization() {
        let images = [
            InlineImage {
                mime_type: "image/png".into(),
                data: "AAAA".into(),
            },
            InlineImage {
                mime_type: "image/jpeg".into(),
                data: "BBBB".into(),
            },
        ];
        let body = serde_json::to_value(GoogleRequest::try_on("prompt", images, 0.5)).unwrap();

        assert_eq!(
            body,
            json!({
                "contents": [{"parts": [
                    {"text": "prompt"},
                    {"inlineData": {"mimeType": "image/png", "data": "AAAA"}},
                    {"inlineData": {"mimeType": "image/jpeg", "data": "BBBB"}}
                ]}],
                "generationConfig": {"temperature": 0.5}
            })
        );
    }

    #[test]
    fn test_text_only_request_has_no_config() {
        let body = serde_json::to_value(GoogleRequest::text_only("test")).unwrap();
        assert_eq!(body, json!({"contents": [{"parts": [{"text": "test"}]}]}));
    }

    #[test]
    fn test_response_accepts_snake_case() {
        let text = r#"{"candidates": [{"content": {"parts": [
            {"inline_data": {"mime_type": "image/webp", "data": "UklGRg=="}}
        ]}}]}"#;
        let image = parse_generate_response(text).unwrap();
        assert_eq!(image.mime_type, "image/webp");
        assert_eq!(image.data, "UklGRg==");
    }

    #[test]
    fn test_response_missing_mime_defaults_to_png() {
        let text = r#"{"candidates": [{"content": {"parts": [{"inlineData": {"data": "AAAA"}}]}}]}"#;
        assert_eq!(parse_generate_response(text).unwrap().mime_type, "image/png");
    }

    #[test]
    fn test_response_classification() {
        let cases = [
            (r#"{"candidates": []}"#, "malformed"),
            (r#"{"candidates": [{"finishReason": "SAFETY"}]}"#, "safety"),
            (r#"{"candidates": [{"finishReason": "IMAGE_SAFETY"}]}"#, "safety"),
            (r#"{"candidates": [], "promptFeedback": {"blockReason": "OTHER"}}"#, "safety"),
            (r#"{"candidates": [{"content": {"parts": [{"text": "no"}]}}]}"#, "malformed"),
            (r#"{"candidates": [{"finishReason": "STOP"}]}"#, "malformed"),
            ("<html>", "malformed"),
        ];
        for (text, expected) in cases {
            let err = parse_generate_response(text).unwrap_err();
            let kind = match err {
                TryOnError::SafetyBlocked(_) => "safety",
                TryOnError::MalformedResponse(_) => "malformed",
                other => panic!("unexpected error for {text}: {other}"),
            };
            assert_eq!(kind, expected, "{text}");
        }
    }

    #[tokio::test]
    async fn test_submit_success_marks_key_valid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .and(query_param("key", "key-a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(image_response()))
            .expect(1)
            .mount(&server)
            .await;

        let keys = pool(&[("key-a", KeyStatus::Unknown)]);
        let provider = provider(&server, keys.clone());
        let (reporter, mut stream) = ProgressReporter::channel();

        let image = provider
            .submit(&request(), &reporter, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(image.to_string(), "data:image/jpeg;base64,/9j/4AAQ");
        assert_eq!(status_of(&keys, "key-a"), KeyStatus::Valid);
        assert_eq!(
            stream.drain(),
            vec![
                ProgressEvent::new(Stage::Starting, 0),
                ProgressEvent::new(Stage::Requesting, 25),
                ProgressEvent::new(Stage::Running, 50),
                ProgressEvent::new(Stage::Processing, 75),
                ProgressEvent::new(Stage::Succeeded, 100),
            ]
        );
    }

    #[tokio::test]
    async fn test_submit_sends_prompt_images_and_temperature() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(image_response()))
            .mount(&server)
            .await;

        let provider = provider(&server, pool(&[("key-a", KeyStatus::Unknown)]));
        provider
            .submit(&request(), &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .unwrap();

        let received = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[0]["text"], "Dress the person in this garment");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[1]["inlineData"]["data"], "c3ViamVjdA==");
        assert_eq!(parts[2]["inlineData"]["mimeType"], "image/jpeg");
        let temperature = body["generationConfig"]["temperature"].as_f64().unwrap();
        assert!((temperature - 0.4).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_submit_rotates_keys() {
        let server = MockServer::start().await;
        for key in ["key-a", "key-b"] {
            Mock::given(method("POST"))
                .and(path(GENERATE_PATH))
                .and(query_param("key", key))
                .respond_with(ResponseTemplate::new(200).set_body_json(image_response()))
                .expect(1)
                .mount(&server)
                .await;
        }

        let provider = provider(
            &server,
            pool(&[("key-a", KeyStatus::Unknown), ("key-b", KeyStatus::Unknown)]),
        );
        for _ in 0..2 {
            provider
                .submit(&request(), &ProgressReporter::noop(), &CancellationToken::new())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_missing_image_part_is_malformed_and_keeps_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": "I cannot do that"}]}}]
            })))
            .mount(&server)
            .await;

        let keys = pool(&[("key-a", KeyStatus::Unknown)]);
        let provider = provider(&server, keys.clone());
        let (reporter, mut stream) = ProgressReporter::channel();

        let err = provider
            .submit(&request(), &reporter, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TryOnError::MalformedResponse(_)));
        assert_eq!(status_of(&keys, "key-a"), KeyStatus::Unknown);
        let events = stream.drain();
        assert_eq!(events.last(), Some(&ProgressEvent::new(Stage::Failed, None)));
        assert_eq!(
            events.iter().filter(|e| e.stage == Stage::Failed).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_rejected_key_is_invalidated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {
                    "code": 400,
                    "message": "API key not valid. Please pass a valid API key.",
                    "status": "INVALID_ARGUMENT"
                }
            })))
            .mount(&server)
            .await;

        let keys = pool(&[("key-a", KeyStatus::Valid), ("key-b", KeyStatus::Unknown)]);
        let provider = provider(&server, keys.clone());

        let err = provider
            .submit(&request(), &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TryOnError::Provider(ProviderFailure::InvalidKey)));
        assert_eq!(status_of(&keys, "key-a"), KeyStatus::Invalid);
        assert_eq!(status_of(&keys, "key-b"), KeyStatus::Unknown);
        assert_eq!(keys.acquire_next().unwrap().value, "key-b");
        assert_eq!(keys.acquire_next().unwrap().value, "key-b");
    }

    #[tokio::test]
    async fn test_other_api_errors_keep_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"message": "Resource has been exhausted"}
            })))
            .mount(&server)
            .await;

        let keys = pool(&[("key-a", KeyStatus::Valid)]);
        let err = provider(&server, keys.clone())
            .submit(&request(), &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            TryOnError::Provider(ProviderFailure::Api { status, message }) => {
                assert_eq!(status, 429);
                assert_eq!(message, "Resource has been exhausted");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(status_of(&keys, "key-a"), KeyStatus::Valid);
    }

    #[tokio::test]
    async fn test_safety_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"finishReason": "SAFETY"}]
            })))
            .mount(&server)
            .await;

        let keys = pool(&[("key-a", KeyStatus::Unknown)]);
        let err = provider(&server, keys.clone())
            .submit(&request(), &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TryOnError::SafetyBlocked(ref r) if r == "SAFETY"));
        assert_eq!(status_of(&keys, "key-a"), KeyStatus::Unknown);
    }

    #[tokio::test]
    async fn test_no_usable_key_fails_before_network() {
        let server = MockServer::start().await;
        let provider = provider(&server, pool(&[("key-a", KeyStatus::Invalid)]));
        let (reporter, mut stream) = ProgressReporter::channel();

        let err = provider
            .submit(&request(), &reporter, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TryOnError::NoAvailableKey));
        assert!(server.received_requests().await.unwrap().is_empty());
        assert_eq!(
            stream.drain(),
            vec![
                ProgressEvent::new(Stage::Starting, 0),
                ProgressEvent::new(Stage::Failed, None),
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_image_fails_before_network() {
        let server = MockServer::start().await;
        let provider = provider(&server, pool(&[("key-a", KeyStatus::Unknown)]));
        let bad = GenerationRequest::new(
            EncodedImage::new("not-a-data-url"),
            EncodedImage::new("data:image/png;base64,AAAA"),
            "p",
        );

        let err = provider
            .submit(&bad, &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TryOnError::InvalidImageFormat(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_network_error_hides_key_and_keeps_status() {
        let keys = pool(&[("secret-key-123", KeyStatus::Valid)]);
        let provider = GoogleProvider::builder()
            .key_pool(keys.clone())
            .base_url("http://127.0.0.1:1/v1beta/models")
            .build()
            .unwrap();
        let (reporter, mut stream) = ProgressReporter::channel();

        let err = provider
            .submit(&request(), &reporter, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TryOnError::Network(_)));
        assert!(!err.to_string().contains("secret-key-123"));
        assert_eq!(status_of(&keys, "secret-key-123"), KeyStatus::Valid);
        assert_eq!(stream.drain().last().unwrap().stage, Stage::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_before_request() {
        let server = MockServer::start().await;
        let provider = provider(&server, pool(&[("key-a", KeyStatus::Unknown)]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = provider
            .submit(&request(), &ProgressReporter::noop(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, TryOnError::Cancelled));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verify_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .and(query_param("key", "good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"candidates": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .and(query_param("key", "bad"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "API key not valid. Please pass a valid API key."}
            })))
            .mount(&server)
            .await;

        let provider = provider(&server, pool(&[]));
        assert!(provider.verify_key("good").await.unwrap());
        assert!(!provider.verify_key("bad").await.unwrap());
    }
}

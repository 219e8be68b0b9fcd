//! Single entry point: validates a try-on job and hands it to the configured provider.

use crate::config::Settings;
use crate::error::{ImageRole, Result, TryOnError};
use crate::image::providers::{
    GoogleProvider, GrsaiProvider, DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT,
};
use crate::image::{EncodedImage, GenerationRequest, ImageReference, ProviderAdapter, ProviderKind};
use crate::keys::{KeyPool, KeyStatus};
use crate::progress::ProgressReporter;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The two images of a try-on job. Either may still be missing.
#[derive(Debug, Clone, Default)]
pub struct TryOnImages {
    /// The person to dress.
    pub subject: Option<EncodedImage>,
    /// The garment to put on them.
    pub garment: Option<EncodedImage>,
}

impl TryOnImages {
    /// Creates a job with both images present.
    pub fn new(subject: EncodedImage, garment: EncodedImage) -> Self {
        Self {
            subject: Some(subject),
            garment: Some(garment),
        }
    }

    /// Creates a job whose subject is the photo saved in `settings`, if any.
    pub fn from_settings(settings: &Settings, garment: Option<EncodedImage>) -> Self {
        Self {
            subject: settings.model_image.clone(),
            garment,
        }
    }

    /// Replaces the saved subject with one supplied for this job.
    pub fn with_subject(mut self, subject: EncodedImage) -> Self {
        self.subject = Some(subject);
        self
    }
}

/// Builder for `Dispatcher`.
#[derive(Debug, Clone)]
pub struct DispatcherBuilder {
    key_pool: Option<Arc<KeyPool>>,
    client: Option<reqwest::Client>,
    google_base_url: Option<String>,
    grsai_base_url: Option<String>,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            key_pool: None,
            client: None,
            google_base_url: None,
            grsai_base_url: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl DispatcherBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the credential pool used by the Google provider.
    pub fn key_pool(mut self, pool: Arc<KeyPool>) -> Self {
        self.key_pool = Some(pool);
        self
    }

    /// Shares an HTTP client across providers.
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Overrides the Google models endpoint.
    pub fn google_base_url(mut self, url: impl Into<String>) -> Self {
        self.google_base_url = Some(url.into());
        self
    }

    /// Overrides the Grsai host.
    pub fn grsai_base_url(mut self, url: impl Into<String>) -> Self {
        self.grsai_base_url = Some(url.into());
        self
    }

    /// Sets the delay between Grsai status polls.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the limit on Grsai polling.
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Builds the dispatcher. Without a pool, an empty in-memory one is used.
    pub fn build(self) -> Dispatcher {
        Dispatcher {
            key_pool: self
                .key_pool
                .unwrap_or_else(|| Arc::new(KeyPool::in_memory(Vec::<String>::new()))),
            client: self.client.unwrap_or_default(),
            google_base_url: self.google_base_url,
            grsai_base_url: self.grsai_base_url,
            poll_interval: self.poll_interval,
            poll_timeout: self.poll_timeout,
        }
    }
}

/// Routes try-on jobs to the configured provider.
///
/// One dispatcher serves any number of concurrent jobs. Each job gets its own
/// adapter; they share only the credential pool and the HTTP client.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    key_pool: Arc<KeyPool>,
    client: reqwest::Client,
    google_base_url: Option<String>,
    grsai_base_url: Option<String>,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher over `key_pool` with default endpoints.
    pub fn new(key_pool: Arc<KeyPool>) -> Self {
        Self::builder().key_pool(key_pool).build()
    }

    /// Creates a new `DispatcherBuilder`.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// The credential pool shared with the Google provider.
    pub fn key_pool(&self) -> &Arc<KeyPool> {
        &self.key_pool
    }

    /// Generates a try-on image with the provider named in `settings`.
    ///
    /// Progress for the job goes to `progress`. Every failure, including a
    /// failed precondition, ends the stream with exactly one `Failed` event.
    pub async fn generate(
        &self,
        settings: &Settings,
        images: &TryOnImages,
        progress: &ProgressReporter,
    ) -> Result<ImageReference> {
        self.generate_with_cancel(settings, images, progress, &CancellationToken::new())
            .await
    }

    /// Like [`generate`](Self::generate), aborting with [`TryOnError::Cancelled`]
    /// once `cancel` fires.
    pub async fn generate_with_cancel(
        &self,
        settings: &Settings,
        images: &TryOnImages,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ImageReference> {
        let result = self.dispatch(settings, images, progress, cancel).await;
        if let Err(e) = &result {
            tracing::debug!("try-on generation failed: {e}");
            progress.fail();
        }
        result
    }

    async fn dispatch(
        &self,
        settings: &Settings,
        images: &TryOnImages,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ImageReference> {
        let subject = images
            .subject
            .clone()
            .ok_or(TryOnError::MissingImage(ImageRole::Subject))?;
        let garment = images
            .garment
            .clone()
            .ok_or(TryOnError::MissingImage(ImageRole::Garment))?;
        let kind = settings.provider_kind()?;
        let adapter = self.adapter(kind, settings)?;

        let request = GenerationRequest::new(subject, garment, settings.ai_params.prompt.as_str())
            .with_temperature(settings.ai_params.temperature)
            .with_aspect_ratio(settings.aspect_ratio);

        tracing::info!(provider = adapter.name(), "starting try-on generation");
        adapter.submit(&request, progress, cancel).await
    }

    /// Builds the adapter for `kind`, failing if it has no usable credential.
    fn adapter(
        &self,
        kind: ProviderKind,
        settings: &Settings,
    ) -> Result<Box<dyn ProviderAdapter>> {
        match kind {
            ProviderKind::Google => {
                if !self.key_pool.has_usable()? {
                    return Err(TryOnError::NoAvailableKey);
                }
                Ok(Box::new(self.google()?))
            }
            ProviderKind::Grsai => {
                let key = settings.grsai_api_key.trim();
                if key.is_empty() {
                    return Err(TryOnError::NoAvailableKey);
                }
                let mut builder = GrsaiProvider::builder()
                    .api_key(key)
                    .client(self.client.clone())
                    .poll_interval(self.poll_interval)
                    .timeout(self.poll_timeout);
                if let Some(url) = &self.grsai_base_url {
                    builder = builder.base_url(url.as_str());
                }
                Ok(Box::new(builder.build()?))
            }
        }
    }

    fn google(&self) -> Result<GoogleProvider> {
        let mut builder = GoogleProvider::builder()
            .key_pool(Arc::clone(&self.key_pool))
            .client(self.client.clone());
        if let Some(url) = &self.google_base_url {
            builder = builder.base_url(url.as_str());
        }
        builder.build()
    }

    /// Checks every pool credential not yet known to be valid against Google.
    ///
    /// Returns the credentials whose status was decided.
    pub async fn verify_keys(&self) -> Result<Vec<(String, KeyStatus)>> {
        let provider = self.google()?;
        self.key_pool
            .verify_unconfirmed(|key| {
                let provider = &provider;
                async move { provider.verify_key(&key).await }
            })
            .await
    }
}

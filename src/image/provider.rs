//! Provider adapter trait and provider selection.

use crate::error::{ProviderFailure, Result, TryOnError};
use crate::image::types::{GenerationRequest, ImageReference};
use crate::progress::ProgressReporter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Back end kind, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Google Generative Language API: one synchronous request, credential pool.
    Google,
    /// Grsai draw API: submit a job, then poll for its result.
    Grsai,
}

impl ProviderKind {
    /// All provider kinds.
    pub const ALL: [Self; 2] = [Self::Google, Self::Grsai];

    /// Returns the configuration name of this provider.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Grsai => "grsai",
        }
    }

    /// Returns true if the provider draws credentials from the rotating key pool.
    pub fn uses_key_pool(&self) -> bool {
        matches!(self, Self::Google)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = TryOnError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| ProviderFailure::UnknownProvider(name.to_string()).into())
    }
}

/// A provider-specific implementation of the try-on generation protocol.
///
/// Implementations emit progress through `progress` and emit the terminal
/// `Failed` event themselves before returning an error.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Generates the try-on image.
    async fn submit(
        &self,
        request: &GenerationRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ImageReference>;

    /// Returns the kind of this provider.
    fn kind(&self) -> ProviderKind;

    /// Returns the name of this provider for display.
    fn name(&self) -> &str {
        match self.kind() {
            ProviderKind::Google => "Google Gemini",
            ProviderKind::Grsai => "Grsai Nano Banana",
        }
    }
}

/// Awaits `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TryOnError::Cancelled),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_from_str() {
        assert_eq!("google".parse::<ProviderKind>().unwrap(), ProviderKind::Google);
        assert_eq!(" Grsai ".parse::<ProviderKind>().unwrap(), ProviderKind::Grsai);

        let err = "midjourney".parse::<ProviderKind>().unwrap_err();
        assert!(matches!(
            err,
            TryOnError::Provider(ProviderFailure::UnknownProvider(ref name)) if name == "midjourney"
        ));
    }

    #[test]
    fn test_provider_kind_display() {
        assert_eq!(ProviderKind::Google.to_string(), "google");
        assert_eq!(ProviderKind::Grsai.to_string(), "grsai");
    }

    #[test]
    fn test_uses_key_pool() {
        assert!(ProviderKind::Google.uses_key_pool());
        assert!(!ProviderKind::Grsai.uses_key_pool());
    }

    #[tokio::test]
    async fn test_cancellable_prefers_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let result = cancellable(&token, async { 1 }).await;
        assert!(matches!(result, Err(TryOnError::Cancelled)));

        let live = CancellationToken::new();
        assert_eq!(cancellable(&live, async { 2 }).await.unwrap(), 2);
    }
}

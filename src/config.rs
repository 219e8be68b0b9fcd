//! User settings: provider choice, Grsai credential and generation parameters.

use crate::error::Result;
use crate::image::{AspectRatio, EncodedImage, GenerationRequest, ProviderKind};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default try-on prompt. `[garment]` marks where the garment is referenced.
pub const DEFAULT_PROMPT: &str = "A hyper-realistic full-body photo of a fashionable person \
wearing [garment], with a clean, simple background.";

/// Generation parameters forwarded to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiParams {
    /// Sampling temperature.
    pub temperature: f32,
    /// Instruction text.
    pub prompt: String,
}

impl Default for AiParams {
    fn default() -> Self {
        Self {
            temperature: GenerationRequest::DEFAULT_TEMPERATURE,
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }
}

/// Persisted user settings.
///
/// Every field has a default, so files written by older versions still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Provider name. Kept as text so an unknown value surfaces at dispatch.
    pub api_provider: String,
    /// Credential for the Grsai provider.
    pub grsai_api_key: String,
    /// Generation parameters.
    pub ai_params: AiParams,
    /// Output aspect ratio.
    pub aspect_ratio: AspectRatio,
    /// Saved photo of the person to dress, used when a job brings no subject.
    pub model_image: Option<EncodedImage>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_provider: ProviderKind::Google.as_str().to_string(),
            grsai_api_key: String::new(),
            ai_params: AiParams::default(),
            aspect_ratio: AspectRatio::default(),
            model_image: None,
        }
    }
}

impl Settings {
    /// Loads settings from a JSON file.
    ///
    /// A missing file yields defaults. So does an unreadable or corrupt one,
    /// after a warning.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), "could not read settings: {e}");
                return Self::default();
            }
        };

        if text.trim().is_empty() {
            return Self::default();
        }

        serde_json::from_str(&text).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), "ignoring corrupt settings: {e}");
            Self::default()
        })
    }

    /// Writes settings as pretty-printed JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Applies `TRYON_PROVIDER` and `GRSAI_API_KEY` from the environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let set = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(provider) = set("TRYON_PROVIDER") {
            self.api_provider = provider;
        }
        if let Some(key) = set("GRSAI_API_KEY") {
            self.grsai_api_key = key;
        }
        self
    }

    /// Resolves the configured provider.
    pub fn provider_kind(&self) -> Result<ProviderKind> {
        self.api_provider.parse()
    }
}

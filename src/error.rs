//! Error types for try-on generation.

use std::fmt;
use std::time::Duration;

/// Which of the two input images a precondition refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    /// The person wearing the garment.
    Subject,
    /// The garment to put on the subject.
    Garment,
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subject => write!(f, "subject"),
            Self::Garment => write!(f, "garment"),
        }
    }
}

/// Failures reported by (or about) a specific back end.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderFailure {
    /// The back end rejected the credential. The key has been marked invalid.
    #[error("credential rejected by provider")]
    InvalidKey,

    /// The configuration names a provider this crate does not know.
    #[error("unknown provider {0:?}")]
    UnknownProvider(String),

    /// Non-success HTTP response.
    #[error("HTTP {status}: {message}")]
    Api { status: u16, message: String },

    /// HTTP success, but the back end refused the job with an application code.
    #[error("job rejected with code {code}: {message}")]
    Rejected { code: i64, message: String },

    /// The remote job reached its failed state.
    #[error("job failed: {reason}")]
    JobFailed { reason: String },
}

/// Errors that can occur during try-on generation.
#[derive(Debug, thiserror::Error)]
pub enum TryOnError {
    /// The pool is empty or every credential is invalid.
    #[error("no usable credential available")]
    NoAvailableKey,

    /// A required input image was not supplied.
    #[error("missing {0} image")]
    MissingImage(ImageRole),

    /// An input image is not a `data:image/...;base64,` payload.
    #[error("invalid image format: {0}")]
    InvalidImageFormat(String),

    /// The back end refused the content.
    #[error("content blocked: {0}")]
    SafetyBlocked(String),

    /// The response was well-formed HTTP but not the shape we expect.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Transport failure.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The remote job did not finish in time.
    #[error("polling timed out after {0:?}")]
    PollTimeout(Duration),

    /// The remote job does not exist or has expired.
    #[error("task {0} not found or expired")]
    TaskNotFound(String),

    /// Provider-specific failure.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderFailure),

    /// The caller cancelled the generation.
    #[error("generation cancelled")]
    Cancelled,

    /// I/O error (credential store, settings file, saving output).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TryOnError {
    /// Returns true if the failure says nothing about the request itself,
    /// so submitting the same request again may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::PollTimeout(_)
                | Self::Provider(ProviderFailure::Api {
                    status: 500..=599,
                    ..
                })
        )
    }

    /// Returns true if this error invalidated the credential used.
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, Self::Provider(ProviderFailure::InvalidKey))
    }
}

/// Result type alias for try-on operations.
pub type Result<T> = std::result::Result<T, TryOnError>;

/// Maximum length of remote error text carried in errors.
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Cleans up error text returned by a back end.
///
/// Trims whitespace, masks any `key=` query value the back end echoes back,
/// and truncates overly long bodies.
pub(crate) fn sanitize_error_message(text: &str) -> String {
    let mut out = String::with_capacity(text.len().min(MAX_ERROR_MESSAGE_LEN));
    let mut rest = text.trim();

    while let Some(pos) = rest.find("key=") {
        out.push_str(&rest[..pos + 4]);
        out.push_str("***");
        rest = &rest[pos + 4..];
        let end = rest
            .find(|c: char| c == '&' || c == '"' || c == '\'' || c.is_whitespace())
            .unwrap_or(rest.len());
        rest = &rest[end..];
    }
    out.push_str(rest);

    if out.chars().count() > MAX_ERROR_MESSAGE_LEN {
        let truncated: String = out.chars().take(MAX_ERROR_MESSAGE_LEN).collect();
        return format!("{truncated}...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_transient() {
        assert!(TryOnError::PollTimeout(Duration::from_secs(120)).is_transient());
        assert!(TryOnError::Provider(ProviderFailure::Api {
            status: 503,
            message: "unavailable".into()
        })
        .is_transient());

        assert!(!TryOnError::NoAvailableKey.is_transient());
        assert!(!TryOnError::Provider(ProviderFailure::InvalidKey).is_transient());
        assert!(!TryOnError::TaskNotFound("t1".into()).is_transient());
        assert!(!TryOnError::Provider(ProviderFailure::Api {
            status: 400,
            message: "bad".into()
        })
        .is_transient());
    }

    #[test]
    fn test_is_invalid_key() {
        assert!(TryOnError::Provider(ProviderFailure::InvalidKey).is_invalid_key());
        assert!(!TryOnError::SafetyBlocked("SAFETY".into()).is_invalid_key());
    }

    #[test]
    fn test_error_display() {
        let err = TryOnError::Provider(ProviderFailure::Api {
            status: 404,
            message: "Not found".into(),
        });
        assert_eq!(err.to_string(), "provider error: HTTP 404: Not found");

        let err = TryOnError::MissingImage(ImageRole::Garment);
        assert_eq!(err.to_string(), "missing garment image");

        let err = TryOnError::Provider(ProviderFailure::UnknownProvider("dalle".into()));
        assert_eq!(err.to_string(), "provider error: unknown provider \"dalle\"");
    }

    #[test]
    fn test_sanitize_masks_key_query() {
        let msg = sanitize_error_message("  request to /models?key=AIzaSECRET&alt=json failed ");
        assert_eq!(msg, "request to /models?key=***&alt=json failed");
        assert!(!msg.contains("SECRET"));
    }

    #[test]
    fn test_sanitize_masks_every_occurrence() {
        let msg = sanitize_error_message("key=a key=b");
        assert_eq!(msg, "key=*** key=***");
    }

    #[test]
    fn test_sanitize_truncates() {
        let long = "x".repeat(MAX_ERROR_MESSAGE_LEN + 50);
        let msg = sanitize_error_message(&long);
        assert!(msg.ends_with("..."));
        assert_eq!(msg.chars().count(), MAX_ERROR_MESSAGE_LEN + 3);
    }
}

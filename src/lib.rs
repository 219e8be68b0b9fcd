#![warn(missing_docs)]
//! tryon - Virtual try-on image generation over interchangeable back ends.
//!
//! This crate dresses a subject photo in a garment photo by dispatching the
//! job to one of several image generation providers, while managing a rotating
//! pool of credentials and reporting uniform stage/percentage progress.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tryon::{Dispatcher, EncodedImage, KeyPool, ProgressReporter, Settings, TryOnImages};
//!
//! #[tokio::main]
//! async fn main() -> tryon::Result<()> {
//!     let pool = Arc::new(KeyPool::in_memory(["AIza-first", "AIza-second"]));
//!     let dispatcher = Dispatcher::new(pool);
//!
//!     let images = TryOnImages::new(
//!         EncodedImage::from_bytes(&std::fs::read("me.jpg")?)?,
//!         EncodedImage::from_bytes(&std::fs::read("jacket.png")?)?,
//!     );
//!
//!     let (progress, mut events) = ProgressReporter::channel();
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             println!("{event:?}");
//!         }
//!     });
//!
//!     let image = dispatcher
//!         .generate(&Settings::default(), &images, &progress)
//!         .await?;
//!     println!("{image}");
//!     Ok(())
//! }
//! ```
//!
//! # Providers
//!
//! - `google`: Gemini image models. One synchronous request; credentials come
//!   from the [`KeyPool`] and are invalidated when the API rejects them.
//! - `grsai`: Nano Banana draw API. Submits a job, then polls it until it
//!   succeeds, fails, or the poll timeout passes.
//!
//! # Features
//!
//! - `cli`: Command-line interface (default)

mod config;
mod dispatcher;
mod error;
pub mod image;
pub mod keys;
pub mod progress;

// Re-export error types at crate root
pub use error::{ImageRole, ProviderFailure, Result, TryOnError};

pub use config::{AiParams, Settings, DEFAULT_PROMPT};
pub use dispatcher::{Dispatcher, DispatcherBuilder, TryOnImages};

// Re-export commonly used image types
pub use image::{
    AspectRatio, EncodedImage, GenerationRequest, ImageFormat, ImageReference, InlineImage,
    ProviderAdapter, ProviderKind,
};

pub use image::providers::{
    GoogleModel, GoogleProvider, GoogleProviderBuilder, GrsaiModel, GrsaiProvider,
    GrsaiProviderBuilder,
};

pub use keys::{CredentialRecord, JsonFileKeyStore, KeyPool, KeyStatus, KeyStore};
pub use progress::{ProgressEvent, ProgressReporter, ProgressStream, Stage};

/// Re-exported so callers can cancel generations without a direct dependency.
pub use tokio_util::sync::CancellationToken;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{Result, TryOnError};
    pub use crate::image::{EncodedImage, ImageReference, ProviderAdapter, ProviderKind};
    pub use crate::keys::KeyPool;
    pub use crate::progress::{ProgressEvent, ProgressReporter, Stage};
    pub use crate::{Dispatcher, Settings, TryOnImages};
}

//! Try-on image generation: request types, the adapter trait and providers.

mod provider;
pub mod providers;
mod types;

pub use provider::{ProviderAdapter, ProviderKind};
pub use types::{
    AspectRatio, EncodedImage, GenerationRequest, ImageFormat, ImageReference, InlineImage,
};

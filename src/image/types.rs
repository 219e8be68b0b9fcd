//! Core types for try-on generation.

use crate::error::{ProviderFailure, Result, TryOnError};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// PNG format (lossless).
    #[default]
    Png,
    /// JPEG format (lossy).
    Jpeg,
    /// WebP format (modern, efficient).
    WebP,
}

impl ImageFormat {
    /// Returns the file extension for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::WebP => "webp",
        }
    }

    /// Returns the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::WebP => "image/webp",
        }
    }

    /// Attempts to detect format from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "webp" => Some(Self::WebP),
            _ => None,
        }
    }

    /// Attempts to detect format from a MIME type.
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        match mime.to_lowercase().as_str() {
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/webp" => Some(Self::WebP),
            _ => None,
        }
    }

    /// Detects image format from magic bytes.
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }

        // PNG: 89 50 4E 47 0D 0A 1A 0A
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(Self::Png);
        }

        // JPEG: FF D8 FF
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(Self::Jpeg);
        }

        // WebP: RIFF....WEBP
        if data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
            return Some(Self::WebP);
        }

        None
    }
}

/// Output aspect ratio requested from the back end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    /// Let the back end choose.
    #[default]
    #[serde(rename = "auto")]
    Auto,
    /// 1:1 square.
    #[serde(rename = "1:1")]
    Square,
    /// 16:9 landscape.
    #[serde(rename = "16:9")]
    Landscape,
    /// 9:16 portrait.
    #[serde(rename = "9:16")]
    Portrait,
    /// 4:3 standard landscape.
    #[serde(rename = "4:3")]
    Standard,
    /// 3:4 standard portrait.
    #[serde(rename = "3:4")]
    StandardPortrait,
    /// 3:2 photo landscape.
    #[serde(rename = "3:2")]
    Photo,
    /// 2:3 photo portrait.
    #[serde(rename = "2:3")]
    PhotoPortrait,
    /// 21:9 ultrawide.
    #[serde(rename = "21:9")]
    Ultrawide,
}

impl AspectRatio {
    /// All variants, in declaration order.
    pub const ALL: [Self; 9] = [
        Self::Auto,
        Self::Square,
        Self::Landscape,
        Self::Portrait,
        Self::Standard,
        Self::StandardPortrait,
        Self::Photo,
        Self::PhotoPortrait,
        Self::Ultrawide,
    ];

    /// Returns the aspect ratio as a string (e.g., "16:9").
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Square => "1:1",
            Self::Landscape => "16:9",
            Self::Portrait => "9:16",
            Self::Standard => "4:3",
            Self::StandardPortrait => "3:4",
            Self::Photo => "3:2",
            Self::PhotoPortrait => "2:3",
            Self::Ultrawide => "21:9",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ar| ar.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unsupported aspect ratio: {s}"))
    }
}

/// An image in portable encoded form: `data:image/<type>;base64,<payload>`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedImage(String);

impl EncodedImage {
    /// Wraps an encoded image string. Validation happens in [`parse`](Self::parse).
    pub fn new(data_url: impl Into<String>) -> Self {
        Self(data_url.into())
    }

    /// Encodes raw image bytes, detecting the format from magic bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let format = ImageFormat::from_magic_bytes(data).ok_or_else(|| {
            TryOnError::InvalidImageFormat("unrecognized image bytes".into())
        })?;
        Ok(InlineImage::from_bytes(format.mime_type(), data).into())
    }

    /// Returns the encoded string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the data URL into MIME type and base64 payload.
    pub fn parse(&self) -> Result<InlineImage> {
        let invalid = || {
            TryOnError::InvalidImageFormat("expected data:image/<type>;base64,<data>".into())
        };

        let rest = self.0.strip_prefix("data:").ok_or_else(invalid)?;
        let (mime_type, data) = rest.split_once(";base64,").ok_or_else(invalid)?;
        let subtype = mime_type.strip_prefix("image/").ok_or_else(invalid)?;
        let word = |c: char| c.is_ascii_alphanumeric() || c == '_';
        if subtype.is_empty() || !subtype.chars().all(word) {
            return Err(invalid());
        }
        if data.is_empty() {
            return Err(TryOnError::InvalidImageFormat("empty image payload".into()));
        }

        Ok(InlineImage {
            mime_type: mime_type.to_string(),
            data: data.to_string(),
        })
    }
}

impl fmt::Debug for EncodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head: String = self.0.chars().take(32).collect();
        write!(f, "EncodedImage({head}… {} bytes)", self.0.len())
    }
}

impl From<InlineImage> for EncodedImage {
    fn from(image: InlineImage) -> Self {
        Self(image.to_data_url())
    }
}

/// Base64 image data with its MIME type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineImage {
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
    /// Standard base64 payload.
    pub data: String,
}

impl InlineImage {
    /// Encodes raw bytes.
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Returns the image as a data URL.
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    /// Decodes the payload.
    pub fn decode(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| TryOnError::MalformedResponse(format!("invalid base64 image data: {e}")))
    }
}

/// Where a generated image can be found.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "generated image reference should be saved or displayed"]
pub enum ImageReference {
    /// Image returned inline by the back end.
    Inline(InlineImage),
    /// Image hosted by the back end.
    Remote(String),
}

impl ImageReference {
    /// Best guess at the image format.
    pub fn format(&self) -> Option<ImageFormat> {
        match self {
            Self::Inline(image) => ImageFormat::from_mime_type(&image.mime_type),
            Self::Remote(url) => url
                .split(['?', '#'])
                .next()
                .and_then(|path| path.rsplit('.').next())
                .and_then(ImageFormat::from_extension),
        }
    }

    /// Decodes inline image data. Returns `None` for remote images.
    pub fn inline_bytes(&self) -> Option<Result<Vec<u8>>> {
        match self {
            Self::Inline(image) => Some(image.decode()),
            Self::Remote(_) => None,
        }
    }

    /// Returns the image bytes, downloading remote images with `client`.
    pub async fn fetch(&self, client: &reqwest::Client) -> Result<Vec<u8>> {
        match self {
            Self::Inline(image) => image.decode(),
            Self::Remote(url) => {
                let response = client.get(url).send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(ProviderFailure::Api {
                        status: status.as_u16(),
                        message: "failed to download image".into(),
                    }
                    .into());
                }
                Ok(response.bytes().await?.to_vec())
            }
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline(image) => f.write_str(&image.to_data_url()),
            Self::Remote(url) => f.write_str(url),
        }
    }
}

/// A request to dress the subject in the garment.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    subject_image: EncodedImage,
    garment_image: EncodedImage,
    prompt: String,
    temperature: f32,
    aspect_ratio: Option<AspectRatio>,
}

impl GenerationRequest {
    /// Default sampling temperature.
    pub const DEFAULT_TEMPERATURE: f32 = 0.7;

    /// Creates a request with the default temperature and no aspect ratio.
    pub fn new(
        subject_image: EncodedImage,
        garment_image: EncodedImage,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            subject_image,
            garment_image,
            prompt: prompt.into(),
            temperature: Self::DEFAULT_TEMPERATURE,
            aspect_ratio: None,
        }
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the aspect ratio.
    pub fn with_aspect_ratio(mut self, ratio: AspectRatio) -> Self {
        self.aspect_ratio = Some(ratio);
        self
    }

    /// The person to dress.
    pub fn subject_image(&self) -> &EncodedImage {
        &self.subject_image
    }

    /// The garment to put on.
    pub fn garment_image(&self) -> &EncodedImage {
        &self.garment_image
    }

    /// The text prompt.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Sampling temperature.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Requested aspect ratio, if any.
    pub fn aspect_ratio(&self) -> Option<AspectRatio> {
        self.aspect_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: [u8; 12] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
    const JPEG_MAGIC: [u8; 12] = [0xFF, 0xD8, 0xFF, 0xE0, 0, 0, 0, 0, 0, 0, 0, 0];
    const WEBP_MAGIC: [u8; 12] = *b"RIFF\x00\x00\x00\x00WEBP";

    #[test]
    fn test_format_from_magic_bytes() {
        assert_eq!(
            ImageFormat::from_magic_bytes(&PNG_MAGIC),
            Some(ImageFormat::Png)
        );
        assert_eq!(
            ImageFormat::from_magic_bytes(&JPEG_MAGIC),
            Some(ImageFormat::Jpeg)
        );
        assert_eq!(
            ImageFormat::from_magic_bytes(&WEBP_MAGIC),
            Some(ImageFormat::WebP)
        );
        assert_eq!(ImageFormat::from_magic_bytes(b"short"), None);
    }

    #[test]
    fn test_format_from_mime_type() {
        assert_eq!(ImageFormat::from_mime_type("image/jpeg"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_mime_type("IMAGE/PNG"), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::from_mime_type("image/gif"), None);
    }

    #[test]
    fn test_aspect_ratio_round_trip_str() {
        for ar in AspectRatio::ALL {
            assert_eq!(ar.as_str().parse::<AspectRatio>().unwrap(), ar);
        }
        assert!("5:4".parse::<AspectRatio>().is_err());
        assert_eq!(
            serde_json::to_string(&AspectRatio::Landscape).unwrap(),
            "\"16:9\""
        );
    }

    #[test]
    fn test_encoded_image_parse() {
        let image = EncodedImage::new("data:image/png;base64,iVBORw0KGgo=");
        let inline = image.parse().unwrap();
        assert_eq!(inline.mime_type, "image/png");
        assert_eq!(inline.data, "iVBORw0KGgo=");
    }

    #[test]
    fn test_encoded_image_parse_rejects_non_images() {
        for bad in [
            "iVBORw0KGgo=",
            "data:text/plain;base64,aGk=",
            "data:image/png,rawdata",
            "data:image/;base64,aGk=",
            "data:image/svg+xml;base64,aGk=",
            "data:image/png;base64,",
        ] {
            let err = EncodedImage::new(bad).parse().unwrap_err();
            assert!(
                matches!(err, TryOnError::InvalidImageFormat(_)),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_encoded_image_from_bytes() {
        let image = EncodedImage::from_bytes(&JPEG_MAGIC).unwrap();
        assert!(image.as_str().starts_with("data:image/jpeg;base64,"));
        assert_eq!(image.parse().unwrap().decode().unwrap(), JPEG_MAGIC);

        assert!(matches!(
            EncodedImage::from_bytes(b"not an image at all"),
            Err(TryOnError::InvalidImageFormat(_))
        ));
    }

    #[test]
    fn test_image_reference_display() {
        let inline = ImageReference::Inline(InlineImage {
            mime_type: "image/png".into(),
            data: "AAAA".into(),
        });
        assert_eq!(inline.to_string(), "data:image/png;base64,AAAA");

        let remote = ImageReference::Remote("https://x/y.png".into());
        assert_eq!(remote.to_string(), "https://x/y.png");
    }

    #[test]
    fn test_image_reference_format() {
        let remote = ImageReference::Remote("https://cdn.example/out/y.webp?sig=abc".into());
        assert_eq!(remote.format(), Some(ImageFormat::WebP));

        let inline = ImageReference::Inline(InlineImage::from_bytes("image/jpeg", &JPEG_MAGIC));
        assert_eq!(inline.format(), Some(ImageFormat::Jpeg));
        assert_eq!(inline.inline_bytes().unwrap().unwrap(), JPEG_MAGIC);
        assert!(remote.inline_bytes().is_none());
    }

    #[test]
    fn test_inline_decode_rejects_bad_base64() {
        let image = InlineImage {
            mime_type: "image/png".into(),
            data: "!!!".into(),
        };
        assert!(matches!(
            image.decode(),
            Err(TryOnError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_generation_request_builder() {
        let subject = EncodedImage::new("data:image/png;base64,AAAA");
        let garment = EncodedImage::new("data:image/jpeg;base64,BBBB");
        let req = GenerationRequest::new(subject.clone(), garment.clone(), "wear it")
            .with_temperature(0.2)
            .with_aspect_ratio(AspectRatio::Portrait);

        assert_eq!(req.subject_image(), &subject);
        assert_eq!(req.garment_image(), &garment);
        assert_eq!(req.prompt(), "wear it");
        assert_eq!(req.temperature(), 0.2);
        assert_eq!(req.aspect_ratio(), Some(AspectRatio::Portrait));

        let default = GenerationRequest::new(subject, garment, "p");
        assert_eq!(default.temperature(), GenerationRequest::DEFAULT_TEMPERATURE);
        assert_eq!(default.aspect_ratio(), None);
    }
}

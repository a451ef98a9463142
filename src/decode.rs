// src/decode.rs
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::GrayImage;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("No image source provided")]
    MissingSource,
    #[error("Image payload is empty")]
    EmptyPayload,
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Unreadable image: {0}")]
    Image(#[from] image::ImageError),
    #[error("Unsupported image URL: {0}")]
    InvalidUrl(String),
    #[error("Image exceeds {0} bytes")]
    TooLarge(usize),
    #[error("Failed to download image: {0}")]
    Download(#[from] reqwest::Error),
}

/// Strips an optional data-URL header (`data:image/png;base64,`).
///
/// Anything up to and including the first comma is dropped.
pub fn strip_data_url(payload: &str) -> &str {
    match payload.split_once(',') {
        Some((_, encoded)) => encoded,
        None => payload,
    }
}

/// Decodes base64 text (with or without a data-URL header) into a single
/// channel canvas.
pub fn decode_base64(payload: &str) -> Result<GrayImage, DecodeError> {
    // Wrapped payloads carry line breaks; they are not part of the data.
    let encoded: String = strip_data_url(payload)
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if encoded.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }
    let bytes = STANDARD.decode(&encoded)?;
    decode_bytes(&bytes)
}

/// Decodes encoded image bytes (PNG, JPEG, ...) into 8-bit luma.
pub fn decode_bytes(bytes: &[u8]) -> Result<GrayImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }
    let image = image::load_from_memory(bytes)?;
    Ok(image.to_luma8())
}

/// Downloads `image_url` sources over http(s) with a deadline and a body cap.
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl ImageFetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self, reqwest::Error> {
        // The timeout covers connecting, headers and the whole body.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client, max_bytes })
    }

    /// Downloads an image and decodes it like [`decode_bytes`].
    pub async fn fetch(&self, url: &str) -> Result<GrayImage, DecodeError> {
        let parsed = reqwest::Url::parse(url).map_err(|_| DecodeError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DecodeError::InvalidUrl(url.to_string()));
        }

        let mut response = self.client.get(parsed).send().await?.error_for_status()?;
        if response.content_length().is_some_and(|len| len > self.max_bytes as u64) {
            return Err(DecodeError::TooLarge(self.max_bytes));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(DecodeError::TooLarge(self.max_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        decode_bytes(&body)
    }
}

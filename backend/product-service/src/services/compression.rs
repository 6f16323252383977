//! Image compression - produces the stored derivative of a source image
//!
//! Decodes the source (format taken from the declared content type, or
//! sniffed from the bytes when the type is missing, generic or wrong), downscales
//! it so neither side exceeds `max_dimension` while keeping the aspect
//! ratio, and re-encodes it with the configured codec.
//!
//! Decoding and encoding run under `spawn_blocking`.

use async_trait::async_trait;
use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageOutputFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Output codec of derivatives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Jpeg,
    Png,
}

impl Codec {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }
}

impl FromStr for Codec {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            other => Err(CompressionError::UnsupportedFormat(format!(
                "unknown output codec: {}",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CompressionConfig {
    pub codec: Codec,
    /// JPEG quality (1-100); ignored for PNG
    pub quality: u8,
    /// Maximum width or height in pixels
    pub max_dimension: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            codec: Codec::Jpeg,
            quality: 80,
            max_dimension: 1600,
        }
    }
}

/// A compressed derivative ready for upload
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedImage {
    pub data: Bytes,
    pub format: Codec,
    pub content_type: &'static str,
    pub extension: &'static str,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompressionError {
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("failed to encode image: {0}")]
    Encode(String),

    #[error("compression task failed: {0}")]
    TaskFailed(String),
}

/// Source bytes in, derivative out. Same input and config, same output.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Compressor: Send + Sync {
    async fn compress(
        &self,
        data: Bytes,
        content_type: Option<String>,
    ) -> Result<CompressedImage, CompressionError>;
}

/// `image`-crate backed compressor
#[derive(Clone, Debug)]
pub struct ImageCompressor {
    config: CompressionConfig,
}

impl ImageCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(CompressionConfig::default())
    }

    /// Blocking compression; call through [`Compressor::compress`] from async code.
    pub fn compress_blocking(
        &self,
        data: &[u8],
        content_type: Option<&str>,
    ) -> Result<CompressedImage, CompressionError> {
        let img = match declared_format(content_type)? {
            Some(format) => image::load_from_memory_with_format(data, format).or_else(|declared| {
                // Report the declared-format error if sniffing fails too
                debug!(?format, error = %declared, "Declared format did not decode, sniffing");
                image::load_from_memory(data).map_err(|_| declared)
            }),
            None => image::load_from_memory(data),
        }
        .map_err(|e| CompressionError::Decode(e.to_string()))?;

        let (orig_w, orig_h) = img.dimensions();
        let (new_w, new_h) = self.calculate_dimensions(orig_w, orig_h);

        let img = if (new_w, new_h) == (orig_w, orig_h) {
            img
        } else {
            img.resize_exact(new_w, new_h, FilterType::Triangle)
        };

        let data = self.encode(&img)?;

        debug!(
            original_width = orig_w,
            original_height = orig_h,
            width = new_w,
            height = new_h,
            size = data.len(),
            codec = ?self.config.codec,
            "Image compressed"
        );

        Ok(CompressedImage {
            data,
            format: self.config.codec,
            content_type: self.config.codec.content_type(),
            extension: self.config.codec.extension(),
            width: new_w,
            height: new_h,
        })
    }

    /// Fit within `max_dimension` keeping the aspect ratio; never upscale.
    fn calculate_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let max_dim = self.config.max_dimension.max(1);

        if width <= max_dim && height <= max_dim {
            return (width, height);
        }

        if width > height {
            let ratio = max_dim as f64 / width as f64;
            (max_dim, ((height as f64 * ratio).round() as u32).max(1))
        } else {
            let ratio = max_dim as f64 / height as f64;
            (((width as f64 * ratio).round() as u32).max(1), max_dim)
        }
    }

    fn encode(&self, img: &DynamicImage) -> Result<Bytes, CompressionError> {
        let mut buf = Vec::new();
        let mut cursor = Cursor::new(&mut buf);

        let written = match self.config.codec {
            Codec::Jpeg => {
                // JPEG has no alpha channel
                let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
                let quality = self.config.quality.clamp(1, 100);
                rgb.write_to(&mut cursor, ImageOutputFormat::Jpeg(quality))
            }
            Codec::Png => img.write_to(&mut cursor, ImageOutputFormat::Png),
        };
        written.map_err(|e| CompressionError::Encode(e.to_string()))?;

        Ok(Bytes::from(buf))
    }
}

/// Map a declared content type to a decoder.
///
/// `None` means "sniff the bytes": no type, a generic binary type, or an
/// image subtype this mapping does not list.
fn declared_format(content_type: Option<&str>) -> Result<Option<ImageFormat>, CompressionError> {
    let Some(raw) = content_type else {
        return Ok(None);
    };

    let mime = raw
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let format = match mime.as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(ImageFormat::Jpeg),
        "image/png" => Some(ImageFormat::Png),
        "image/gif" => Some(ImageFormat::Gif),
        "image/webp" => Some(ImageFormat::WebP),
        "image/bmp" => Some(ImageFormat::Bmp),
        "image/tiff" => Some(ImageFormat::Tiff),
        "" | "application/octet-stream" | "binary/octet-stream" => None,
        m if m.starts_with("image/") => None,
        other => {
            return Err(CompressionError::UnsupportedFormat(format!(
                "source is not an image ({})",
                other
            )))
        }
    };

    Ok(format)
}

#[async_trait]
impl Compressor for ImageCompressor {
    async fn compress(
        &self,
        data: Bytes,
        content_type: Option<String>,
    ) -> Result<CompressedImage, CompressionError> {
        let compressor = self.clone();

        tokio::task::spawn_blocking(move || {
            compressor.compress_blocking(&data, content_type.as_deref())
        })
        .await
        .map_err(|e| CompressionError::TaskFailed(e.to_string()))?
    }
}

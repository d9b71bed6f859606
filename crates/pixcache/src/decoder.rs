//! Scaled image decoding
//!
//! Decodes PNG, JPEG, GIF and WebP via the image crate. Oversized sources
//! are downsampled by an integer power of two so that the decoded raster
//! approximates a caller-supplied dimension bound; dividing both axes by
//! the same factor keeps the aspect ratio.

use std::io::Cursor;

use image::{DynamicImage, GenericImageView, ImageFormat as ImgFormat, ImageReader};

use crate::Error;

/// Supported image formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    WebP,
    Unknown,
}

impl ImageFormat {
    /// Detect format from magic bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        if data.len() < 8 {
            return Self::Unknown;
        }

        // PNG: 89 50 4E 47 0D 0A 1A 0A
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Self::Png;
        }

        // JPEG: FF D8 FF
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Self::Jpeg;
        }

        // GIF: GIF87a or GIF89a
        if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            return Self::Gif;
        }

        // WebP: RIFF....WEBP
        if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
            return Self::WebP;
        }

        Self::Unknown
    }

    /// Get format from file extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "png" => Self::Png,
            "jpg" | "jpeg" => Self::Jpeg,
            "gif" => Self::Gif,
            "webp" => Self::WebP,
            _ => Self::Unknown,
        }
    }

    /// Convert to image crate format
    fn to_image_format(self) -> Option<ImgFormat> {
        match self {
            Self::Png => Some(ImgFormat::Png),
            Self::Jpeg => Some(ImgFormat::Jpeg),
            Self::Gif => Some(ImgFormat::Gif),
            Self::WebP => Some(ImgFormat::WebP),
            Self::Unknown => None,
        }
    }
}

/// A decoded RGBA raster shared read-only with renderers
#[derive(Debug, Clone)]
pub struct DecodedImage {
    /// RGBA pixel data
    pub pixels: Vec<u8>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Original encoded format
    pub format: ImageFormat,
}

impl DecodedImage {
    /// Create from raw RGBA data
    pub fn from_rgba(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            pixels,
            width,
            height,
            format: ImageFormat::Unknown,
        }
    }

    /// Byte cost of the raster: row stride times height
    pub fn memory_size(&self) -> usize {
        self.pixels.len()
    }
}

/// Read intrinsic dimensions from the image header without decoding pixels
pub fn probe_dimensions(data: &[u8]) -> Result<(u32, u32), Error> {
    let reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;
    Ok(reader.into_dimensions()?)
}

/// Power-of-two divisor that brings `larger` closest to `max_size`
///
/// Rounds in log space, so a dimension up to ~1.41x over the bound still
/// decodes unscaled. Returns 1 when the image already fits.
pub fn sample_factor(larger: u32, max_size: u32) -> u32 {
    if max_size == 0 || larger <= max_size {
        return 1;
    }
    let exp = (f64::from(larger) / f64::from(max_size)).log2().round() as u32;
    1 << exp.min(31)
}

/// Decode an encoded image, downsampling when `max_size` bounds it
///
/// `None` decodes at full resolution. `Some(max)` probes the header first,
/// picks a power-of-two factor from the larger dimension, and scales both
/// axes down by it. Unreadable, corrupt and unsupported sources all
/// surface as an error; no partial image is ever returned.
pub fn decode_scaled(data: &[u8], max_size: Option<u32>) -> Result<DecodedImage, Error> {
    let format = ImageFormat::from_bytes(data);
    let img_format = format.to_image_format().ok_or(Error::UnsupportedFormat)?;

    let factor = match max_size {
        Some(max) => {
            let (width, height) = probe_dimensions(data)?;
            sample_factor(width.max(height), max)
        }
        None => 1,
    };

    let img = image::load(Cursor::new(data), img_format)?;
    let img = if factor > 1 {
        let (width, height) = img.dimensions();
        img.resize_exact(
            (width / factor).max(1),
            (height / factor).max(1),
            image::imageops::FilterType::Triangle,
        )
    } else {
        img
    };

    Ok(to_decoded(img, format))
}

fn to_decoded(img: DynamicImage, format: ImageFormat) -> DecodedImage {
    let (width, height) = img.dimensions();
    let rgba = img.into_rgba8();

    DecodedImage {
        pixels: rgba.into_raw(),
        width,
        height,
        format,
    }
}

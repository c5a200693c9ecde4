//! Frame-to-file encoding.

use std::fs;
use std::path::Path;

use image::{ColorType, ImageError};
use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};
use crate::pixel::PixelEncoding;
use crate::wire::{ChannelLayout, ConvertedFrameMetadata, FrameMetadata};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    #[default]
    Bmp,
    Png,
}

impl ImageFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().trim_start_matches('.').to_lowercase().as_str() {
            "bmp" => Some(Self::Bmp),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Bmp => "bmp",
            Self::Png => "png",
        }
    }

    fn codec(self) -> image::ImageFormat {
        match self {
            Self::Bmp => image::ImageFormat::Bmp,
            Self::Png => image::ImageFormat::Png,
        }
    }
}

fn save(
    path: &Path,
    pixels: &[u8],
    width: u32,
    height: u32,
    color: ColorType,
    format: ImageFormat,
) -> PipelineResult<()> {
    image::save_buffer_with_format(path, pixels, width, height, color, format.codec()).map_err(
        |e| match e {
            ImageError::IoError(io) => PipelineError::filesystem(path, io),
            other => PipelineError::from(other),
        },
    )
}

fn bgr_to_rgb(pixels: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(pixels.len());
    for px in pixels.chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    rgb
}

/// Write a canonical frame as an image.
pub fn save_converted(
    path: &Path,
    meta: &ConvertedFrameMetadata,
    pixels: &[u8],
    format: ImageFormat,
) -> PipelineResult<()> {
    meta.check_payload(pixels.len())?;
    match meta.channel_layout {
        ChannelLayout::Mono => save(path, pixels, meta.width, meta.height, ColorType::L8, format),
        ChannelLayout::Color3 => save(
            path,
            &bgr_to_rgb(pixels),
            meta.width,
            meta.height,
            ColorType::Rgb8,
            format,
        ),
    }
}

/// How an unconverted frame is archived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawArchive {
    /// Single 8-bit plane (mono or undemosaiced Bayer).
    Gray,
    /// Packed 8-bit colour; `swap` when the source is BGR.
    Color { swap: bool },
    /// Anything else is kept as the byte payload.
    Dump,
}

impl RawArchive {
    pub fn for_encoding(encoding: Option<PixelEncoding>) -> Self {
        match encoding {
            Some(enc) if enc.bytes_per_pixel() == 1 => Self::Gray,
            Some(PixelEncoding::Rgb8) => Self::Color { swap: false },
            Some(PixelEncoding::Bgr8) => Self::Color { swap: true },
            _ => Self::Dump,
        }
    }

    pub fn extension(self, format: ImageFormat) -> &'static str {
        match self {
            Self::Dump => "raw",
            _ => format.extension(),
        }
    }
}

/// Archive a frame as it came off the sensor.
pub fn save_raw(
    path: &Path,
    meta: &FrameMetadata,
    payload: &[u8],
    format: ImageFormat,
) -> PipelineResult<()> {
    let archive = RawArchive::for_encoding(meta.pixel_encoding());
    if archive == RawArchive::Dump {
        return fs::write(path, payload).map_err(|e| PipelineError::filesystem(path, e));
    }
    meta.check_payload(payload.len())?;

    let channels = if archive == RawArchive::Gray { 1 } else { 3 };
    let row_len = meta.width as usize * channels;
    let stride = row_len + meta.row_padding as usize;
    let mut packed = Vec::with_capacity(row_len * meta.height as usize);
    for row in payload.chunks(stride).take(meta.height as usize) {
        let row = &row[..row_len];
        match archive {
            RawArchive::Color { swap: true } => packed.extend_from_slice(&bgr_to_rgb(row)),
            _ => packed.extend_from_slice(row),
        }
    }

    let color = if channels == 1 {
        ColorType::L8
    } else {
        ColorType::Rgb8
    };
    save(path, &packed, meta.width, meta.height, color, format)
}

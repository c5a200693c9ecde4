//! Built-in conversion for Mono8, 8-bit Bayer and packed RGB/BGR sources.

use std::thread;

use bytes::Bytes;

use super::demosaic::{DemosaicMethod, Mosaic};
use crate::error::{PipelineError, PipelineResult};
use crate::pixel::{EncodingClass, Orientation, PixelEncoding};
use crate::wire::FrameMetadata;

/// Source rows as the converter sees them.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Geometry {
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub orientation: Orientation,
}

impl Geometry {
    pub fn of(meta: &FrameMetadata, encoding: PixelEncoding, orientation: Orientation) -> Self {
        Self {
            width: meta.width as usize,
            height: meta.height as usize,
            stride: encoding.row_stride(meta.width, meta.row_padding),
            orientation,
        }
    }

    /// Source row feeding output row `y`.
    pub fn source_row(&self, y: usize) -> usize {
        match self.orientation {
            Orientation::TopDown => y,
            Orientation::BottomUp => self.height - 1 - y,
        }
    }

    /// Pixel bytes of source row `sy`, padding excluded.
    pub fn row<'a>(&self, src: &'a [u8], sy: usize, bytes_per_pixel: usize) -> &'a [u8] {
        let start = sy * self.stride;
        &src[start..start + self.width * bytes_per_pixel]
    }
}

/// Allocate `height` output rows of `row_len` bytes and fill them with
/// `fill(y, row)`, split across up to `threads` scoped threads.
pub(crate) fn render_rows<F>(height: usize, row_len: usize, threads: usize, fill: F) -> Vec<u8>
where
    F: Fn(usize, &mut [u8]) + Sync,
{
    let mut out = vec![0u8; height * row_len];
    if height == 0 || row_len == 0 {
        return out;
    }
    let threads = threads.clamp(1, height);
    if threads == 1 {
        for (y, row) in out.chunks_exact_mut(row_len).enumerate() {
            fill(y, row);
        }
        return out;
    }

    let rows_per_chunk = (height + threads - 1) / threads;
    let fill = &fill;
    thread::scope(|scope| {
        for (chunk_idx, chunk) in out.chunks_mut(rows_per_chunk * row_len).enumerate() {
            scope.spawn(move || {
                let first = chunk_idx * rows_per_chunk;
                for (i, row) in chunk.chunks_exact_mut(row_len).enumerate() {
                    fill(first + i, row);
                }
            });
        }
    });
    out
}

/// Copy the first three channels of each pixel, optionally swapping the
/// first and third.
pub(crate) fn pack_bgr(src: &[u8], src_bpp: usize, swap: bool, out: &mut [u8]) {
    for (s, d) in src.chunks_exact(src_bpp).zip(out.chunks_exact_mut(3)) {
        if swap {
            d.copy_from_slice(&[s[2], s[1], s[0]]);
        } else {
            d.copy_from_slice(&s[..3]);
        }
    }
}

/// True when the payload already is the contiguous, top-down image.
pub(crate) fn is_contiguous(meta: &FrameMetadata, orientation: Orientation) -> bool {
    meta.row_padding == 0 && orientation == Orientation::TopDown
}

/// Software conversion engine.
#[derive(Clone, Debug, Default)]
pub struct SoftwareEngine {
    method: DemosaicMethod,
}

impl SoftwareEngine {
    pub fn new(method: DemosaicMethod) -> Self {
        Self { method }
    }

    pub fn method(&self) -> DemosaicMethod {
        self.method
    }

    /// Whether this engine handles `encoding` at all.
    pub fn supports(encoding: PixelEncoding) -> bool {
        match encoding.class() {
            EncodingClass::Mono | EncodingClass::BgrFamily | EncodingClass::RgbFamily => true,
            EncodingClass::Bayer(_) => encoding.bit_depth() == 8,
            EncodingClass::Other => false,
        }
    }

    /// Convert to 8-bit Mono or BGR. Pass-through classes return the
    /// payload itself when no repacking is needed.
    pub fn convert(
        &self,
        encoding: PixelEncoding,
        meta: &FrameMetadata,
        payload: &Bytes,
        orientation: Orientation,
    ) -> PipelineResult<Bytes> {
        let geo = Geometry::of(meta, encoding, orientation);
        let bpp = encoding.bytes_per_pixel();

        let out = match encoding.class() {
            EncodingClass::Mono => {
                if is_contiguous(meta, orientation) {
                    return Ok(payload.clone());
                }
                render_rows(geo.height, geo.width, 1, |y, row| {
                    row.copy_from_slice(geo.row(payload, geo.source_row(y), 1));
                })
            }
            EncodingClass::Bayer(pattern) => {
                if encoding.bit_depth() != 8 {
                    return Err(PipelineError::unsupported(
                        encoding.tag(),
                        format!("{} needs the delegated converter", encoding),
                    ));
                }
                let mosaic = Mosaic::new(payload, geo.width, geo.height, geo.stride, pattern);
                render_rows(geo.height, geo.width * 3, 1, |y, row| {
                    mosaic.demosaic_row(geo.source_row(y), self.method, row);
                })
            }
            EncodingClass::BgrFamily => {
                if bpp == 3 && is_contiguous(meta, orientation) {
                    return Ok(payload.clone());
                }
                render_rows(geo.height, geo.width * 3, 1, |y, row| {
                    pack_bgr(geo.row(payload, geo.source_row(y), bpp), bpp, false, row);
                })
            }
            EncodingClass::RgbFamily => render_rows(geo.height, geo.width * 3, 1, |y, row| {
                pack_bgr(geo.row(payload, geo.source_row(y), bpp), bpp, true, row);
            }),
            EncodingClass::Other => {
                return Err(PipelineError::unsupported(
                    encoding.tag(),
                    format!("{} has no software conversion", encoding),
                ))
            }
        };
        Ok(Bytes::from(out))
    }
}

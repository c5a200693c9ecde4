use bytes::Bytes;

use super::demosaic::{DemosaicMethod, Mosaic};
use super::software::{pack_bgr, render_rows, Geometry};
use crate::error::{PipelineError, PipelineResult};
use crate::pixel::{Orientation, PixelEncoding};
use crate::wire::FrameMetadata;

/// Delegated (vendor/hardware) pixel converter.
///
/// Output is 8-bit Mono for mono sources and interleaved BGR otherwise,
/// contiguous and top-down.
pub trait SdkConverter: Send + Sync {
    /// Converter identifier.
    fn name(&self) -> &str;

    /// Returns true when this converter can handle the source as described.
    fn is_capable(
        &self,
        encoding: PixelEncoding,
        row_padding: u32,
        orientation: Orientation,
    ) -> bool;

    /// Returns true when the source already is in the output format, so no
    /// conversion is needed.
    fn has_destination_format(
        &self,
        encoding: PixelEncoding,
        row_padding: u32,
        orientation: Orientation,
    ) -> bool {
        matches!(encoding, PixelEncoding::Mono8 | PixelEncoding::Bgr8)
            && row_padding == 0
            && orientation == Orientation::TopDown
    }

    fn convert(
        &self,
        encoding: PixelEncoding,
        meta: &FrameMetadata,
        payload: &Bytes,
        orientation: Orientation,
    ) -> PipelineResult<Bytes>;
}

/// Pure-Rust converter covering every known encoding, rows split across
/// `num_threads` threads.
#[derive(Clone, Debug)]
pub struct PortableSdkConverter {
    num_threads: usize,
    method: DemosaicMethod,
}

impl PortableSdkConverter {
    pub fn new(num_threads: usize, method: DemosaicMethod) -> Self {
        Self {
            num_threads: num_threads.max(1),
            method,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

impl Default for PortableSdkConverter {
    fn default() -> Self {
        Self::new(1, DemosaicMethod::EdgeAware)
    }
}

fn wide_to_u8(lo: u8, hi: u8, shift: u32) -> u8 {
    (u16::from_le_bytes([lo, hi]) >> shift).min(255) as u8
}

/// BT.601 limited-range YCbCr to BGR.
fn yuv_to_bgr(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clip = |v: i32| ((v + 128) >> 8).clamp(0, 255) as u8;
    [
        clip(298 * c + 516 * d),
        clip(298 * c - 100 * d - 208 * e),
        clip(298 * c + 409 * e),
    ]
}

impl SdkConverter for PortableSdkConverter {
    fn name(&self) -> &str {
        "portable"
    }

    fn is_capable(
        &self,
        encoding: PixelEncoding,
        row_padding: u32,
        _orientation: Orientation,
    ) -> bool {
        !(encoding.is_planar() && row_padding != 0)
    }

    fn convert(
        &self,
        encoding: PixelEncoding,
        meta: &FrameMetadata,
        payload: &Bytes,
        orientation: Orientation,
    ) -> PipelineResult<Bytes> {
        if !self.is_capable(encoding, meta.row_padding, orientation) {
            return Err(PipelineError::unsupported(
                encoding.tag(),
                "planar source with row padding",
            ));
        }
        if self.has_destination_format(encoding, meta.row_padding, orientation) {
            return Ok(payload.clone());
        }

        let geo = Geometry::of(meta, encoding, orientation);
        let bpp = encoding.bytes_per_pixel();
        let shift = encoding.bit_depth().saturating_sub(8);
        let threads = self.num_threads;
        let channels = if encoding.is_color() { 3 } else { 1 };
        let row_len = geo.width * channels;

        let out = match encoding {
            PixelEncoding::Mono8 => render_rows(geo.height, row_len, threads, |y, row| {
                row.copy_from_slice(geo.row(payload, geo.source_row(y), 1));
            }),
            PixelEncoding::Mono10 | PixelEncoding::Mono12 | PixelEncoding::Mono16 => {
                render_rows(geo.height, row_len, threads, |y, row| {
                    let src = geo.row(payload, geo.source_row(y), 2);
                    for (d, s) in row.iter_mut().zip(src.chunks_exact(2)) {
                        *d = wide_to_u8(s[0], s[1], shift);
                    }
                })
            }
            PixelEncoding::Bgr8 | PixelEncoding::Bgra8 => {
                render_rows(geo.height, row_len, threads, |y, row| {
                    pack_bgr(geo.row(payload, geo.source_row(y), bpp), bpp, false, row);
                })
            }
            PixelEncoding::Rgb8 | PixelEncoding::Rgba8 => {
                render_rows(geo.height, row_len, threads, |y, row| {
                    pack_bgr(geo.row(payload, geo.source_row(y), bpp), bpp, true, row);
                })
            }
            PixelEncoding::Yuv422 => render_rows(geo.height, row_len, threads, |y, row| {
                let src = geo.row(payload, geo.source_row(y), 2);
                for (x, px) in row.chunks_exact_mut(3).enumerate() {
                    let pair = (x / 2) * 4;
                    let luma = src[x * 2];
                    let u = src.get(pair + 1).copied().unwrap_or(128);
                    let v = src.get(pair + 3).copied().unwrap_or(128);
                    px.copy_from_slice(&yuv_to_bgr(luma, u, v));
                }
            }),
            PixelEncoding::Rgb8Planar => {
                let plane = geo.width * geo.height;
                render_rows(geo.height, row_len, threads, |y, row| {
                    let base = geo.source_row(y) * geo.width;
                    for (x, px) in row.chunks_exact_mut(3).enumerate() {
                        let i = base + x;
                        px.copy_from_slice(&[
                            payload[2 * plane + i],
                            payload[plane + i],
                            payload[i],
                        ]);
                    }
                })
            }
            bayer => {
                let Some(pattern) = bayer.bayer_pattern() else {
                    return Err(PipelineError::unsupported(bayer.tag(), "unknown layout"));
                };
                let mosaic = if bayer.bit_depth() == 8 {
                    Mosaic::new(payload, geo.width, geo.height, geo.stride, pattern)
                } else {
                    Mosaic::wide(
                        payload,
                        geo.width,
                        geo.height,
                        geo.stride,
                        pattern,
                        bayer.bit_depth(),
                    )
                };
                render_rows(geo.height, row_len, threads, |y, row| {
                    mosaic.demosaic_row(geo.source_row(y), self.method, row);
                })
            }
        };

        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(encoding: PixelEncoding, w: u32, h: u32, pad: u32) -> FrameMetadata {
        FrameMetadata {
            device_id: "cam".to_string(),
            sequence_id: 7,
            height: h,
            width: w,
            encoding: encoding.tag(),
            timestamp: 0,
            row_padding: pad,
            error_count: 0,
            buffer_size: encoding.frame_size(w, h, pad) as u64,
        }
    }

    #[test]
    fn mono12_is_scaled_down() {
        let conv = PortableSdkConverter::new(2, DemosaicMethod::Bilinear);
        let m = meta(PixelEncoding::Mono12, 2, 2, 0);
        let mut raw = Vec::new();
        for v in [0u16, 0x0100, 0x0800, 0x0FFF] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        let out = conv
            .convert(PixelEncoding::Mono12, &m, &Bytes::from(raw), Orientation::TopDown)
            .unwrap();
        assert_eq!(&out[..], &[0, 0x10, 0x80, 0xFF]);
    }

    #[test]
    fn planar_rgb_is_interleaved_as_bgr() {
        let conv = PortableSdkConverter::default();
        let m = meta(PixelEncoding::Rgb8Planar, 2, 1, 0);
        let payload = Bytes::from_static(&[1, 2, 3, 4, 5, 6]);
        let out = conv
            .convert(PixelEncoding::Rgb8Planar, &m, &payload, Orientation::TopDown)
            .unwrap();
        assert_eq!(&out[..], &[5, 3, 1, 6, 4, 2]);
        assert!(!conv.is_capable(PixelEncoding::Rgb8Planar, 4, Orientation::TopDown));
    }

    #[test]
    fn grey_yuv_stays_grey() {
        let conv = PortableSdkConverter::default();
        let m = meta(PixelEncoding::Yuv422, 2, 1, 0);
        let payload = Bytes::from_static(&[126, 128, 126, 128]);
        let out = conv
            .convert(PixelEncoding::Yuv422, &m, &payload, Orientation::TopDown)
            .unwrap();
        assert_eq!(out.len(), 6);
        assert!(out.iter().all(|&v| v == out[0]));
    }

    #[test]
    fn destination_format_passes_through() {
        let conv = PortableSdkConverter::default();
        assert!(conv.has_destination_format(PixelEncoding::Bgr8, 0, Orientation::TopDown));
        assert!(!conv.has_destination_format(PixelEncoding::Bgr8, 2, Orientation::TopDown));
        assert!(!conv.has_destination_format(PixelEncoding::Rgb8, 0, Orientation::TopDown));

        let m = meta(PixelEncoding::Mono8, 3, 1, 0);
        let payload = Bytes::from_static(&[9, 8, 7]);
        let out = conv
            .convert(PixelEncoding::Mono8, &m, &payload, Orientation::TopDown)
            .unwrap();
        assert_eq!(out.as_ptr(), payload.as_ptr());
    }

    #[test]
    fn wide_bayer_is_demosaiced() {
        let conv = PortableSdkConverter::new(3, DemosaicMethod::EdgeAware);
        let m = meta(PixelEncoding::BayerBg12, 4, 4, 0);
        let raw: Vec<u8> = (0..16).flat_map(|_| 0x0800u16.to_le_bytes()).collect();
        let out = conv
            .convert(PixelEncoding::BayerBg12, &m, &Bytes::from(raw), Orientation::BottomUp)
            .unwrap();
        assert_eq!(out.len(), 4 * 4 * 3);
        assert!(out.iter().all(|&v| v == 0x80));
    }
}

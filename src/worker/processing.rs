//! Per-frame processing routines run by pool workers.

use bytes::Bytes;

use crate::error::{PipelineError, PipelineResult};
use crate::wire::{ChannelLayout, ConvertedFrameMetadata};

/// Output of a processing routine.
#[derive(Clone, Debug)]
pub struct ProcessedFrame {
    pub meta: ConvertedFrameMetadata,
    pub pixels: Bytes,
}

/// A pure function of `(image, metadata)`.
///
/// One instance is shared by every worker, so implementations must not
/// keep per-frame mutable state.
pub trait FrameProcessor: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, meta: &ConvertedFrameMetadata, pixels: &[u8]) -> PipelineResult<ProcessedFrame>;
}

/// Optional consumer of processed frames.
pub trait ResultSink: Send + Sync {
    fn accept(&self, worker_id: usize, frame: ProcessedFrame);
}

/// Bounded iterative blur, colour mask, morphological open, invert.
///
/// Produces a single-channel image: 0 where the blurred pixel falls inside
/// `[lower, upper]` (after cleaning), 255 elsewhere.
#[derive(Clone, Debug)]
pub struct ReferenceProcessor {
    blur_iterations: u32,
    lower: [u8; 3],
    upper: [u8; 3],
}

impl ReferenceProcessor {
    pub const MAX_BLUR_ITERATIONS: u32 = 8;

    /// `lower`/`upper` are BGR bounds; mono frames use the first entry.
    pub fn new(blur_iterations: u32, lower: [u8; 3], upper: [u8; 3]) -> Self {
        Self {
            blur_iterations: blur_iterations.min(Self::MAX_BLUR_ITERATIONS),
            lower,
            upper,
        }
    }

    pub fn blur_iterations(&self) -> u32 {
        self.blur_iterations
    }
}

impl Default for ReferenceProcessor {
    fn default() -> Self {
        Self::new(3, [0, 0, 100], [80, 80, 255])
    }
}

impl FrameProcessor for ReferenceProcessor {
    fn name(&self) -> &str {
        "reference"
    }

    fn process(&self, meta: &ConvertedFrameMetadata, pixels: &[u8]) -> PipelineResult<ProcessedFrame> {
        meta.check_payload(pixels.len())
            .map_err(|e| PipelineError::Processing(e.to_string()))?;
        let (w, h, c) = (meta.width as usize, meta.height as usize, meta.channels());

        let mut image = pixels.to_vec();
        for _ in 0..self.blur_iterations {
            image = box_blur(&image, w, h, c);
        }
        let mask = in_range(&image, c, &self.lower[..c], &self.upper[..c]);
        let opened = dilate(&erode(&mask, w, h), w, h);
        let inverted: Vec<u8> = opened.iter().map(|v| 255 - v).collect();

        let mut out_meta = meta.clone();
        out_meta.channel_layout = ChannelLayout::Mono;
        Ok(ProcessedFrame {
            meta: out_meta,
            pixels: Bytes::from(inverted),
        })
    }
}

fn reflect(i: isize, len: usize) -> usize {
    let len = len as isize;
    if len <= 1 {
        return 0;
    }
    let i = if i < 0 { -i } else { i };
    let i = if i >= len { 2 * len - 2 - i } else { i };
    i.clamp(0, len - 1) as usize
}

/// 3x3 mean per channel.
fn box_blur(src: &[u8], w: usize, h: usize, c: usize) -> Vec<u8> {
    let mut out = vec![0u8; src.len()];
    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                let mut sum = 0u32;
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        let sx = reflect(x as isize + dx, w);
                        let sy = reflect(y as isize + dy, h);
                        sum += u32::from(src[(sy * w + sx) * c + ch]);
                    }
                }
                out[(y * w + x) * c + ch] = ((sum + 4) / 9) as u8;
            }
        }
    }
    out
}

fn in_range(src: &[u8], c: usize, lower: &[u8], upper: &[u8]) -> Vec<u8> {
    src.chunks_exact(c)
        .map(|px| {
            let inside = px
                .iter()
                .zip(lower.iter().zip(upper))
                .all(|(v, (lo, hi))| lo <= v && v <= hi);
            if inside {
                255
            } else {
                0
            }
        })
        .collect()
}

fn morph(src: &[u8], w: usize, h: usize, pick: fn(u8, u8) -> u8) -> Vec<u8> {
    let mut out = vec![0u8; src.len()];
    for y in 0..h {
        for x in 0..w {
            let mut acc = src[y * w + x];
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let sx = reflect(x as isize + dx, w);
                    let sy = reflect(y as isize + dy, h);
                    acc = pick(acc, src[sy * w + sx]);
                }
            }
            out[y * w + x] = acc;
        }
    }
    out
}

fn erode(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    morph(src, w, h, u8::min)
}

fn dilate(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    morph(src, w, h, u8::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ElementFormat;

    fn meta(w: u32, h: u32, layout: ChannelLayout) -> ConvertedFrameMetadata {
        ConvertedFrameMetadata {
            device_id: "cam".to_string(),
            sequence_id: 1,
            height: h,
            width: w,
            timestamp: 0,
            error_count: 0,
            channel_layout: layout,
            element_format: ElementFormat::U8,
        }
    }

    #[test]
    fn uniform_red_frame_is_fully_masked() {
        let p = ReferenceProcessor::default();
        let m = meta(6, 5, ChannelLayout::Color3);
        let red: Vec<u8> = (0..30).flat_map(|_| [10u8, 20, 200]).collect();
        let out = p.process(&m, &red).unwrap();
        assert_eq!(out.meta.channel_layout, ChannelLayout::Mono);
        assert_eq!(out.pixels.len(), 30);
        assert!(out.pixels.iter().all(|&v| v == 0));
    }

    #[test]
    fn isolated_speck_is_removed_by_opening() {
        let p = ReferenceProcessor::new(0, [200, 0, 0], [255, 0, 0]);
        let m = meta(7, 7, ChannelLayout::Mono);
        let mut img = vec![0u8; 49];
        img[3 * 7 + 3] = 250;
        let out = p.process(&m, &img).unwrap();
        assert!(out.pixels.iter().all(|&v| v == 255));
    }

    #[test]
    fn blur_is_bounded() {
        assert_eq!(
            ReferenceProcessor::new(1000, [0; 3], [255; 3]).blur_iterations(),
            ReferenceProcessor::MAX_BLUR_ITERATIONS
        );
    }

    #[test]
    fn wrong_size_is_a_processing_error() {
        let p = ReferenceProcessor::default();
        let err = p.process(&meta(2, 2, ChannelLayout::Mono), &[0u8; 3]).unwrap_err();
        assert!(matches!(err, PipelineError::Processing(_)));
    }
}

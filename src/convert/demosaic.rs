//! Bayer demosaicing to interleaved BGR.
//!
//! Every output pixel is computed from the mosaic alone, so rows can be
//! produced independently and in parallel. Borders use reflect-101
//! indexing, which keeps the CFA phase of mirrored neighbours intact.

use serde::Deserialize;

use crate::pixel::{BayerPattern, CfaColor};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemosaicMethod {
    /// Neighbour averaging.
    #[default]
    Bilinear,
    /// Gradient-directed green, colour-difference red/blue.
    EdgeAware,
    /// Bilinear followed by 3x3 smoothing of the chroma differences.
    NoiseAware,
}

impl DemosaicMethod {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "bilinear" => Some(Self::Bilinear),
            "edge_aware" | "edgeaware" | "vng" => Some(Self::EdgeAware),
            "noise_aware" | "noiseaware" | "ea" => Some(Self::NoiseAware),
            _ => None,
        }
    }
}

/// Read-only view of a single-channel mosaic.
pub struct Mosaic<'a> {
    data: &'a [u8],
    width: usize,
    height: usize,
    stride: usize,
    pattern: BayerPattern,
    /// 1 for 8-bit samples, 2 for little-endian 16-bit containers.
    sample_bytes: usize,
    /// Right shift bringing a sample down to 8 bits.
    shift: u32,
}

impl<'a> Mosaic<'a> {
    /// 8-bit mosaic.
    pub fn new(
        data: &'a [u8],
        width: usize,
        height: usize,
        stride: usize,
        pattern: BayerPattern,
    ) -> Self {
        Self {
            data,
            width,
            height,
            stride,
            pattern,
            sample_bytes: 1,
            shift: 0,
        }
    }

    /// Mosaic stored in 16-bit containers with `bit_depth` significant bits.
    pub fn wide(
        data: &'a [u8],
        width: usize,
        height: usize,
        stride: usize,
        pattern: BayerPattern,
        bit_depth: u32,
    ) -> Self {
        Self {
            sample_bytes: 2,
            shift: bit_depth.saturating_sub(8),
            ..Self::new(data, width, height, stride, pattern)
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    fn sample(&self, x: isize, y: isize) -> i32 {
        let x = reflect101(x, self.width);
        let y = reflect101(y, self.height);
        let at = y * self.stride + x * self.sample_bytes;
        if self.sample_bytes == 1 {
            i32::from(self.data[at])
        } else {
            let raw = u16::from_le_bytes([self.data[at], self.data[at + 1]]);
            i32::from(raw >> self.shift).min(255)
        }
    }

    fn color(&self, x: isize, y: isize) -> CfaColor {
        self.pattern
            .color_at(reflect101(x, self.width), reflect101(y, self.height))
    }

    /// Bilinear estimate as `[b, g, r]`.
    fn bilinear(&self, x: isize, y: isize) -> [i32; 3] {
        let s = |dx: isize, dy: isize| self.sample(x + dx, y + dy);
        let center = s(0, 0);
        let cross = (s(-1, 0) + s(1, 0) + s(0, -1) + s(0, 1) + 2) / 4;
        let diag = (s(-1, -1) + s(1, -1) + s(-1, 1) + s(1, 1) + 2) / 4;
        let horiz = (s(-1, 0) + s(1, 0) + 1) / 2;
        let vert = (s(0, -1) + s(0, 1) + 1) / 2;

        match self.color(x, y) {
            CfaColor::Red => [diag, cross, center],
            CfaColor::Blue => [center, cross, diag],
            CfaColor::Green => {
                if self.color(x + 1, y) == CfaColor::Red {
                    [vert, center, horiz]
                } else {
                    [horiz, center, vert]
                }
            }
        }
    }

    /// Green at any site, interpolated along the smoother direction.
    fn green(&self, x: isize, y: isize) -> i32 {
        if self.color(x, y) == CfaColor::Green {
            return self.sample(x, y);
        }
        let s = |dx: isize, dy: isize| self.sample(x + dx, y + dy);
        let c2 = 2 * s(0, 0);
        let lap_h = c2 - s(-2, 0) - s(2, 0);
        let lap_v = c2 - s(0, -2) - s(0, 2);
        let grad_h = (s(-1, 0) - s(1, 0)).abs() + lap_h.abs();
        let grad_v = (s(0, -1) - s(0, 1)).abs() + lap_v.abs();
        let est_h = (2 * (s(-1, 0) + s(1, 0)) + lap_h) / 4;
        let est_v = (2 * (s(0, -1) + s(0, 1)) + lap_v) / 4;
        let g = if grad_h < grad_v {
            est_h
        } else if grad_v < grad_h {
            est_v
        } else {
            (est_h + est_v + 1) / 2
        };
        g.clamp(0, 255)
    }

    /// Mean of `sample - green` over the given offsets.
    fn diff_mean(&self, x: isize, y: isize, offsets: &[(isize, isize)]) -> i32 {
        let sum: i32 = offsets
            .iter()
            .map(|&(dx, dy)| self.sample(x + dx, y + dy) - self.green(x + dx, y + dy))
            .sum();
        sum / offsets.len() as i32
    }

    fn edge_aware(&self, x: isize, y: isize) -> [i32; 3] {
        const HORIZ: [(isize, isize); 2] = [(-1, 0), (1, 0)];
        const VERT: [(isize, isize); 2] = [(0, -1), (0, 1)];
        const DIAG: [(isize, isize); 4] = [(-1, -1), (1, -1), (-1, 1), (1, 1)];

        let g = self.green(x, y);
        match self.color(x, y) {
            CfaColor::Red => [g + self.diff_mean(x, y, &DIAG), g, self.sample(x, y)],
            CfaColor::Blue => [self.sample(x, y), g, g + self.diff_mean(x, y, &DIAG)],
            CfaColor::Green => {
                let (red, blue) = if self.color(x + 1, y) == CfaColor::Red {
                    (&HORIZ, &VERT)
                } else {
                    (&VERT, &HORIZ)
                };
                [
                    g + self.diff_mean(x, y, blue),
                    g,
                    g + self.diff_mean(x, y, red),
                ]
            }
        }
    }

    fn noise_aware(&self, x: isize, y: isize) -> [i32; 3] {
        let g = self.bilinear(x, y)[1];
        let mut db = 0;
        let mut dr = 0;
        for dy in -1..=1 {
            for dx in -1..=1 {
                let [b, gn, r] = self.bilinear(x + dx, y + dy);
                db += b - gn;
                dr += r - gn;
            }
        }
        [g + db / 9, g, g + dr / 9]
    }

    /// Fill one BGR output row (`3 * width` bytes) from mosaic row `y`.
    pub fn demosaic_row(&self, y: usize, method: DemosaicMethod, out: &mut [u8]) {
        let y = y as isize;
        for (x, px) in out.chunks_exact_mut(3).take(self.width).enumerate() {
            let x = x as isize;
            let bgr = match method {
                DemosaicMethod::Bilinear => self.bilinear(x, y),
                DemosaicMethod::EdgeAware => self.edge_aware(x, y),
                DemosaicMethod::NoiseAware => self.noise_aware(x, y),
            };
            for (dst, v) in px.iter_mut().zip(bgr) {
                *dst = v.clamp(0, 255) as u8;
            }
        }
    }
}

/// Reflect an out-of-range index back into `0..len` without repeating the
/// border sample (`-1 -> 1`, `len -> len - 2`). Reflection repeats for taps
/// further out than the frame is wide, so the parity of `i` is kept and a
/// mirrored neighbour always has the same CFA colour.
fn reflect101(i: isize, len: usize) -> usize {
    let len = len as isize;
    if len <= 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let i = i.rem_euclid(period);
    (if i >= len { period - i } else { i }) as usize
}

/// Demosaic a whole frame into a contiguous BGR buffer, rows top to bottom.
pub fn demosaic(mosaic: &Mosaic<'_>, method: DemosaicMethod) -> Vec<u8> {
    let row_len = mosaic.width * 3;
    let mut out = vec![0u8; row_len * mosaic.height];
    for (y, row) in out.chunks_exact_mut(row_len.max(1)).enumerate() {
        mosaic.demosaic_row(y, method, row);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const METHODS: [DemosaicMethod; 3] = [
        DemosaicMethod::Bilinear,
        DemosaicMethod::EdgeAware,
        DemosaicMethod::NoiseAware,
    ];

    /// Mosaic of a uniform colour under `pattern`.
    fn flat(pattern: BayerPattern, w: usize, h: usize, bgr: [u8; 3]) -> Vec<u8> {
        let mut data = vec![0u8; w * h];
        for y in 0..h {
            for x in 0..w {
                data[y * w + x] = match pattern.color_at(x, y) {
                    CfaColor::Blue => bgr[0],
                    CfaColor::Green => bgr[1],
                    CfaColor::Red => bgr[2],
                };
            }
        }
        data
    }

    #[test]
    fn uniform_colour_is_reconstructed_exactly() {
        let bgr = [30u8, 140, 220];
        for pattern in [
            BayerPattern::Rggb,
            BayerPattern::Bggr,
            BayerPattern::Grbg,
            BayerPattern::Gbrg,
        ] {
            let data = flat(pattern, 8, 6, bgr);
            let mosaic = Mosaic::new(&data, 8, 6, 8, pattern);
            for method in METHODS {
                let out = demosaic(&mosaic, method);
                assert_eq!(out.len(), 8 * 6 * 3);
                for px in out.chunks_exact(3) {
                    assert_eq!(px, bgr, "{:?} {:?}", pattern, method);
                }
            }
        }
    }

    #[test]
    fn wide_samples_are_scaled_to_eight_bits() {
        // 12-bit value 0x0FF0 -> 0xFF
        let mut data = Vec::new();
        for _ in 0..16 {
            data.extend_from_slice(&0x0FF0u16.to_le_bytes());
        }
        let mosaic = Mosaic::wide(&data, 4, 4, 8, BayerPattern::Rggb, 12);
        let out = demosaic(&mosaic, DemosaicMethod::Bilinear);
        assert!(out.iter().all(|&v| v == 0xFF));
    }

    #[test]
    fn row_padding_is_skipped() {
        let w = 4;
        let stride = 6;
        let clean = flat(BayerPattern::Gbrg, w, 4, [10, 20, 30]);
        let mut padded = vec![255u8; stride * 4];
        for y in 0..4 {
            padded[y * stride..y * stride + w].copy_from_slice(&clean[y * w..(y + 1) * w]);
        }
        let mosaic = Mosaic::new(&padded, w, 4, stride, BayerPattern::Gbrg);
        let out = demosaic(&mosaic, DemosaicMethod::EdgeAware);
        assert!(out.chunks_exact(3).all(|px| px == [10, 20, 30]));
    }

    #[test]
    fn tiny_mosaics_keep_the_cfa_phase() {
        let bgr = [200u8, 90, 15];
        for (w, h) in [(2, 2), (2, 6), (6, 2), (3, 3)] {
            for pattern in [BayerPattern::Rggb, BayerPattern::Gbrg] {
                let data = flat(pattern, w, h, bgr);
                let mosaic = Mosaic::new(&data, w, h, w, pattern);
                for method in METHODS {
                    let out = demosaic(&mosaic, method);
                    for px in out.chunks_exact(3) {
                        assert_eq!(px, bgr, "{}x{} {:?} {:?}", w, h, pattern, method);
                    }
                }
            }
        }
    }

    #[test]
    fn reflect101_mirrors_without_repeating_border() {
        assert_eq!(reflect101(-1, 5), 1);
        assert_eq!(reflect101(-2, 5), 2);
        assert_eq!(reflect101(5, 5), 3);
        assert_eq!(reflect101(6, 5), 2);
        assert_eq!(reflect101(3, 1), 0);
        // Two samples wide: taps two and three out keep their parity.
        assert_eq!(reflect101(3, 2), 1);
        assert_eq!(reflect101(-3, 2), 1);
        assert_eq!(reflect101(2, 2), 0);
        assert_eq!(reflect101(-2, 2), 0);
    }

    #[test]
    fn method_names() {
        assert_eq!(DemosaicMethod::parse("edge_aware"), Some(DemosaicMethod::EdgeAware));
        assert_eq!(DemosaicMethod::parse("NoiseAware"), Some(DemosaicMethod::NoiseAware));
        assert_eq!(DemosaicMethod::parse("nearest"), None);
    }
}

//! Encode an RGB image into a sensor pixel encoding.

use crate::pixel::{CfaColor, PixelEncoding};

fn luma(rgb: &[u8]) -> u8 {
    let (r, g, b) = (u32::from(rgb[0]), u32::from(rgb[1]), u32::from(rgb[2]));
    ((77 * r + 150 * g + 29 * b) >> 8) as u8
}

/// BT.601 limited-range `(y, u, v)`.
fn rgb_to_yuv(rgb: &[u8]) -> (u8, u8, u8) {
    let (r, g, b) = (i32::from(rgb[0]), i32::from(rgb[1]), i32::from(rgb[2]));
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (
        y.clamp(0, 255) as u8,
        u.clamp(0, 255) as u8,
        v.clamp(0, 255) as u8,
    )
}

fn push_wide(out: &mut Vec<u8>, value: u8, bit_depth: u32) {
    let wide = u16::from(value) << bit_depth.saturating_sub(8);
    out.extend_from_slice(&wide.to_le_bytes());
}

/// Encode interleaved RGB8 (`width * height * 3` bytes) as a sensor frame
/// in `encoding`, with `row_padding` zero bytes after each row.
///
/// The result is exactly `encoding.frame_size(width, height, row_padding)`
/// bytes long.
pub fn encode_rgb(
    rgb: &[u8],
    width: u32,
    height: u32,
    encoding: PixelEncoding,
    row_padding: u32,
) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut out = Vec::with_capacity(encoding.frame_size(width, height, row_padding));

    if encoding.is_planar() {
        for channel in 0..3 {
            out.extend(rgb.chunks_exact(3).take(w * h).map(|px| px[channel]));
        }
        return out;
    }

    let bit_depth = encoding.bit_depth();
    for y in 0..h {
        let row = &rgb[y * w * 3..(y + 1) * w * 3];
        match encoding {
            PixelEncoding::Mono8 => out.extend(row.chunks_exact(3).map(luma)),
            PixelEncoding::Mono10 | PixelEncoding::Mono12 | PixelEncoding::Mono16 => {
                for px in row.chunks_exact(3) {
                    push_wide(&mut out, luma(px), bit_depth);
                }
            }
            PixelEncoding::Rgb8 => out.extend_from_slice(row),
            PixelEncoding::Bgr8 => {
                for px in row.chunks_exact(3) {
                    out.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
            PixelEncoding::Rgba8 => {
                for px in row.chunks_exact(3) {
                    out.extend_from_slice(&[px[0], px[1], px[2], 255]);
                }
            }
            PixelEncoding::Bgra8 => {
                for px in row.chunks_exact(3) {
                    out.extend_from_slice(&[px[2], px[1], px[0], 255]);
                }
            }
            PixelEncoding::Yuv422 => {
                for (x, px) in row.chunks_exact(3).enumerate() {
                    let (y_val, u, v) = rgb_to_yuv(px);
                    out.push(y_val);
                    out.push(if x % 2 == 0 { u } else { v });
                }
            }
            bayer => {
                let Some(pattern) = bayer.bayer_pattern() else {
                    continue;
                };
                for (x, px) in row.chunks_exact(3).enumerate() {
                    let value = match pattern.color_at(x, y) {
                        CfaColor::Red => px[0],
                        CfaColor::Green => px[1],
                        CfaColor::Blue => px[2],
                    };
                    if bit_depth == 8 {
                        out.push(value);
                    } else {
                        push_wide(&mut out, value, bit_depth);
                    }
                }
            }
        }
        out.resize(out.len() + row_padding as usize, 0);
    }
    out
}

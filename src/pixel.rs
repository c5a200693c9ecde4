//! Source pixel encodings and their classification.
//!
//! Tags follow the GenICam PFNC numbering so frames from real sensors keep
//! their native `encoding` value on the wire.

use std::fmt;

use serde::Deserialize;

/// Sensor pixel encodings the pipeline understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelEncoding {
    Mono8,
    Mono10,
    Mono12,
    Mono16,
    BayerGr8,
    BayerRg8,
    BayerGb8,
    BayerBg8,
    BayerGr12,
    BayerRg12,
    BayerGb12,
    BayerBg12,
    Rgb8,
    Bgr8,
    Rgba8,
    Bgra8,
    Yuv422,
    Rgb8Planar,
}

const TABLE: &[(PixelEncoding, i32, &str)] = &[
    (PixelEncoding::Mono8, 0x0108_0001, "Mono8"),
    (PixelEncoding::Mono10, 0x0110_0003, "Mono10"),
    (PixelEncoding::Mono12, 0x0110_0005, "Mono12"),
    (PixelEncoding::Mono16, 0x0110_0007, "Mono16"),
    (PixelEncoding::BayerGr8, 0x0108_0008, "BayerGR8"),
    (PixelEncoding::BayerRg8, 0x0108_0009, "BayerRG8"),
    (PixelEncoding::BayerGb8, 0x0108_000A, "BayerGB8"),
    (PixelEncoding::BayerBg8, 0x0108_000B, "BayerBG8"),
    (PixelEncoding::BayerGr12, 0x0110_0010, "BayerGR12"),
    (PixelEncoding::BayerRg12, 0x0110_0011, "BayerRG12"),
    (PixelEncoding::BayerGb12, 0x0110_0012, "BayerGB12"),
    (PixelEncoding::BayerBg12, 0x0110_0013, "BayerBG12"),
    (PixelEncoding::Rgb8, 0x0218_0014, "RGB8"),
    (PixelEncoding::Bgr8, 0x0218_0015, "BGR8"),
    (PixelEncoding::Rgba8, 0x0220_0016, "RGBa8"),
    (PixelEncoding::Bgra8, 0x0220_0017, "BGRa8"),
    (PixelEncoding::Yuv422, 0x0210_0032, "YUV422_8"),
    (PixelEncoding::Rgb8Planar, 0x0218_0021, "RGB8_Planar"),
];

impl PixelEncoding {
    pub const ALL: [PixelEncoding; 18] = [
        Self::Mono8,
        Self::Mono10,
        Self::Mono12,
        Self::Mono16,
        Self::BayerGr8,
        Self::BayerRg8,
        Self::BayerGb8,
        Self::BayerBg8,
        Self::BayerGr12,
        Self::BayerRg12,
        Self::BayerGb12,
        Self::BayerBg12,
        Self::Rgb8,
        Self::Bgr8,
        Self::Rgba8,
        Self::Bgra8,
        Self::Yuv422,
        Self::Rgb8Planar,
    ];

    pub fn from_tag(tag: i32) -> Option<Self> {
        TABLE.iter().find(|(_, t, _)| *t == tag).map(|(e, _, _)| *e)
    }

    pub fn tag(self) -> i32 {
        self.entry().1
    }

    pub fn name(self) -> &'static str {
        self.entry().2
    }

    /// Case-insensitive lookup by PFNC name (`"BayerRG8"`, `"mono8"`, ...).
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        TABLE
            .iter()
            .find(|(_, _, n)| n.eq_ignore_ascii_case(name))
            .map(|(e, _, _)| *e)
    }

    fn entry(self) -> &'static (PixelEncoding, i32, &'static str) {
        // every variant has a row
        TABLE
            .iter()
            .find(|(e, _, _)| *e == self)
            .unwrap_or(&TABLE[0])
    }

    /// Bytes per pixel in the unpacked layout the sensor delivers.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Mono8 | Self::BayerGr8 | Self::BayerRg8 | Self::BayerGb8 | Self::BayerBg8 => 1,
            Self::Mono10
            | Self::Mono12
            | Self::Mono16
            | Self::BayerGr12
            | Self::BayerRg12
            | Self::BayerGb12
            | Self::BayerBg12
            | Self::Yuv422 => 2,
            Self::Rgb8 | Self::Bgr8 | Self::Rgb8Planar => 3,
            Self::Rgba8 | Self::Bgra8 => 4,
        }
    }

    /// Significant bits per sample.
    pub fn bit_depth(self) -> u32 {
        match self {
            Self::Mono10 => 10,
            Self::Mono12
            | Self::BayerGr12
            | Self::BayerRg12
            | Self::BayerGb12
            | Self::BayerBg12 => 12,
            Self::Mono16 => 16,
            _ => 8,
        }
    }

    pub fn is_planar(self) -> bool {
        matches!(self, Self::Rgb8Planar)
    }

    /// Mono-class encodings produce single-channel output, everything else
    /// produces three channels.
    pub fn is_color(self) -> bool {
        !matches!(
            self,
            Self::Mono8 | Self::Mono10 | Self::Mono12 | Self::Mono16
        )
    }

    pub fn bayer_pattern(self) -> Option<BayerPattern> {
        match self {
            Self::BayerGr8 | Self::BayerGr12 => Some(BayerPattern::Grbg),
            Self::BayerRg8 | Self::BayerRg12 => Some(BayerPattern::Rggb),
            Self::BayerGb8 | Self::BayerGb12 => Some(BayerPattern::Gbrg),
            Self::BayerBg8 | Self::BayerBg12 => Some(BayerPattern::Bggr),
            _ => None,
        }
    }

    pub fn class(self) -> EncodingClass {
        match self {
            Self::Mono8 => EncodingClass::Mono,
            Self::Bgr8 | Self::Bgra8 => EncodingClass::BgrFamily,
            Self::Rgb8 | Self::Rgba8 => EncodingClass::RgbFamily,
            e => match e.bayer_pattern() {
                Some(pattern) => EncodingClass::Bayer(pattern),
                None => EncodingClass::Other,
            },
        }
    }

    /// Row stride in bytes including trailing padding.
    pub fn row_stride(self, width: u32, row_padding: u32) -> usize {
        if self.is_planar() {
            return width as usize;
        }
        width as usize * self.bytes_per_pixel() + row_padding as usize
    }

    /// Size of a full frame buffer in bytes.
    pub fn frame_size(self, width: u32, height: u32, row_padding: u32) -> usize {
        if self.is_planar() {
            return 3 * width as usize * height as usize;
        }
        self.row_stride(width, row_padding) * height as usize
    }
}

impl fmt::Display for PixelEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Conversion-relevant grouping of encodings, checked in this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodingClass {
    Mono,
    Bayer(BayerPattern),
    BgrFamily,
    RgbFamily,
    /// Multi-byte or planar formats only an SDK converter normalises.
    Other,
}

/// 2x2 colour filter array layouts, named by the top-left 2x2 block read
/// left-to-right, top-to-bottom.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BayerPattern {
    Rggb,
    Bggr,
    Grbg,
    Gbrg,
}

/// Colour sampled at a CFA site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfaColor {
    Red,
    Green,
    Blue,
}

impl BayerPattern {
    /// Colour of the filter covering pixel `(x, y)`.
    pub fn color_at(self, x: usize, y: usize) -> CfaColor {
        use CfaColor::*;
        let layout = match self {
            Self::Rggb => [[Red, Green], [Green, Blue]],
            Self::Bggr => [[Blue, Green], [Green, Red]],
            Self::Grbg => [[Green, Red], [Blue, Green]],
            Self::Gbrg => [[Green, Blue], [Red, Green]],
        };
        layout[y & 1][x & 1]
    }
}

/// Row order of the source buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    #[default]
    TopDown,
    BottomUp,
}

impl Orientation {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "top_down" | "topdown" => Some(Self::TopDown),
            "bottom_up" | "bottomup" => Some(Self::BottomUp),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip_and_are_unique() {
        for enc in PixelEncoding::ALL {
            assert_eq!(PixelEncoding::from_tag(enc.tag()), Some(enc));
            assert_eq!(PixelEncoding::parse(enc.name()), Some(enc));
        }
        assert_eq!(PixelEncoding::from_tag(0x7fff_0000), None);
        assert_eq!(PixelEncoding::parse("bayerrg8"), Some(PixelEncoding::BayerRg8));
    }

    #[test]
    fn classification_follows_family() {
        assert_eq!(PixelEncoding::Mono8.class(), EncodingClass::Mono);
        assert_eq!(
            PixelEncoding::BayerBg8.class(),
            EncodingClass::Bayer(BayerPattern::Bggr)
        );
        assert_eq!(PixelEncoding::Bgra8.class(), EncodingClass::BgrFamily);
        assert_eq!(PixelEncoding::Rgb8.class(), EncodingClass::RgbFamily);
        assert_eq!(PixelEncoding::Mono12.class(), EncodingClass::Other);
        assert_eq!(PixelEncoding::Yuv422.class(), EncodingClass::Other);
        assert!(!PixelEncoding::Mono16.is_color());
        assert!(PixelEncoding::BayerGr12.is_color());
    }

    #[test]
    fn frame_size_counts_row_padding() {
        assert_eq!(PixelEncoding::Mono8.frame_size(10, 4, 0), 40);
        assert_eq!(PixelEncoding::Mono8.frame_size(10, 4, 2), 48);
        assert_eq!(PixelEncoding::Bgra8.frame_size(3, 2, 4), 32);
        assert_eq!(PixelEncoding::Rgb8Planar.frame_size(5, 2, 0), 30);
    }

    #[test]
    fn cfa_layouts() {
        use CfaColor::*;
        assert_eq!(BayerPattern::Rggb.color_at(0, 0), Red);
        assert_eq!(BayerPattern::Rggb.color_at(1, 1), Blue);
        assert_eq!(BayerPattern::Grbg.color_at(1, 0), Red);
        assert_eq!(BayerPattern::Gbrg.color_at(0, 1), Red);
        assert_eq!(BayerPattern::Bggr.color_at(3, 3), Red);
    }
}

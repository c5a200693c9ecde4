//! Wire records carried as the first part of every frame message.
//!
//! Both records are bincode-encoded with fixed-width little-endian integers
//! in declaration order, so the layout is stable across builds and
//! languages that read it.

use bincode::Options;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::pixel::PixelEncoding;

/// Metadata records are tiny; anything bigger is a corrupt message.
const MAX_RECORD_SIZE: u64 = 64 * 1024;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_RECORD_SIZE)
}

/// Per-frame metadata published by a frame source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub device_id: String,
    pub sequence_id: i64,
    pub height: u32,
    pub width: u32,
    /// Source pixel encoding tag (see [`PixelEncoding`]).
    pub encoding: i32,
    /// Device clock, monotonic per device.
    pub timestamp: u64,
    /// Bytes of padding at the end of each row.
    pub row_padding: u32,
    pub error_count: u64,
    pub buffer_size: u64,
}

impl FrameMetadata {
    pub fn encode(&self) -> PipelineResult<Bytes> {
        Ok(Bytes::from(codec().serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> PipelineResult<Self> {
        Ok(codec().deserialize(bytes)?)
    }

    pub fn pixel_encoding(&self) -> Option<PixelEncoding> {
        PixelEncoding::from_tag(self.encoding)
    }

    /// Buffer size implied by geometry, encoding and padding.
    pub fn expected_buffer_size(&self) -> Option<u64> {
        self.pixel_encoding()
            .map(|enc| enc.frame_size(self.width, self.height, self.row_padding) as u64)
    }

    /// Check that `buffer_size` and the received payload agree with the
    /// frame geometry.
    pub fn check_payload(&self, payload_len: usize) -> PipelineResult<()> {
        let encoding = self.pixel_encoding().ok_or_else(|| {
            PipelineError::unsupported(self.encoding, "unknown encoding tag")
        })?;
        let expected = encoding.frame_size(self.width, self.height, self.row_padding);
        if self.buffer_size != expected as u64 || payload_len != expected {
            return Err(PipelineError::Codec(format!(
                "{} frame {}: {}x{} {} expects {} bytes, header says {}, payload has {}",
                self.device_id,
                self.sequence_id,
                self.width,
                self.height,
                encoding,
                expected,
                self.buffer_size,
                payload_len
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelLayout {
    Mono,
    /// Interleaved B, G, R.
    Color3,
}

impl ChannelLayout {
    pub fn channels(self) -> usize {
        match self {
            Self::Mono => 1,
            Self::Color3 => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementFormat {
    #[default]
    U8,
}

/// Metadata of a canonical (8-bit mono or BGR) frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertedFrameMetadata {
    pub device_id: String,
    pub sequence_id: i64,
    pub height: u32,
    pub width: u32,
    pub timestamp: u64,
    pub error_count: u64,
    pub channel_layout: ChannelLayout,
    pub element_format: ElementFormat,
}

impl ConvertedFrameMetadata {
    /// Carry identity fields over from the source record.
    pub fn from_source(source: &FrameMetadata, channel_layout: ChannelLayout) -> Self {
        Self {
            device_id: source.device_id.clone(),
            sequence_id: source.sequence_id,
            height: source.height,
            width: source.width,
            timestamp: source.timestamp,
            error_count: source.error_count,
            channel_layout,
            element_format: ElementFormat::U8,
        }
    }

    pub fn encode(&self) -> PipelineResult<Bytes> {
        Ok(Bytes::from(codec().serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> PipelineResult<Self> {
        Ok(codec().deserialize(bytes)?)
    }

    pub fn channels(&self) -> usize {
        self.channel_layout.channels()
    }

    /// Contiguous buffer size for this frame.
    pub fn buffer_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels()
    }

    pub fn check_payload(&self, payload_len: usize) -> PipelineResult<()> {
        if payload_len != self.buffer_len() {
            return Err(PipelineError::Codec(format!(
                "{} frame {}: expected {} bytes, payload has {}",
                self.device_id,
                self.sequence_id,
                self.buffer_len(),
                payload_len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FrameMetadata {
        FrameMetadata {
            device_id: "cam0".to_string(),
            sequence_id: 42,
            height: 4,
            width: 6,
            encoding: PixelEncoding::Bgr8.tag(),
            timestamp: 1_000,
            row_padding: 2,
            error_count: 0,
            buffer_size: 80,
        }
    }

    #[test]
    fn layout_is_fixed_width_in_field_order() {
        let bytes = sample().encode().unwrap();
        // u64 length prefix + "cam0", then sequence_id
        assert_eq!(&bytes[..8], &4u64.to_le_bytes());
        assert_eq!(&bytes[8..12], b"cam0");
        assert_eq!(&bytes[12..20], &42i64.to_le_bytes());
        assert_eq!(bytes.len(), 8 + 4 + 8 + 4 + 4 + 4 + 8 + 4 + 8 + 8);
        assert_eq!(FrameMetadata::decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn payload_check_uses_padding() {
        let meta = sample();
        assert_eq!(meta.expected_buffer_size(), Some(80));
        assert!(meta.check_payload(80).is_ok());
        assert!(meta.check_payload(72).is_err());

        let mut unknown = sample();
        unknown.encoding = 0x1234;
        assert!(matches!(
            unknown.check_payload(80),
            Err(PipelineError::UnsupportedEncoding { .. })
        ));
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(
            ConvertedFrameMetadata::decode(&[1, 2, 3]),
            Err(PipelineError::Codec(_))
        ));
    }

    #[test]
    fn converted_record_keeps_identity() {
        let converted = ConvertedFrameMetadata::from_source(&sample(), ChannelLayout::Color3);
        assert_eq!(converted.device_id, "cam0");
        assert_eq!(converted.buffer_len(), 72);
        let back = ConvertedFrameMetadata::decode(&converted.encode().unwrap()).unwrap();
        assert_eq!(back, converted);
    }
}

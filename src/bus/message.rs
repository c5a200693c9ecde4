use bytes::Bytes;

/// A topic plus an ordered list of parts, delivered as one unit.
///
/// Parts are `Bytes`, so fan-out to several subscribers shares the payload
/// allocation instead of copying it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Multipart {
    pub topic: Bytes,
    pub parts: Vec<Bytes>,
}

impl Multipart {
    pub fn new(topic: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            parts: Vec::new(),
        }
    }

    /// Two-part frame message: metadata record followed by the pixel buffer.
    pub fn frame(topic: impl Into<Bytes>, metadata: Bytes, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            parts: vec![metadata, payload],
        }
    }

    pub fn with_part(mut self, part: impl Into<Bytes>) -> Self {
        self.parts.push(part.into());
        self
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Total size in bytes, topic included.
    pub fn total_size(&self) -> usize {
        self.topic.len() + self.parts.iter().map(|p| p.len()).sum::<usize>()
    }

    /// Split a frame message into `(metadata, payload)`.
    ///
    /// Returns `None` unless the message has exactly two parts.
    pub fn into_frame(self) -> Option<(Bytes, Bytes)> {
        let mut parts = self.parts.into_iter();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(meta), Some(payload), None) => Some((meta, payload)),
            _ => None,
        }
    }

    pub(crate) fn matches(&self, filters: &[Bytes]) -> bool {
        filters.iter().any(|f| self.topic.starts_with(f))
    }
}

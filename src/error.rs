//! Error taxonomy shared by every pipeline stage.
//!
//! Startup failures (`Config`, `Transport` during bind/connect) propagate out of
//! `start()` and keep the owning stage from running. Steady-state failures are
//! logged by the stage loop and isolated to the frame that caused them.

use std::path::PathBuf;

use thiserror::Error;

use crate::bus::TransportError;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or invalid configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Bind/connect/send failure on the message bus.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The frame's pixel encoding cannot be converted on the selected path.
    #[error("unsupported encoding {encoding:#010x}: {reason}")]
    UnsupportedEncoding { encoding: i32, reason: String },

    /// Bucket/file creation, image write or rename failure.
    #[error("filesystem error on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Wire record or image (de)serialization failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// A worker's processing routine rejected the frame.
    #[error("processing error: {0}")]
    Processing(String),

    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn unsupported(encoding: i32, reason: impl Into<String>) -> Self {
        Self::UnsupportedEncoding {
            encoding,
            reason: reason.into(),
        }
    }

    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// True for failures that only affect the current frame.
    pub fn is_per_frame(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedEncoding { .. } | Self::Codec(_) | Self::Processing(_)
        )
    }
}

impl From<bincode::Error> for PipelineError {
    fn from(err: bincode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(err: image::ImageError) -> Self {
        Self::Codec(err.to_string())
    }
}

//! Frame Pipeline
//!
//! Acquisition and processing of image frames from industrial area-scan
//! sensors.
//!
//! # Architecture
//!
//! Stages are decoupled by an in-process/TCP message bus and each run on
//! their own threads:
//!
//! ```text
//! FrameSource -> bus(raw) -> FormatAdapter -> bus(converted) -> { StorageWriter, WorkerPool }
//!                   \------------------------------------------> StorageWriter (optional)
//! ```
//!
//! 1. **Source**: publishes `(FrameMetadata, payload)` in the sensor's pixel encoding.
//! 2. **Format adapter**: classifies the encoding and converts to 8-bit mono or BGR.
//! 3. **Storage writer**: archives frames into time-rotated buckets bounded by
//!    count and byte quotas, moving evicted data into a recycle bin.
//! 4. **Worker pool**: spreads converted frames over N workers, each frame
//!    processed exactly once.
//!
//! # Module Structure
//!
//! - `bus`: sockets, endpoints, multi-part messages
//! - `wire`: metadata records carried on the bus
//! - `pixel`: pixel encoding table and size math
//! - `convert`, `storage`, `worker`, `source`: the stages
//! - `runtime`: run flags, stage threads, counters
//! - `config`, `pipeline`: TOML configuration and stage wiring

pub mod bus;
pub mod config;
pub mod convert;
pub mod error;
pub mod pipeline;
pub mod pixel;
pub mod runtime;
pub mod source;
pub mod storage;
pub mod wire;
pub mod worker;

pub use bus::BusContext;
pub use config::PipelineConfig;
pub use convert::{FormatAdapter, FrameConverter};
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{Pipeline, PipelineStats};
pub use pixel::PixelEncoding;
pub use runtime::{StageStats, StatsSnapshot};
pub use source::FrameSource;
pub use storage::{BucketStore, StorageWriter};
pub use wire::{ConvertedFrameMetadata, FrameMetadata};
pub use worker::WorkerPool;

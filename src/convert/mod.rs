//! Format adapter: raw sensor frames in, canonical 8-bit Mono/BGR frames out.
//!
//! This module provides:
//! - `FrameConverter`: classification, path selection and conversion
//! - `FormatAdapter`: the stage loop between the raw and converted streams
//! - `SdkConverter`: seam for a delegated (vendor/hardware) converter
//! - software demosaicing (`DemosaicMethod`)
//!
//! A frame that cannot be converted is dropped, counted, and never
//! republished. The count is folded into `error_count` of every later
//! converted frame.

mod demosaic;
mod sdk;
mod software;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;

pub use demosaic::{demosaic, DemosaicMethod, Mosaic};
pub use sdk::{PortableSdkConverter, SdkConverter};
pub use software::SoftwareEngine;

use crate::bus::{BusContext, Multipart, Publisher, SocketOptions, Subscriber};
use crate::error::{PipelineError, PipelineResult};
use crate::pixel::{EncodingClass, Orientation, PixelEncoding};
use crate::runtime::{RunFlag, ScopeTimer, StageStats, StageThreads};
use crate::wire::{ChannelLayout, ConvertedFrameMetadata, FrameMetadata};

/// Which engine a deployment prefers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionEngine {
    #[default]
    Software,
    Delegated,
}

impl ConversionEngine {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "software" | "cv" => Some(Self::Software),
            "delegated" | "sdk" | "hardware" => Some(Self::Delegated),
            _ => None,
        }
    }
}

/// How one frame gets converted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionPath {
    /// The payload already is the canonical image.
    PassThrough,
    Software,
    Delegated,
}

/// Classification plus conversion, shared by the adapter loop and tests.
pub struct FrameConverter {
    software: SoftwareEngine,
    sdk: Option<Arc<dyn SdkConverter>>,
    engine: ConversionEngine,
    bayer_engine: ConversionEngine,
    orientation: Orientation,
    failures: AtomicU64,
}

impl FrameConverter {
    /// `bayer_engine` defaults to `Delegated` when an SDK converter is
    /// present and `Software` otherwise.
    pub fn new(
        engine: ConversionEngine,
        bayer_engine: Option<ConversionEngine>,
        demosaic: DemosaicMethod,
        orientation: Orientation,
        sdk: Option<Arc<dyn SdkConverter>>,
    ) -> Self {
        let bayer_engine = bayer_engine.unwrap_or(if sdk.is_some() {
            ConversionEngine::Delegated
        } else {
            ConversionEngine::Software
        });
        Self {
            software: SoftwareEngine::new(demosaic),
            sdk,
            engine,
            bayer_engine,
            orientation,
            failures: AtomicU64::new(0),
        }
    }

    pub fn software_only(demosaic: DemosaicMethod) -> Self {
        Self::new(
            ConversionEngine::Software,
            None,
            demosaic,
            Orientation::TopDown,
            None,
        )
    }

    /// Conversion failures so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn capable_sdk(&self, encoding: PixelEncoding, row_padding: u32) -> Option<&dyn SdkConverter> {
        self.sdk
            .as_deref()
            .filter(|sdk| sdk.is_capable(encoding, row_padding, self.orientation))
    }

    /// Pick the path for a source encoding.
    pub fn select_path(
        &self,
        encoding: PixelEncoding,
        row_padding: u32,
    ) -> PipelineResult<ConversionPath> {
        let class = encoding.class();
        let engine = match class {
            EncodingClass::Bayer(_) => self.bayer_engine,
            _ => self.engine,
        };

        if engine == ConversionEngine::Delegated || class == EncodingClass::Other {
            if let Some(sdk) = self.capable_sdk(encoding, row_padding) {
                if sdk.has_destination_format(encoding, row_padding, self.orientation) {
                    return Ok(ConversionPath::PassThrough);
                }
                return Ok(ConversionPath::Delegated);
            }
            if class == EncodingClass::Other {
                return Err(PipelineError::unsupported(
                    encoding.tag(),
                    format!("no capable converter for {}", encoding),
                ));
            }
        }
        Ok(ConversionPath::Software)
    }

    /// Convert one raw frame. Failures are counted.
    pub fn convert(
        &self,
        meta: &FrameMetadata,
        payload: &Bytes,
    ) -> PipelineResult<(ConvertedFrameMetadata, Bytes)> {
        match self.convert_inner(meta, payload) {
            Ok((layout, pixels)) => {
                let mut converted = ConvertedFrameMetadata::from_source(meta, layout);
                converted.error_count = meta.error_count.saturating_add(self.failures());
                Ok((converted, pixels))
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn convert_inner(
        &self,
        meta: &FrameMetadata,
        payload: &Bytes,
    ) -> PipelineResult<(ChannelLayout, Bytes)> {
        meta.check_payload(payload.len())?;
        let encoding = meta
            .pixel_encoding()
            .ok_or_else(|| PipelineError::unsupported(meta.encoding, "unknown encoding tag"))?;
        let layout = if encoding.is_color() {
            ChannelLayout::Color3
        } else {
            ChannelLayout::Mono
        };

        let pixels = match self.select_path(encoding, meta.row_padding)? {
            ConversionPath::PassThrough => payload.clone(),
            ConversionPath::Software => {
                self.software
                    .convert(encoding, meta, payload, self.orientation)?
            }
            ConversionPath::Delegated => match self.sdk.as_deref() {
                Some(sdk) => sdk.convert(encoding, meta, payload, self.orientation)?,
                None => {
                    return Err(PipelineError::unsupported(
                        meta.encoding,
                        "delegated path without converter",
                    ))
                }
            },
        };
        Ok((layout, pixels))
    }

    /// Decode a raw frame message and convert it.
    pub fn process(&self, msg: Multipart) -> PipelineResult<(ConvertedFrameMetadata, Bytes)> {
        let Some((meta_bytes, payload)) = msg.into_frame() else {
            self.record_failure();
            return Err(PipelineError::Codec("expected a two-part frame message".into()));
        };
        let meta = match FrameMetadata::decode(&meta_bytes) {
            Ok(meta) => meta,
            Err(e) => {
                self.record_failure();
                return Err(e);
            }
        };
        self.convert(&meta, &payload)
    }
}

/// Format adapter stage settings.
#[derive(Clone, Debug)]
pub struct AdapterConfig {
    pub name: String,
    /// Raw stream, connected.
    pub input: String,
    pub input_topic: String,
    /// Converted stream, bound.
    pub output: String,
    pub output_topic: String,
    pub engine: ConversionEngine,
    pub bayer_engine: Option<ConversionEngine>,
    pub demosaic: DemosaicMethod,
    pub orientation: Orientation,
    pub recv_timeout: Duration,
    pub input_socket: SocketOptions,
    pub output_socket: SocketOptions,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            name: "format_adapter".to_string(),
            input: "inproc://raw".to_string(),
            input_topic: String::new(),
            output: "inproc://converted".to_string(),
            output_topic: "converted".to_string(),
            engine: ConversionEngine::Software,
            bayer_engine: None,
            demosaic: DemosaicMethod::Bilinear,
            orientation: Orientation::TopDown,
            recv_timeout: Duration::from_millis(1000),
            input_socket: SocketOptions::default(),
            output_socket: SocketOptions::default(),
        }
    }
}

/// Stage between the raw and converted streams.
pub struct FormatAdapter {
    config: AdapterConfig,
    ctx: BusContext,
    converter: Arc<FrameConverter>,
    stats: Arc<StageStats>,
    run: RunFlag,
    threads: StageThreads,
}

impl FormatAdapter {
    pub fn new(
        config: AdapterConfig,
        ctx: BusContext,
        sdk: Option<Arc<dyn SdkConverter>>,
        stats: Arc<StageStats>,
    ) -> Self {
        let converter = Arc::new(FrameConverter::new(
            config.engine,
            config.bayer_engine,
            config.demosaic,
            config.orientation,
            sdk,
        ));
        let threads = StageThreads::new(config.name.clone());
        Self {
            config,
            ctx,
            converter,
            stats,
            run: RunFlag::new(),
            threads,
        }
    }

    pub fn converter(&self) -> &Arc<FrameConverter> {
        &self.converter
    }

    pub fn is_running(&self) -> bool {
        self.run.is_running()
    }

    /// Bind the converted stream, connect to the raw stream and start the
    /// conversion loop.
    pub fn start(&mut self) -> PipelineResult<()> {
        if self.run.is_running() {
            return Ok(());
        }
        let name = self.config.name.clone();
        let publisher = Publisher::bind(&self.ctx, &self.config.output, self.config.output_socket.clone())
            .map_err(|e| {
                log::error!("{}: cannot bind {}: {}", name, self.config.output, e);
                e
            })?;
        let subscriber = Subscriber::connect(&self.ctx, &self.config.input, self.config.input_socket.clone())
            .map_err(|e| {
                log::error!("{}: cannot connect {}: {}", name, self.config.input, e);
                e
            })?;
        subscriber.subscribe(self.config.input_topic.clone());

        self.run.start();
        let run = self.run.clone();
        let converter = Arc::clone(&self.converter);
        let stats = Arc::clone(&self.stats);
        let timeout = self.config.recv_timeout;
        let topic = Bytes::from(self.config.output_topic.clone());
        let loop_name = name.clone();
        let spawned = self.threads.spawn("convert", move || {
            conversion_loop(
                &loop_name, &run, &subscriber, &publisher, &converter, &stats, timeout, topic,
            );
            subscriber.close();
            publisher.close();
        });
        if let Err(e) = spawned {
            self.run.stop();
            return Err(e);
        }
        log::info!("{} started", name);
        Ok(())
    }

    pub fn stop(&mut self) {
        if !self.run.is_running() && self.threads.is_empty() {
            return;
        }
        log::info!("{} stopping...", self.config.name);
        self.run.stop();
        self.threads.join_all();
        log::info!(
            "{} stopped ({}, conversion failures={})",
            self.config.name,
            self.stats.snapshot(),
            self.converter.failures()
        );
    }
}

impl Drop for FormatAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn conversion_loop(
    name: &str,
    run: &RunFlag,
    subscriber: &Subscriber,
    publisher: &Publisher,
    converter: &FrameConverter,
    stats: &StageStats,
    timeout: Duration,
    topic: Bytes,
) {
    while run.is_running() {
        let msg = match subscriber.receive(timeout) {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(e) => {
                log::error!("{}: receive failed: {}", name, e);
                break;
            }
        };
        stats.record_received();

        let (meta, pixels) = {
            let _timer = ScopeTimer::new(format!("{} convert", name));
            match converter.process(msg) {
                Ok(converted) => converted,
                Err(e) => {
                    stats.record_error();
                    log::warn!("{}: frame dropped: {}", name, e);
                    continue;
                }
            }
        };

        let meta_bytes = match meta.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                stats.record_error();
                log::error!("{}: cannot encode metadata: {}", name, e);
                continue;
            }
        };
        match publisher.publish_frame(topic.clone(), meta_bytes, pixels) {
            Ok(report) => {
                stats.record_forwarded();
                stats.record_dropped(report.dropped as u64);
                log::trace!(
                    "{}: {} #{} -> {} subscriber(s)",
                    name,
                    meta.device_id,
                    meta.sequence_id,
                    report.delivered
                );
            }
            Err(e) => {
                stats.record_error();
                log::error!("{}: publish failed: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(encoding: PixelEncoding, w: u32, h: u32, pad: u32) -> (FrameMetadata, Bytes) {
        let size = encoding.frame_size(w, h, pad);
        let meta = FrameMetadata {
            device_id: "cam".to_string(),
            sequence_id: 3,
            height: h,
            width: w,
            encoding: encoding.tag(),
            timestamp: 99,
            row_padding: pad,
            error_count: 2,
            buffer_size: size as u64,
        };
        (meta, Bytes::from(vec![64u8; size]))
    }

    fn with_sdk(engine: ConversionEngine, bayer: Option<ConversionEngine>) -> FrameConverter {
        FrameConverter::new(
            engine,
            bayer,
            DemosaicMethod::Bilinear,
            Orientation::TopDown,
            Some(Arc::new(PortableSdkConverter::default())),
        )
    }

    #[test]
    fn bayer_defaults_to_delegation_when_sdk_present() {
        let conv = with_sdk(ConversionEngine::Software, None);
        assert_eq!(
            conv.select_path(PixelEncoding::BayerRg8, 0).unwrap(),
            ConversionPath::Delegated
        );
        assert_eq!(
            conv.select_path(PixelEncoding::Rgb8, 0).unwrap(),
            ConversionPath::Software
        );

        let conv = with_sdk(ConversionEngine::Software, Some(ConversionEngine::Software));
        assert_eq!(
            conv.select_path(PixelEncoding::BayerRg8, 0).unwrap(),
            ConversionPath::Software
        );
    }

    #[test]
    fn other_class_needs_a_capable_sdk() {
        let conv = FrameConverter::software_only(DemosaicMethod::Bilinear);
        assert!(conv.select_path(PixelEncoding::Yuv422, 0).is_err());

        let conv = with_sdk(ConversionEngine::Software, None);
        assert_eq!(
            conv.select_path(PixelEncoding::Yuv422, 0).unwrap(),
            ConversionPath::Delegated
        );
        // planar with padding: the portable converter declines
        assert!(conv.select_path(PixelEncoding::Rgb8Planar, 8).is_err());
    }

    #[test]
    fn delegated_destination_format_passes_through() {
        let conv = with_sdk(ConversionEngine::Delegated, None);
        assert_eq!(
            conv.select_path(PixelEncoding::Mono8, 0).unwrap(),
            ConversionPath::PassThrough
        );
        assert_eq!(
            conv.select_path(PixelEncoding::Mono8, 4).unwrap(),
            ConversionPath::Delegated
        );
    }

    #[test]
    fn failures_feed_error_count() {
        let conv = FrameConverter::software_only(DemosaicMethod::Bilinear);
        let (bad, payload) = raw(PixelEncoding::BayerGb12, 4, 4, 0);
        assert!(conv.convert(&bad, &payload).is_err());
        assert_eq!(conv.failures(), 1);

        let (meta, payload) = raw(PixelEncoding::BayerGb8, 4, 4, 0);
        let (converted, pixels) = conv.convert(&meta, &payload).unwrap();
        assert_eq!(converted.channel_layout, ChannelLayout::Color3);
        assert_eq!(converted.error_count, 3);
        assert_eq!(converted.timestamp, 99);
        assert_eq!(pixels.len(), 4 * 4 * 3);
    }

    #[test]
    fn device_error_count_saturates() {
        let conv = FrameConverter::software_only(DemosaicMethod::Bilinear);
        let (bad, payload) = raw(PixelEncoding::BayerGb12, 4, 4, 0);
        assert!(conv.convert(&bad, &payload).is_err());

        let (mut meta, payload) = raw(PixelEncoding::Mono8, 4, 4, 0);
        meta.error_count = u64::MAX;
        let (converted, _) = conv.convert(&meta, &payload).unwrap();
        assert_eq!(converted.error_count, u64::MAX);
    }

    #[test]
    fn malformed_messages_are_counted() {
        let conv = FrameConverter::software_only(DemosaicMethod::Bilinear);
        assert!(conv.process(Multipart::new("raw").with_part("x")).is_err());
        let garbage = Multipart::frame("raw", Bytes::from_static(b"xx"), Bytes::new());
        assert!(conv.process(garbage).is_err());
        assert_eq!(conv.failures(), 2);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let conv = FrameConverter::software_only(DemosaicMethod::Bilinear);
        let (meta, _) = raw(PixelEncoding::Mono8, 4, 4, 0);
        assert!(conv.convert(&meta, &Bytes::from(vec![0u8; 10])).is_err());
    }

    #[test]
    fn adapter_republishes_converted_frames() {
        let ctx = BusContext::new();
        let raw_pub = Publisher::bind(&ctx, "inproc://raw", SocketOptions::default()).unwrap();
        let mut adapter = FormatAdapter::new(
            AdapterConfig {
                recv_timeout: Duration::from_millis(20),
                ..AdapterConfig::default()
            },
            ctx.clone(),
            None,
            StageStats::new(),
        );
        adapter.start().unwrap();
        let out = Subscriber::connect(&ctx, "inproc://converted", SocketOptions::default()).unwrap();
        out.subscribe("converted");

        let (meta, payload) = raw(PixelEncoding::Rgb8, 2, 2, 0);
        raw_pub
            .publish_frame("raw", meta.encode().unwrap(), payload)
            .unwrap();

        let msg = out.receive(Duration::from_secs(2)).unwrap().unwrap();
        let (meta_bytes, pixels) = msg.into_frame().unwrap();
        let converted = ConvertedFrameMetadata::decode(&meta_bytes).unwrap();
        assert_eq!(converted.channel_layout, ChannelLayout::Color3);
        assert_eq!(pixels.len(), 12);
        adapter.stop();
        assert!(!adapter.is_running());
    }
}

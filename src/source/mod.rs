//! Frame sources.
//!
//! A source owns the (emulated) sensor and publishes `(FrameMetadata,
//! payload)` messages on the raw stream. The payload buffer is moved into
//! the publish call; downstream stages get their own reference to it.
//!
//! The set of source kinds is closed: [`FrameSource`] is resolved once from
//! configuration and dispatches `open`/`start`/`stop`/`set_parameter` to
//! the selected variant.

mod mosaic;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Deserialize;

pub use mosaic::encode_rgb;

use crate::bus::{BusContext, Publisher, SocketOptions};
use crate::error::{PipelineError, PipelineResult};
use crate::pixel::PixelEncoding;
use crate::runtime::{RunFlag, StageStats, StageThreads};
use crate::wire::FrameMetadata;

/// Which source variant a configuration selects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Synthetic,
    ImageFile,
}

impl SourceKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "synthetic" | "test_pattern" => Some(Self::Synthetic),
            "image_file" | "image" | "file" => Some(Self::ImageFile),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKind,
    pub device_id: String,
    /// Raw stream, bound.
    pub output: String,
    pub topic: String,
    pub encoding: PixelEncoding,
    /// Ignored by image-file sources, which take the image's size.
    pub width: u32,
    pub height: u32,
    pub row_padding: u32,
    pub fps: f64,
    /// Stop publishing after this many frames.
    pub max_frames: Option<u64>,
    /// Required by image-file sources.
    pub image_path: Option<PathBuf>,
    pub socket: SocketOptions,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: "frame_source".to_string(),
            kind: SourceKind::Synthetic,
            device_id: "cam0".to_string(),
            output: "inproc://raw".to_string(),
            topic: "raw".to_string(),
            encoding: PixelEncoding::BayerRg8,
            width: 640,
            height: 480,
            row_padding: 0,
            fps: 10.0,
            max_frames: None,
            image_path: None,
            socket: SocketOptions::default(),
        }
    }
}

/// A configured frame source.
pub enum FrameSource {
    Synthetic(SyntheticSource),
    ImageFile(ImageFileSource),
}

impl FrameSource {
    pub fn from_config(
        config: SourceConfig,
        ctx: BusContext,
        stats: Arc<StageStats>,
    ) -> PipelineResult<Self> {
        if !(config.fps.is_finite() && config.fps > 0.0) {
            return Err(PipelineError::config(format!(
                "{}: fps must be positive, got {}",
                config.name, config.fps
            )));
        }
        match config.kind {
            SourceKind::Synthetic => {
                if config.width == 0 || config.height == 0 {
                    return Err(PipelineError::config(format!(
                        "{}: frame size {}x{} is empty",
                        config.name, config.width, config.height
                    )));
                }
                Ok(Self::Synthetic(SyntheticSource {
                    capture: Capture::new(config, ctx, stats),
                }))
            }
            SourceKind::ImageFile => {
                let path = config.image_path.clone().ok_or_else(|| {
                    PipelineError::config(format!("{}: image_file source needs image_path", config.name))
                })?;
                Ok(Self::ImageFile(ImageFileSource {
                    capture: Capture::new(config, ctx, stats),
                    path,
                    rgb: None,
                }))
            }
        }
    }

    /// Acquire the device and bind the raw stream.
    pub fn open(&mut self) -> PipelineResult<()> {
        match self {
            Self::Synthetic(source) => source.open(),
            Self::ImageFile(source) => source.open(),
        }
    }

    /// Start publishing. Opens the source first if needed.
    pub fn start(&mut self) -> PipelineResult<()> {
        match self {
            Self::Synthetic(source) => source.start(),
            Self::ImageFile(source) => source.start(),
        }
    }

    pub fn stop(&mut self) {
        match self {
            Self::Synthetic(source) => source.capture.stop(),
            Self::ImageFile(source) => source.capture.stop(),
        }
    }

    /// Change a device parameter. Only allowed while stopped.
    ///
    /// Recognised keys: `fps`, `max_frames` (0 = unlimited), `encoding`,
    /// `row_padding`, `device_id`, and for synthetic sources `width` and
    /// `height`.
    pub fn set_parameter(&mut self, key: &str, value: &str) -> PipelineResult<()> {
        match self {
            Self::Synthetic(source) => match key {
                "width" => {
                    let width = parse_param::<u32>(&source.capture.config, key, value)?;
                    source.capture.guard_stopped(key)?;
                    source.capture.config.width = nonzero(&source.capture.config, key, width)?;
                    Ok(())
                }
                "height" => {
                    let height = parse_param::<u32>(&source.capture.config, key, value)?;
                    source.capture.guard_stopped(key)?;
                    source.capture.config.height = nonzero(&source.capture.config, key, height)?;
                    Ok(())
                }
                _ => source.capture.set_parameter(key, value),
            },
            Self::ImageFile(source) => match key {
                "width" | "height" => Err(PipelineError::config(format!(
                    "{}: {} is fixed by the image file",
                    source.capture.config.name, key
                ))),
                _ => source.capture.set_parameter(key, value),
            },
        }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.capture().config
    }

    pub fn is_running(&self) -> bool {
        self.capture().run.is_running()
    }

    /// Frames published since construction.
    pub fn frames_published(&self) -> u64 {
        self.capture().published.load(Ordering::Relaxed)
    }

    fn capture(&self) -> &Capture {
        match self {
            Self::Synthetic(source) => &source.capture,
            Self::ImageFile(source) => &source.capture,
        }
    }
}

/// Moving test pattern, rendered per frame in the configured encoding.
pub struct SyntheticSource {
    capture: Capture,
}

impl SyntheticSource {
    fn open(&mut self) -> PipelineResult<()> {
        self.capture.open()?;
        log::info!(
            "{}: synthetic {} {}x{} @ {} fps",
            self.capture.config.name,
            self.capture.config.encoding,
            self.capture.config.width,
            self.capture.config.height,
            self.capture.config.fps
        );
        Ok(())
    }

    fn start(&mut self) -> PipelineResult<()> {
        if self.capture.publisher.is_none() {
            self.open()?;
        }
        self.capture.start(Frames::TestPattern)
    }
}

/// Replays one still image, re-encoded into the sensor encoding.
pub struct ImageFileSource {
    capture: Capture,
    path: PathBuf,
    rgb: Option<Vec<u8>>,
}

impl ImageFileSource {
    fn open(&mut self) -> PipelineResult<()> {
        let image = image::open(&self.path).map_err(|e| {
            log::error!(
                "{}: cannot load {}: {}",
                self.capture.config.name,
                self.path.display(),
                e
            );
            PipelineError::from(e)
        })?;
        let rgb = image.to_rgb8();
        self.capture.config.width = rgb.width();
        self.capture.config.height = rgb.height();
        self.rgb = Some(rgb.into_raw());
        self.capture.open()?;
        log::info!(
            "{}: replaying {} as {} {}x{}",
            self.capture.config.name,
            self.path.display(),
            self.capture.config.encoding,
            self.capture.config.width,
            self.capture.config.height
        );
        Ok(())
    }

    fn start(&mut self) -> PipelineResult<()> {
        if self.capture.publisher.is_none() || self.rgb.is_none() {
            self.open()?;
        }
        let rgb = self.rgb.as_deref().ok_or_else(|| {
            PipelineError::config(format!("{}: image not loaded", self.capture.config.name))
        })?;
        let c = &self.capture.config;
        let still = encode_rgb(rgb, c.width, c.height, c.encoding, c.row_padding);
        self.capture.start(Frames::Still(Bytes::from(still)))
    }
}

enum Frames {
    TestPattern,
    /// Pre-encoded; every frame shares the same buffer.
    Still(Bytes),
}

impl Frames {
    fn render(&self, config: &SourceConfig, seq: u64) -> Bytes {
        match self {
            Self::Still(raw) => raw.clone(),
            Self::TestPattern => {
                let rgb = test_pattern(config.width, config.height, seq);
                Bytes::from(encode_rgb(
                    &rgb,
                    config.width,
                    config.height,
                    config.encoding,
                    config.row_padding,
                ))
            }
        }
    }
}

/// Horizontal ramp scrolling with `seq`, vertical ramp, checkerboard blue.
fn test_pattern(width: u32, height: u32, seq: u64) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let shift = (seq as usize).wrapping_mul(4);
    let mut rgb = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        for x in 0..w {
            let r = (((x + shift) % w) * 255 / w.max(1)) as u8;
            let g = (y * 255 / h.max(1)) as u8;
            let b = if (x / 32 + y / 32 + seq as usize) % 2 == 0 { 200 } else { 40 };
            rgb.extend_from_slice(&[r, g, b]);
        }
    }
    rgb
}

/// Publishing machinery shared by every source variant.
struct Capture {
    config: SourceConfig,
    ctx: BusContext,
    stats: Arc<StageStats>,
    run: RunFlag,
    threads: StageThreads,
    publisher: Option<Arc<Publisher>>,
    published: Arc<AtomicU64>,
    epoch: Instant,
}

impl Capture {
    fn new(config: SourceConfig, ctx: BusContext, stats: Arc<StageStats>) -> Self {
        let threads = StageThreads::new(config.name.clone());
        Self {
            config,
            ctx,
            stats,
            run: RunFlag::new(),
            threads,
            publisher: None,
            published: Arc::new(AtomicU64::new(0)),
            epoch: Instant::now(),
        }
    }

    fn open(&mut self) -> PipelineResult<()> {
        if self.publisher.is_some() {
            return Ok(());
        }
        let publisher = Publisher::bind(&self.ctx, &self.config.output, self.config.socket.clone())
            .map_err(|e| {
                log::error!("{}: cannot bind {}: {}", self.config.name, self.config.output, e);
                e
            })?;
        self.publisher = Some(Arc::new(publisher));
        Ok(())
    }

    fn start(&mut self, frames: Frames) -> PipelineResult<()> {
        if self.run.is_running() {
            return Ok(());
        }
        let publisher = self.publisher.clone().ok_or_else(|| {
            PipelineError::config(format!("{}: start before open", self.config.name))
        })?;
        self.run.start();
        let driver = Driver {
            config: self.config.clone(),
            publisher,
            frames,
            stats: Arc::clone(&self.stats),
            run: self.run.clone(),
            published: Arc::clone(&self.published),
            epoch: self.epoch,
        };
        if let Err(e) = self.threads.spawn("capture", move || driver.drive()) {
            self.run.stop();
            return Err(e);
        }
        log::info!("{} started", self.config.name);
        Ok(())
    }

    fn stop(&mut self) {
        if self.run.is_running() || !self.threads.is_empty() {
            log::info!("{} stopping...", self.config.name);
            self.run.stop();
            self.threads.join_all();
            log::info!("{} stopped ({})", self.config.name, self.stats.snapshot());
        }
        if let Some(publisher) = self.publisher.take() {
            publisher.close();
        }
    }

    fn guard_stopped(&self, key: &str) -> PipelineResult<()> {
        if self.run.is_running() {
            return Err(PipelineError::config(format!(
                "{}: cannot change {} while running",
                self.config.name, key
            )));
        }
        Ok(())
    }

    fn set_parameter(&mut self, key: &str, value: &str) -> PipelineResult<()> {
        match key {
            "fps" => {
                let fps = parse_param::<f64>(&self.config, key, value)?;
                if !(fps.is_finite() && fps > 0.0) {
                    return Err(PipelineError::config(format!(
                        "{}: fps must be positive, got {}",
                        self.config.name, value
                    )));
                }
                self.guard_stopped(key)?;
                self.config.fps = fps;
            }
            "max_frames" => {
                let max = parse_param::<u64>(&self.config, key, value)?;
                self.guard_stopped(key)?;
                self.config.max_frames = (max > 0).then_some(max);
            }
            "encoding" => {
                let encoding = PixelEncoding::parse(value).ok_or_else(|| {
                    PipelineError::config(format!(
                        "{}: unknown pixel encoding {:?}",
                        self.config.name, value
                    ))
                })?;
                self.guard_stopped(key)?;
                self.config.encoding = encoding;
            }
            "row_padding" => {
                let padding = parse_param::<u32>(&self.config, key, value)?;
                self.guard_stopped(key)?;
                self.config.row_padding = padding;
            }
            "device_id" => {
                self.guard_stopped(key)?;
                self.config.device_id = value.to_string();
            }
            _ => {
                return Err(PipelineError::config(format!(
                    "{}: unknown parameter {:?}",
                    self.config.name, key
                )))
            }
        }
        log::debug!("{}: {} = {}", self.config.name, key, value);
        Ok(())
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn parse_param<T: std::str::FromStr>(config: &SourceConfig, key: &str, value: &str) -> PipelineResult<T> {
    value.trim().parse().map_err(|_| {
        PipelineError::config(format!("{}: invalid {} {:?}", config.name, key, value))
    })
}

fn nonzero(config: &SourceConfig, key: &str, value: u32) -> PipelineResult<u32> {
    if value == 0 {
        return Err(PipelineError::config(format!("{}: {} must be non-zero", config.name, key)));
    }
    Ok(value)
}

/// The capture thread.
struct Driver {
    config: SourceConfig,
    publisher: Arc<Publisher>,
    frames: Frames,
    stats: Arc<StageStats>,
    run: RunFlag,
    published: Arc<AtomicU64>,
    epoch: Instant,
}

impl Driver {
    fn drive(self) {
        let period = Duration::from_secs_f64(1.0 / self.config.fps);
        let topic = Bytes::from(self.config.topic.clone());
        let mut deadline = Instant::now();

        while self.run.is_running() {
            let seq = self.published.load(Ordering::Relaxed);
            if self.config.max_frames.is_some_and(|max| seq >= max) {
                log::info!("{}: {} frames published, capture finished", self.config.name, seq);
                break;
            }

            let payload = self.frames.render(&self.config, seq);
            let meta = FrameMetadata {
                device_id: self.config.device_id.clone(),
                sequence_id: seq as i64,
                height: self.config.height,
                width: self.config.width,
                encoding: self.config.encoding.tag(),
                timestamp: self.epoch.elapsed().as_nanos() as u64,
                row_padding: self.config.row_padding,
                error_count: 0,
                buffer_size: payload.len() as u64,
            };
            let meta_bytes = match meta.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.stats.record_error();
                    log::error!("{}: cannot encode metadata: {}", self.config.name, e);
                    break;
                }
            };
            match self.publisher.publish_frame(topic.clone(), meta_bytes, payload) {
                Ok(report) => {
                    self.stats.record_forwarded();
                    if report.dropped > 0 {
                        self.stats.record_dropped(report.dropped as u64);
                    }
                    log::trace!("{}: frame {} published", self.config.name, seq);
                }
                Err(e) => {
                    self.stats.record_error();
                    log::warn!("{}: frame {} not published: {}", self.config.name, seq, e);
                }
            }
            self.published.fetch_add(1, Ordering::Relaxed);

            deadline += period;
            self.pace(&mut deadline);
        }
    }

    /// Sleep until `deadline` in short slices so `stop` stays responsive.
    fn pace(&self, deadline: &mut Instant) {
        let now = Instant::now();
        if *deadline <= now {
            *deadline = now;
            return;
        }
        while self.run.is_running() {
            let now = Instant::now();
            if now >= *deadline {
                break;
            }
            std::thread::sleep((*deadline - now).min(Duration::from_millis(50)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Subscriber;

    fn synthetic(output: &str) -> SourceConfig {
        SourceConfig {
            output: output.to_string(),
            width: 8,
            height: 4,
            fps: 200.0,
            max_frames: Some(5),
            ..SourceConfig::default()
        }
    }

    #[test]
    fn synthetic_publishes_well_formed_frames() {
        let ctx = BusContext::new();
        let sub = Subscriber::connect(&ctx, "inproc://raw.test", SocketOptions::default()).unwrap();
        sub.subscribe("");
        let mut source =
            FrameSource::from_config(synthetic("inproc://raw.test"), ctx.clone(), StageStats::new())
                .unwrap();
        source.start().unwrap();

        let mut seqs = Vec::new();
        while seqs.len() < 5 {
            let msg = sub.receive(Duration::from_secs(2)).unwrap().expect("frame");
            let (meta, payload) = msg.into_frame().unwrap();
            let meta = FrameMetadata::decode(&meta).unwrap();
            meta.check_payload(payload.len()).unwrap();
            assert_eq!(meta.pixel_encoding(), Some(PixelEncoding::BayerRg8));
            seqs.push(meta.sequence_id);
        }
        source.stop();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert_eq!(source.frames_published(), 5);
    }

    #[test]
    fn parameters_are_validated() {
        let ctx = BusContext::new();
        let mut source =
            FrameSource::from_config(synthetic("inproc://raw.params"), ctx.clone(), StageStats::new())
                .unwrap();
        source.set_parameter("encoding", "bgr8").unwrap();
        source.set_parameter("row_padding", "4").unwrap();
        source.set_parameter("max_frames", "0").unwrap();
        assert_eq!(source.config().encoding, PixelEncoding::Bgr8);
        assert_eq!(source.config().max_frames, None);
        assert!(source.set_parameter("fps", "-1").is_err());
        assert!(source.set_parameter("encoding", "jpeg").is_err());
        assert!(source.set_parameter("width", "0").is_err());
        assert!(source.set_parameter("exposure", "10").is_err());
    }

    #[test]
    fn parameters_are_frozen_while_running() {
        let ctx = BusContext::new();
        let mut config = synthetic("inproc://raw.frozen");
        config.max_frames = None;
        let mut source = FrameSource::from_config(config, ctx.clone(), StageStats::new()).unwrap();
        source.start().unwrap();
        let err = source.set_parameter("fps", "30").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        source.stop();
        source.set_parameter("fps", "30").unwrap();
    }

    #[test]
    fn image_file_requires_a_path() {
        let config = SourceConfig {
            kind: SourceKind::ImageFile,
            ..SourceConfig::default()
        };
        let err = FrameSource::from_config(config, BusContext::new(), StageStats::new()).err();
        assert!(matches!(err, Some(PipelineError::Config(_))));
    }

    #[test]
    fn image_file_takes_the_image_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        image::RgbImage::from_pixel(6, 3, image::Rgb([200, 10, 10]))
            .save(&path)
            .unwrap();

        let ctx = BusContext::new();
        let config = SourceConfig {
            kind: SourceKind::ImageFile,
            image_path: Some(path),
            output: "inproc://raw.still".to_string(),
            encoding: PixelEncoding::Mono8,
            ..SourceConfig::default()
        };
        let mut source = FrameSource::from_config(config, ctx, StageStats::new()).unwrap();
        source.open().unwrap();
        assert_eq!((source.config().width, source.config().height), (6, 3));
        assert!(source.set_parameter("width", "10").is_err());
    }

    #[test]
    fn test_pattern_has_rgb_size() {
        assert_eq!(test_pattern(10, 3, 7).len(), 90);
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use parking_lot::Mutex;
use serde::Deserialize;

use super::image_file::{save_converted, save_raw, ImageFormat, RawArchive};
use super::{BucketStore, StoreLimits};
use crate::bus::{BusContext, Multipart, SocketOptions, Subscriber};
use crate::error::{PipelineError, PipelineResult};
use crate::runtime::{RunFlag, ScopeTimer, StageStats, StageThreads};
use crate::wire::{ConvertedFrameMetadata, FrameMetadata};

/// Which streams the writer archives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteLevel {
    Off,
    /// Unconverted frames only.
    OnlySrc,
    /// Converted frames only.
    #[default]
    OnlyDst,
    Both,
}

impl WriteLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "off" | "none" => Some(Self::Off),
            "only_src" | "src" => Some(Self::OnlySrc),
            "only_dst" | "dst" => Some(Self::OnlyDst),
            "both" | "all" => Some(Self::Both),
            _ => None,
        }
    }

    pub fn writes_src(self) -> bool {
        matches!(self, Self::OnlySrc | Self::Both)
    }

    pub fn writes_dst(self) -> bool {
        matches!(self, Self::OnlyDst | Self::Both)
    }
}

#[derive(Clone, Debug)]
pub struct WriterConfig {
    pub name: String,
    pub root: PathBuf,
    pub recycle_bin: PathBuf,
    pub limits: StoreLimits,
    pub format: ImageFormat,
    pub level: WriteLevel,
    /// Raw stream endpoint (pre-conversion).
    pub raw_input: Option<String>,
    pub raw_topic: String,
    /// Converted stream endpoint.
    pub converted_input: Option<String>,
    pub converted_topic: String,
    pub recv_timeout: Duration,
    pub socket: SocketOptions,
}

impl WriterConfig {
    /// Defaults rooted at `root`, recycle bin at `<root>/recycle_bin`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            name: "storage_writer".to_string(),
            recycle_bin: root.join("recycle_bin"),
            root,
            limits: StoreLimits::default(),
            format: ImageFormat::Bmp,
            level: WriteLevel::OnlyDst,
            raw_input: None,
            raw_topic: String::new(),
            converted_input: Some("inproc://converted".to_string()),
            converted_topic: String::new(),
            recv_timeout: Duration::from_millis(1000),
            socket: SocketOptions::default(),
        }
    }
}

/// File name for a converted frame.
pub(crate) fn converted_file_name(meta: &ConvertedFrameMetadata, format: ImageFormat) -> String {
    format!(
        "{}_{:05}.{}",
        meta.device_id,
        meta.sequence_id,
        format.extension()
    )
}

/// File name for an unconverted frame.
pub(crate) fn raw_file_name(meta: &FrameMetadata, format: ImageFormat) -> String {
    let archive = RawArchive::for_encoding(meta.pixel_encoding());
    format!(
        "{}_{:05}_src.{}",
        meta.device_id,
        meta.sequence_id,
        archive.extension(format)
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stream {
    Raw,
    Converted,
}

impl Stream {
    fn label(self) -> &'static str {
        match self {
            Self::Raw => "src",
            Self::Converted => "dst",
        }
    }
}

/// Persists one or both frame streams into a rotating [`BucketStore`].
///
/// Both ingestion loops share the store behind one mutex, so `rotate` and
/// `write` never interleave.
pub struct StorageWriter {
    config: WriterConfig,
    ctx: BusContext,
    store: Arc<Mutex<BucketStore>>,
    stats: Arc<StageStats>,
    run: RunFlag,
    threads: StageThreads,
}

impl StorageWriter {
    /// Open (create) the storage root and recycle bin.
    pub fn new(
        config: WriterConfig,
        ctx: BusContext,
        stats: Arc<StageStats>,
    ) -> PipelineResult<Self> {
        if config.level.writes_src() && config.raw_input.is_none() {
            return Err(PipelineError::config(format!(
                "{}: write level {:?} needs a raw input endpoint",
                config.name, config.level
            )));
        }
        if config.level.writes_dst() && config.converted_input.is_none() {
            return Err(PipelineError::config(format!(
                "{}: write level {:?} needs a converted input endpoint",
                config.name, config.level
            )));
        }
        let store = BucketStore::open(&config.root, &config.recycle_bin, config.limits.clone())?;
        let threads = StageThreads::new(config.name.clone());
        Ok(Self {
            config,
            ctx,
            store: Arc::new(Mutex::new(store)),
            stats,
            run: RunFlag::new(),
            threads,
        })
    }

    pub fn store(&self) -> &Arc<Mutex<BucketStore>> {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.run.is_running()
    }

    pub fn start(&mut self) -> PipelineResult<()> {
        if self.run.is_running() {
            return Ok(());
        }
        let level = self.config.level;
        if level == WriteLevel::Off {
            log::info!("{}: write level off, not archiving", self.config.name);
            return Ok(());
        }

        let mut streams = Vec::new();
        if level.writes_src() {
            streams.push((Stream::Raw, self.config.raw_input.clone(), self.config.raw_topic.clone()));
        }
        if level.writes_dst() {
            streams.push((
                Stream::Converted,
                self.config.converted_input.clone(),
                self.config.converted_topic.clone(),
            ));
        }

        let mut subscribers = Vec::new();
        for (stream, endpoint, topic) in streams {
            let endpoint = endpoint.ok_or_else(|| {
                PipelineError::config(format!("{}: missing {} endpoint", self.config.name, stream.label()))
            })?;
            let sub = Subscriber::connect(&self.ctx, &endpoint, self.config.socket.clone())
                .map_err(|e| {
                    log::error!("{}: cannot connect {}: {}", self.config.name, endpoint, e);
                    e
                })?;
            sub.subscribe(topic);
            subscribers.push((stream, sub));
        }

        self.run.start();
        for (stream, sub) in subscribers {
            let ingest = Ingest {
                name: self.config.name.clone(),
                stream,
                format: self.config.format,
                timeout: self.config.recv_timeout,
                store: Arc::clone(&self.store),
                stats: Arc::clone(&self.stats),
                run: self.run.clone(),
            };
            if let Err(e) = self.threads.spawn(stream.label(), move || ingest.drive(sub)) {
                self.stop();
                return Err(e);
            }
        }
        log::info!(
            "{} started (level={:?}, root={})",
            self.config.name,
            level,
            self.config.root.display()
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        if !self.run.is_running() && self.threads.is_empty() {
            return;
        }
        log::info!("{} stopping...", self.config.name);
        self.run.stop();
        self.threads.join_all();
        log::info!("{} stopped ({})", self.config.name, self.stats.snapshot());
    }
}

impl Drop for StorageWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One ingestion loop.
struct Ingest {
    name: String,
    stream: Stream,
    format: ImageFormat,
    timeout: Duration,
    store: Arc<Mutex<BucketStore>>,
    stats: Arc<StageStats>,
    run: RunFlag,
}

impl Ingest {
    fn drive(self, sub: Subscriber) {
        while self.run.is_running() {
            let msg = match sub.receive(self.timeout) {
                Ok(Some(msg)) => msg,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("{}[{}]: receive failed: {}", self.name, self.stream.label(), e);
                    break;
                }
            };
            self.stats.record_received();
            match self.persist(msg) {
                Ok(path) => {
                    self.stats.record_forwarded();
                    log::trace!("{}: wrote {}", self.name, path.display());
                }
                Err(e) => {
                    self.stats.record_error();
                    match e {
                        PipelineError::Filesystem { .. } => {
                            log::error!("{}[{}]: {}", self.name, self.stream.label(), e)
                        }
                        _ => log::warn!("{}[{}]: frame skipped: {}", self.name, self.stream.label(), e),
                    }
                }
            }
        }
        sub.close();
    }

    fn persist(&self, msg: Multipart) -> PipelineResult<PathBuf> {
        let (meta_bytes, payload) = msg
            .into_frame()
            .ok_or_else(|| PipelineError::Codec("expected a two-part frame message".into()))?;
        let _timer = ScopeTimer::new(format!("{} write", self.name));
        let format = self.format;

        match self.stream {
            Stream::Converted => {
                let meta = ConvertedFrameMetadata::decode(&meta_bytes)?;
                meta.check_payload(payload.len())?;
                let file_name = converted_file_name(&meta, format);
                let mut store = self.store.lock();
                store.rotate(Local::now())?;
                store.write_with(&file_name, |path| save_converted(path, &meta, &payload, format))
            }
            Stream::Raw => {
                let meta = FrameMetadata::decode(&meta_bytes)?;
                let file_name = raw_file_name(&meta, format);
                let mut store = self.store.lock();
                store.rotate(Local::now())?;
                store.write_with(&file_name, |path| save_raw(path, &meta, &payload, format))
            }
        }
    }
}

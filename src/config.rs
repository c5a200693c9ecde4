use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bus::{DeliveryMode, SocketOptions};
use crate::convert::{AdapterConfig, ConversionEngine, DemosaicMethod};
use crate::pixel::{Orientation, PixelEncoding};
use crate::source::{SourceConfig, SourceKind};
use crate::storage::{ImageFormat, StoreLimits, WriteLevel, WriterConfig};
use crate::worker::PoolConfig;

const DEFAULT_STORAGE_ROOT: &str = "frames";
const DEFAULT_RECYCLE_BIN: &str = "recycle_bin";
const DEFAULT_MAX_ROTATIONS: usize = 10;
const DEFAULT_MAX_IMAGES: usize = 30_000;
const DEFAULT_MAX_DISK_USAGE_GB: f64 = 30.0;
const DEFAULT_ROTATION_INTERVAL_SECS: u64 = 1;
const DEFAULT_NUM_WORKERS: usize = 5;
const DEFAULT_RECV_TIMEOUT_MS: u64 = 1000;
const DEFAULT_HWM: usize = 1000;
const DEFAULT_SDK_THREADS: usize = 1;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    source: Option<SourceConfigFile>,
    adapter: Option<AdapterConfigFile>,
    writer: Option<WriterConfigFile>,
    processor: Option<ProcessorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SourceConfigFile {
    name: Option<String>,
    kind: Option<String>,
    device_id: Option<String>,
    output: Option<String>,
    topic: Option<String>,
    encoding: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    row_padding: Option<u32>,
    fps: Option<f64>,
    max_frames: Option<u64>,
    image_path: Option<PathBuf>,
    delivery: Option<String>,
    send_hwm: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AdapterConfigFile {
    name: Option<String>,
    input: Option<String>,
    input_topic: Option<String>,
    output: Option<String>,
    output_topic: Option<String>,
    engine: Option<String>,
    bayer_engine: Option<String>,
    demosaic: Option<String>,
    orientation: Option<String>,
    recv_timeout_ms: Option<u64>,
    delivery: Option<String>,
    send_hwm: Option<usize>,
    recv_hwm: Option<usize>,
    sdk: Option<SdkConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SdkConfigFile {
    num_threads: Option<usize>,
    demosaic: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct WriterConfigFile {
    name: Option<String>,
    root: Option<PathBuf>,
    recycle_bin: Option<PathBuf>,
    level: Option<String>,
    format: Option<String>,
    max_rotations: Option<usize>,
    max_images: Option<usize>,
    max_disk_usage_gb: Option<f64>,
    rotation_interval_secs: Option<u64>,
    raw_input: Option<String>,
    raw_topic: Option<String>,
    converted_input: Option<String>,
    converted_topic: Option<String>,
    recv_timeout_ms: Option<u64>,
    recv_hwm: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ProcessorConfigFile {
    name: Option<String>,
    input: Option<String>,
    input_topic: Option<String>,
    num_workers: Option<usize>,
    recv_timeout_ms: Option<u64>,
    queue_capacity: Option<usize>,
    blur_iterations: Option<u32>,
    lower: Option<[u8; 3]>,
    upper: Option<[u8; 3]>,
}

/// Fully resolved pipeline configuration. A `None` stage is disabled.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source: Option<SourceConfig>,
    pub adapter: Option<AdapterSettings>,
    pub writer: Option<WriterConfig>,
    pub processor: Option<ProcessorSettings>,
}

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub adapter: AdapterConfig,
    /// Present when `[adapter.sdk]` is configured.
    pub sdk: Option<SdkSettings>,
}

#[derive(Debug, Clone)]
pub struct SdkSettings {
    pub num_threads: usize,
    pub demosaic: DemosaicMethod,
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub pool: PoolConfig,
    pub blur_iterations: u32,
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

impl PipelineConfig {
    /// Read `path`, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let file = read_config_file(path)?;
        let mut cfg = Self::from_file(file)?;
        cfg.apply_env()?;
        cfg.resolve_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse TOML text without consulting the environment.
    pub fn parse(raw: &str) -> Result<Self> {
        let file: PipelineConfigFile = toml::from_str(raw).context("invalid pipeline config")?;
        let mut cfg = Self::from_file(file)?;
        cfg.resolve_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        Ok(Self {
            source: file.source.map(source_from_file).transpose()?,
            adapter: file.adapter.map(adapter_from_file).transpose()?,
            writer: file.writer.map(writer_from_file).transpose()?,
            processor: file.processor.map(processor_from_file),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var("PIPELINE_STORAGE_ROOT") {
            if !root.trim().is_empty() {
                match self.writer.as_mut() {
                    Some(writer) => writer.root = PathBuf::from(root),
                    None => log::warn!("PIPELINE_STORAGE_ROOT set but no [writer] section"),
                }
            }
        }
        if let Ok(workers) = std::env::var("PIPELINE_NUM_WORKERS") {
            let workers: usize = workers
                .trim()
                .parse()
                .map_err(|_| anyhow!("PIPELINE_NUM_WORKERS must be a non-negative integer"))?;
            match self.processor.as_mut() {
                Some(processor) => processor.pool.num_workers = workers,
                None => log::warn!("PIPELINE_NUM_WORKERS set but no [processor] section"),
            }
        }
        if let Ok(level) = std::env::var("PIPELINE_WRITE_LEVEL") {
            let level = WriteLevel::parse(&level)
                .ok_or_else(|| anyhow!("PIPELINE_WRITE_LEVEL: unknown write level {:?}", level))?;
            match self.writer.as_mut() {
                Some(writer) => writer.level = level,
                None => log::warn!("PIPELINE_WRITE_LEVEL set but no [writer] section"),
            }
        }
        Ok(())
    }

    /// Relative recycle bin paths live under the storage root.
    fn resolve_paths(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if writer.recycle_bin.is_relative() {
                writer.recycle_bin = writer.root.join(&writer.recycle_bin);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.source.is_none()
            && self.adapter.is_none()
            && self.writer.is_none()
            && self.processor.is_none()
        {
            bail!("no stage configured; add at least one of [source], [adapter], [writer], [processor]");
        }
        if let Some(source) = &self.source {
            require_endpoint("source.output", &source.output)?;
            if !(source.fps.is_finite() && source.fps > 0.0) {
                bail!("source.fps must be greater than zero");
            }
            if source.kind == SourceKind::Synthetic && (source.width == 0 || source.height == 0) {
                bail!("source.width and source.height must be greater than zero");
            }
            if source.kind == SourceKind::ImageFile && source.image_path.is_none() {
                bail!("source.image_path is required for kind = \"image_file\"");
            }
        }
        if let Some(settings) = &self.adapter {
            require_endpoint("adapter.input", &settings.adapter.input)?;
            require_endpoint("adapter.output", &settings.adapter.output)?;
            if let Some(sdk) = &settings.sdk {
                if sdk.num_threads == 0 {
                    bail!("adapter.sdk.num_threads must be greater than zero");
                }
            }
        }
        if let Some(writer) = &self.writer {
            let limits = &writer.limits;
            if limits.max_retained_rotations == 0 {
                bail!("writer.max_rotations must be greater than zero");
            }
            if limits.max_item_count == 0 {
                bail!("writer.max_images must be greater than zero");
            }
            if limits.max_total_bytes == 0 {
                bail!("writer.max_disk_usage_gb must be greater than zero");
            }
            if limits.rotation_interval_secs == 0 {
                bail!("writer.rotation_interval_secs must be greater than zero");
            }
            if writer.level.writes_src() {
                match &writer.raw_input {
                    Some(endpoint) => require_endpoint("writer.raw_input", endpoint)?,
                    None => bail!("writer.level {:?} requires writer.raw_input", writer.level),
                }
            }
            if writer.level.writes_dst() {
                match &writer.converted_input {
                    Some(endpoint) => require_endpoint("writer.converted_input", endpoint)?,
                    None => bail!("writer.level {:?} requires writer.converted_input", writer.level),
                }
            }
        }
        if let Some(processor) = &self.processor {
            require_endpoint("processor.input", &processor.pool.input)?;
            if processor.pool.queue_capacity == 0 {
                bail!("processor.queue_capacity must be greater than zero");
            }
        }
        Ok(())
    }
}

fn source_from_file(file: SourceConfigFile) -> Result<SourceConfig> {
    let defaults = SourceConfig::default();
    let delivery = parse_field("source.delivery", file.delivery, DeliveryMode::parse)?;
    Ok(SourceConfig {
        name: or_default("source.name", file.name, defaults.name),
        kind: or_default(
            "source.kind",
            parse_field("source.kind", file.kind, SourceKind::parse)?,
            defaults.kind,
        ),
        device_id: or_default("source.device_id", file.device_id, defaults.device_id),
        output: or_default("source.output", file.output, defaults.output),
        topic: or_default("source.topic", file.topic, defaults.topic),
        encoding: or_default(
            "source.encoding",
            parse_field("source.encoding", file.encoding, PixelEncoding::parse)?,
            defaults.encoding,
        ),
        width: or_default("source.width", file.width, defaults.width),
        height: or_default("source.height", file.height, defaults.height),
        row_padding: or_default("source.row_padding", file.row_padding, defaults.row_padding),
        fps: or_default("source.fps", file.fps, defaults.fps),
        max_frames: file.max_frames.filter(|max| *max > 0),
        image_path: file.image_path,
        socket: socket_options(
            file.send_hwm.unwrap_or(DEFAULT_HWM),
            DEFAULT_HWM,
            delivery.unwrap_or_default(),
        ),
    })
}

fn adapter_from_file(file: AdapterConfigFile) -> Result<AdapterSettings> {
    let defaults = AdapterConfig::default();
    let delivery = parse_field("adapter.delivery", file.delivery, DeliveryMode::parse)?;
    let recv_timeout_ms = or_default(
        "adapter.recv_timeout_ms",
        file.recv_timeout_ms,
        DEFAULT_RECV_TIMEOUT_MS,
    );
    let send_hwm = or_default("adapter.send_hwm", file.send_hwm, DEFAULT_HWM);
    let recv_hwm = or_default("adapter.recv_hwm", file.recv_hwm, DEFAULT_HWM);
    let adapter = AdapterConfig {
        name: or_default("adapter.name", file.name, defaults.name),
        input: or_default("adapter.input", file.input, defaults.input),
        input_topic: file.input_topic.unwrap_or(defaults.input_topic),
        output: or_default("adapter.output", file.output, defaults.output),
        output_topic: or_default("adapter.output_topic", file.output_topic, defaults.output_topic),
        engine: or_default(
            "adapter.engine",
            parse_field("adapter.engine", file.engine, ConversionEngine::parse)?,
            defaults.engine,
        ),
        bayer_engine: parse_field("adapter.bayer_engine", file.bayer_engine, ConversionEngine::parse)?,
        demosaic: or_default(
            "adapter.demosaic",
            parse_field("adapter.demosaic", file.demosaic, DemosaicMethod::parse)?,
            defaults.demosaic,
        ),
        orientation: or_default(
            "adapter.orientation",
            parse_field("adapter.orientation", file.orientation, Orientation::parse)?,
            defaults.orientation,
        ),
        recv_timeout: Duration::from_millis(recv_timeout_ms),
        input_socket: socket_options(DEFAULT_HWM, recv_hwm, DeliveryMode::Lossy),
        output_socket: socket_options(send_hwm, DEFAULT_HWM, delivery.unwrap_or_default()),
    };
    let sdk = match file.sdk {
        Some(sdk) => Some(SdkSettings {
            num_threads: or_default("adapter.sdk.num_threads", sdk.num_threads, DEFAULT_SDK_THREADS),
            demosaic: or_default(
                "adapter.sdk.demosaic",
                parse_field("adapter.sdk.demosaic", sdk.demosaic, DemosaicMethod::parse)?,
                DemosaicMethod::EdgeAware,
            ),
        }),
        None => None,
    };
    Ok(AdapterSettings { adapter, sdk })
}

fn writer_from_file(file: WriterConfigFile) -> Result<WriterConfig> {
    let root = or_default(
        "writer.root",
        file.root,
        PathBuf::from(DEFAULT_STORAGE_ROOT),
    );
    let mut writer = WriterConfig::new(root);
    if let Some(name) = file.name {
        writer.name = name;
    }
    writer.recycle_bin = or_default(
        "writer.recycle_bin",
        file.recycle_bin,
        PathBuf::from(DEFAULT_RECYCLE_BIN),
    );
    writer.level = or_default(
        "writer.level",
        parse_field("writer.level", file.level, WriteLevel::parse)?,
        WriteLevel::OnlyDst,
    );
    writer.format = or_default(
        "writer.format",
        parse_field("writer.format", file.format, ImageFormat::parse)?,
        ImageFormat::Bmp,
    );
    let max_disk_usage_gb = or_default(
        "writer.max_disk_usage_gb",
        file.max_disk_usage_gb,
        DEFAULT_MAX_DISK_USAGE_GB,
    );
    if !(max_disk_usage_gb.is_finite() && max_disk_usage_gb >= 0.0) {
        bail!("writer.max_disk_usage_gb must be a non-negative number");
    }
    writer.limits = StoreLimits {
        max_retained_rotations: or_default(
            "writer.max_rotations",
            file.max_rotations,
            DEFAULT_MAX_ROTATIONS,
        ),
        max_item_count: or_default("writer.max_images", file.max_images, DEFAULT_MAX_IMAGES),
        max_total_bytes: (max_disk_usage_gb * GIB) as u64,
        rotation_interval_secs: or_default(
            "writer.rotation_interval_secs",
            file.rotation_interval_secs,
            DEFAULT_ROTATION_INTERVAL_SECS,
        ),
    };
    writer.raw_input = file.raw_input;
    if let Some(topic) = file.raw_topic {
        writer.raw_topic = topic;
    }
    if let Some(endpoint) = file.converted_input {
        writer.converted_input = Some(endpoint);
    }
    if let Some(topic) = file.converted_topic {
        writer.converted_topic = topic;
    }
    writer.recv_timeout = Duration::from_millis(or_default(
        "writer.recv_timeout_ms",
        file.recv_timeout_ms,
        DEFAULT_RECV_TIMEOUT_MS,
    ));
    writer.socket = socket_options(
        DEFAULT_HWM,
        file.recv_hwm.unwrap_or(DEFAULT_HWM),
        DeliveryMode::Lossy,
    );
    Ok(writer)
}

fn processor_from_file(file: ProcessorConfigFile) -> ProcessorSettings {
    let defaults = PoolConfig::default();
    let pool = PoolConfig {
        name: or_default("processor.name", file.name, defaults.name),
        input: or_default("processor.input", file.input, defaults.input),
        input_topic: file.input_topic.unwrap_or(defaults.input_topic),
        num_workers: or_default("processor.num_workers", file.num_workers, DEFAULT_NUM_WORKERS),
        recv_timeout: Duration::from_millis(or_default(
            "processor.recv_timeout_ms",
            file.recv_timeout_ms,
            DEFAULT_RECV_TIMEOUT_MS,
        )),
        socket: SocketOptions::default(),
        queue_capacity: or_default(
            "processor.queue_capacity",
            file.queue_capacity,
            defaults.queue_capacity,
        ),
    };
    ProcessorSettings {
        pool,
        blur_iterations: or_default("processor.blur_iterations", file.blur_iterations, 3),
        lower: or_default("processor.lower", file.lower, [0, 0, 100]),
        upper: or_default("processor.upper", file.upper, [80, 80, 255]),
    }
}

fn or_default<T: Debug>(field: &str, value: Option<T>, default: T) -> T {
    match value {
        Some(value) => value,
        None => {
            log::warn!("{} not provided, using default {:?}", field, default);
            default
        }
    }
}

fn parse_field<T>(field: &str, value: Option<String>, parse: fn(&str) -> Option<T>) -> Result<Option<T>> {
    value
        .map(|raw| parse(&raw).ok_or_else(|| anyhow!("{}: unknown value {:?}", field, raw)))
        .transpose()
}

fn socket_options(send_hwm: usize, recv_hwm: usize, delivery: DeliveryMode) -> SocketOptions {
    SocketOptions::default()
        .with_hwm(send_hwm, recv_hwm)
        .with_delivery(delivery)
}

fn require_endpoint(field: &str, endpoint: &str) -> Result<()> {
    if endpoint.trim().is_empty() {
        bail!("{} must not be empty", field);
    }
    crate::bus::Endpoint::parse(endpoint).with_context(|| format!("{} is not a valid endpoint", field))?;
    Ok(())
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let cfg = toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(cfg)
}

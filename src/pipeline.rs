//! Assembles the configured stages around one [`BusContext`].
//!
//! Consumers start before producers (writer, worker pool, adapter, then
//! source) so no early frame finds an empty endpoint; shutdown runs in the
//! opposite order.

use std::sync::Arc;

use crate::bus::BusContext;
use crate::config::PipelineConfig;
use crate::convert::{FormatAdapter, PortableSdkConverter, SdkConverter};
use crate::error::PipelineResult;
use crate::runtime::{StageStats, StatsSnapshot};
use crate::source::FrameSource;
use crate::storage::StorageWriter;
use crate::worker::{FrameProcessor, ReferenceProcessor, ResultSink, WorkerPool};

/// Counters for every stage, shared with the stages themselves.
#[derive(Clone)]
pub struct PipelineStats {
    pub source: Arc<StageStats>,
    pub adapter: Arc<StageStats>,
    pub writer: Arc<StageStats>,
    pub workers: Arc<StageStats>,
}

impl PipelineStats {
    fn new() -> Self {
        Self {
            source: StageStats::new(),
            adapter: StageStats::new(),
            writer: StageStats::new(),
            workers: StageStats::new(),
        }
    }
}

pub struct Pipeline {
    ctx: BusContext,
    source: Option<FrameSource>,
    adapter: Option<FormatAdapter>,
    writer: Option<StorageWriter>,
    pool: Option<WorkerPool>,
    stats: PipelineStats,
}

impl Pipeline {
    /// Build every configured stage with the reference frame processor.
    pub fn new(config: PipelineConfig) -> PipelineResult<Self> {
        Self::with_processor(config, None, None)
    }

    /// Build every configured stage. `processor` replaces the reference
    /// routine when the `[processor]` stage is enabled.
    pub fn with_processor(
        config: PipelineConfig,
        processor: Option<Arc<dyn FrameProcessor>>,
        sink: Option<Arc<dyn ResultSink>>,
    ) -> PipelineResult<Self> {
        let ctx = BusContext::new();
        let stats = PipelineStats::new();

        let writer = config
            .writer
            .map(|writer| StorageWriter::new(writer, ctx.clone(), Arc::clone(&stats.writer)))
            .transpose()?;

        let pool = config.processor.map(|settings| {
            let processor = processor.unwrap_or_else(|| {
                Arc::new(ReferenceProcessor::new(
                    settings.blur_iterations,
                    settings.lower,
                    settings.upper,
                )) as Arc<dyn FrameProcessor>
            });
            WorkerPool::new(
                settings.pool,
                ctx.clone(),
                processor,
                sink,
                Arc::clone(&stats.workers),
            )
        });

        let adapter = config.adapter.map(|settings| {
            let sdk = settings.sdk.map(|sdk| {
                Arc::new(PortableSdkConverter::new(sdk.num_threads, sdk.demosaic))
                    as Arc<dyn SdkConverter>
            });
            FormatAdapter::new(settings.adapter, ctx.clone(), sdk, Arc::clone(&stats.adapter))
        });

        let source = config
            .source
            .map(|source| FrameSource::from_config(source, ctx.clone(), Arc::clone(&stats.source)))
            .transpose()?;

        Ok(Self {
            ctx,
            source,
            adapter,
            writer,
            pool,
            stats,
        })
    }

    pub fn context(&self) -> &BusContext {
        &self.ctx
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn source(&self) -> Option<&FrameSource> {
        self.source.as_ref()
    }

    pub fn writer(&self) -> Option<&StorageWriter> {
        self.writer.as_ref()
    }

    /// Start consumers first. On failure every stage already started is
    /// stopped again before the error is returned.
    pub fn start(&mut self) -> PipelineResult<()> {
        if let Err(e) = self.start_stages() {
            log::error!("pipeline start failed: {}", e);
            self.stop();
            return Err(e);
        }
        log::info!("pipeline started");
        Ok(())
    }

    fn start_stages(&mut self) -> PipelineResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.start()?;
        }
        if let Some(pool) = self.pool.as_mut() {
            pool.start()?;
        }
        if let Some(adapter) = self.adapter.as_mut() {
            adapter.start()?;
        }
        if let Some(source) = self.source.as_mut() {
            source.start()?;
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(source) = self.source.as_mut() {
            source.stop();
        }
        if let Some(adapter) = self.adapter.as_mut() {
            adapter.stop();
        }
        if let Some(pool) = self.pool.as_mut() {
            pool.stop();
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.stop();
        }
    }

    /// True once a source with `max_frames` has published all of them.
    pub fn source_finished(&self) -> bool {
        self.source.as_ref().is_some_and(|source| {
            source
                .config()
                .max_frames
                .is_some_and(|max| source.frames_published() >= max)
        })
    }

    /// Snapshots of the enabled stages, in data-flow order.
    pub fn health(&self) -> Vec<(&'static str, StatsSnapshot)> {
        let mut health = Vec::new();
        if self.source.is_some() {
            health.push(("source", self.stats.source.snapshot()));
        }
        if self.adapter.is_some() {
            health.push(("adapter", self.stats.adapter.snapshot()));
        }
        if self.writer.is_some() {
            health.push(("writer", self.stats.writer.snapshot()));
        }
        if self.pool.is_some() {
            health.push(("workers", self.stats.workers.snapshot()));
        }
        health
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Worker pool: one receiver spreads converted frames over N workers.
//!
//! The receiver re-pushes each frame message onto an internal in-process
//! queue; workers compete on that queue, so each frame is processed by
//! exactly one worker. The internal queue blocks instead of dropping, and
//! every pull uses a timeout, so shutdown never strands a worker.
//!
//! Stopping joins the receiver first. Workers then empty the internal queue
//! before they exit, so every frame the receiver accepted is processed.

mod processing;

use std::sync::Arc;
use std::time::Duration;

pub use processing::{FrameProcessor, ProcessedFrame, ReferenceProcessor, ResultSink};

use crate::bus::{
    BusContext, DeliveryMode, Multipart, Puller, Pusher, SocketOptions, Subscriber, TransportError,
};
use crate::error::{PipelineError, PipelineResult};
use crate::runtime::{RunFlag, ScopeTimer, StageStats, StageThreads};
use crate::wire::ConvertedFrameMetadata;

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub name: String,
    /// Converted stream, connected.
    pub input: String,
    pub input_topic: String,
    /// Fixed at start, at least 1.
    pub num_workers: usize,
    pub recv_timeout: Duration,
    pub socket: SocketOptions,
    /// Capacity of the internal queue.
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "worker_pool".to_string(),
            input: "inproc://converted".to_string(),
            input_topic: String::new(),
            num_workers: 5,
            recv_timeout: Duration::from_millis(1000),
            socket: SocketOptions::default(),
            queue_capacity: 1000,
        }
    }
}

impl PoolConfig {
    pub fn internal_endpoint(&self) -> String {
        format!("inproc://{}.workers", self.name)
    }
}

pub struct WorkerPool {
    config: PoolConfig,
    ctx: BusContext,
    processor: Arc<dyn FrameProcessor>,
    sink: Option<Arc<dyn ResultSink>>,
    stats: Arc<StageStats>,
    /// Receiver loop.
    run: RunFlag,
    /// Worker loops; cleared only after the receiver has been joined.
    workers_run: RunFlag,
    receiver: StageThreads,
    workers: StageThreads,
}

impl WorkerPool {
    pub fn new(
        mut config: PoolConfig,
        ctx: BusContext,
        processor: Arc<dyn FrameProcessor>,
        sink: Option<Arc<dyn ResultSink>>,
        stats: Arc<StageStats>,
    ) -> Self {
        if config.num_workers == 0 {
            log::warn!("{}: num_workers must be at least 1, using 1", config.name);
            config.num_workers = 1;
        }
        let receiver = StageThreads::new(config.name.clone());
        let workers = StageThreads::new(config.name.clone());
        Self {
            config,
            ctx,
            processor,
            sink,
            stats,
            run: RunFlag::new(),
            workers_run: RunFlag::new(),
            receiver,
            workers,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn is_running(&self) -> bool {
        self.run.is_running()
    }

    /// Spawn the workers, then the receiver.
    pub fn start(&mut self) -> PipelineResult<()> {
        if self.run.is_running() {
            return Ok(());
        }
        let name = self.config.name.clone();
        let subscriber =
            Subscriber::connect(&self.ctx, &self.config.input, self.config.socket.clone()).map_err(
                |e| {
                    log::error!("{}: cannot connect {}: {}", name, self.config.input, e);
                    e
                },
            )?;
        subscriber.subscribe(self.config.input_topic.clone());

        let internal = self.config.internal_endpoint();
        let queue_opts = SocketOptions::default()
            .with_hwm(self.config.queue_capacity, self.config.queue_capacity)
            .with_delivery(DeliveryMode::Blocking)
            .with_send_timeout(self.config.recv_timeout);
        let pusher = Pusher::bind(&self.ctx, &internal, queue_opts.clone())?;

        let mut pullers = Vec::with_capacity(self.config.num_workers);
        for _ in 0..self.config.num_workers {
            pullers.push(Puller::connect(&self.ctx, &internal, queue_opts.clone())?);
        }

        self.run.start();
        self.workers_run.start();
        for (id, puller) in pullers.into_iter().enumerate() {
            let worker = Worker {
                id,
                name: name.clone(),
                processor: Arc::clone(&self.processor),
                sink: self.sink.clone(),
                stats: Arc::clone(&self.stats),
                run: self.workers_run.clone(),
                timeout: self.config.recv_timeout,
            };
            if let Err(e) = self
                .workers
                .spawn(&format!("worker-{}", id), move || worker.drive(puller))
            {
                self.stop();
                return Err(e);
            }
        }

        let run = self.run.clone();
        let stats = Arc::clone(&self.stats);
        let timeout = self.config.recv_timeout;
        let receiver_name = name.clone();
        let spawned = self.receiver.spawn("receiver", move || {
            receive_loop(&receiver_name, &run, &subscriber, &pusher, &stats, timeout);
            subscriber.close();
            pusher.close();
        });
        if let Err(e) = spawned {
            self.stop();
            return Err(e);
        }

        log::info!(
            "{} started ({} workers, processor={})",
            name,
            self.config.num_workers,
            self.processor.name()
        );
        Ok(())
    }

    /// Stop the receiver and join it, then let the workers drain the
    /// internal queue and join them.
    pub fn stop(&mut self) {
        if !self.run.is_running() && self.receiver.is_empty() && self.workers.is_empty() {
            return;
        }
        log::info!("{} stopping...", self.config.name);
        self.run.stop();
        self.receiver.join_all();
        self.workers_run.stop();
        self.workers.join_all();
        log::info!("{} stopped ({})", self.config.name, self.stats.snapshot());
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    name: &str,
    run: &RunFlag,
    subscriber: &Subscriber,
    pusher: &Pusher,
    stats: &StageStats,
    timeout: Duration,
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
        if msg.len() != 2 {
            stats.record_error();
            log::warn!("{}: dropping {}-part message", name, msg.len());
            continue;
        }
        hand_off(name, run, pusher, msg, stats);
    }
}

/// Push to the workers, waiting while they are busy.
fn hand_off(name: &str, run: &RunFlag, pusher: &Pusher, msg: Multipart, stats: &StageStats) {
    loop {
        match pusher.push(msg.clone()) {
            Ok(_) => return,
            Err(TransportError::Timeout) if run.is_running() => {
                log::trace!("{}: workers busy, retrying", name);
            }
            Err(e) => {
                stats.record_dropped(1);
                log::warn!("{}: frame not handed off: {}", name, e);
                return;
            }
        }
    }
}

struct Worker {
    id: usize,
    name: String,
    processor: Arc<dyn FrameProcessor>,
    sink: Option<Arc<dyn ResultSink>>,
    stats: Arc<StageStats>,
    run: RunFlag,
    timeout: Duration,
}

impl Worker {
    fn drive(self, puller: Puller) {
        log::debug!("{}: worker {} ready", self.name, self.id);
        while self.run.is_running() {
            match puller.pull(self.timeout) {
                Ok(Some(msg)) => self.dispatch(msg),
                Ok(None) => continue,
                Err(e) => {
                    log::error!("{}: worker {} pull failed: {}", self.name, self.id, e);
                    break;
                }
            }
        }

        // The receiver has been joined; nothing else lands on the queue.
        let mut drained = 0usize;
        while let Ok(Some(msg)) = puller.pull(Duration::ZERO) {
            self.dispatch(msg);
            drained += 1;
        }
        if drained > 0 {
            log::debug!("{}: worker {} drained {} queued frames", self.name, self.id, drained);
        }
        puller.close();
    }

    fn dispatch(&self, msg: Multipart) {
        match self.handle(msg) {
            Ok(frame) => {
                self.stats.record_forwarded();
                if let Some(sink) = &self.sink {
                    sink.accept(self.id, frame);
                }
            }
            Err(e) => {
                self.stats.record_error();
                log::warn!("{}: worker {} dropped frame: {}", self.name, self.id, e);
            }
        }
    }

    fn handle(&self, msg: Multipart) -> PipelineResult<ProcessedFrame> {
        let (meta_bytes, pixels) = msg
            .into_frame()
            .ok_or_else(|| PipelineError::Codec("expected a two-part frame message".into()))?;
        let meta = ConvertedFrameMetadata::decode(&meta_bytes)?;
        meta.check_payload(pixels.len())?;
        let _timer = ScopeTimer::new(format!("{} worker {} #{}", self.name, self.id, meta.sequence_id));
        self.processor.process(&meta, &pixels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Publisher;
    use crate::wire::{ChannelLayout, ElementFormat};
    use parking_lot::Mutex;

    struct Collect(Mutex<Vec<(usize, i64)>>);

    impl ResultSink for Collect {
        fn accept(&self, worker_id: usize, frame: ProcessedFrame) {
            self.0.lock().push((worker_id, frame.meta.sequence_id));
        }
    }

    #[test]
    fn zero_workers_is_raised_to_one() {
        let pool = WorkerPool::new(
            PoolConfig {
                num_workers: 0,
                ..PoolConfig::default()
            },
            BusContext::new(),
            Arc::new(ReferenceProcessor::default()),
            None,
            StageStats::new(),
        );
        assert_eq!(pool.num_workers(), 1);
    }

    #[test]
    fn frames_reach_the_sink() {
        let ctx = BusContext::new();
        let publisher =
            Publisher::bind(&ctx, "inproc://converted", SocketOptions::default()).unwrap();
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let mut pool = WorkerPool::new(
            PoolConfig {
                num_workers: 2,
                recv_timeout: Duration::from_millis(20),
                ..PoolConfig::default()
            },
            ctx.clone(),
            Arc::new(ReferenceProcessor::default()),
            Some(sink.clone() as Arc<dyn ResultSink>),
            StageStats::new(),
        );
        pool.start().unwrap();

        for seq in 0..4 {
            let meta = ConvertedFrameMetadata {
                device_id: "cam".to_string(),
                sequence_id: seq,
                height: 2,
                width: 2,
                timestamp: 0,
                error_count: 0,
                channel_layout: ChannelLayout::Mono,
                element_format: ElementFormat::U8,
            };
            publisher
                .publish_frame("converted", meta.encode().unwrap(), bytes::Bytes::from(vec![0u8; 4]))
                .unwrap();
        }

        for _ in 0..200 {
            if sink.0.lock().len() == 4 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        pool.stop();
        let mut seqs: Vec<i64> = sink.0.lock().iter().map(|(_, s)| *s).collect();
        seqs.sort();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }
}

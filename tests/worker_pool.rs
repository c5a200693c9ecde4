use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use frame_pipeline::bus::{BusContext, Publisher, SocketOptions};
use frame_pipeline::error::PipelineResult;
use frame_pipeline::runtime::StageStats;
use frame_pipeline::wire::{ChannelLayout, ConvertedFrameMetadata, ElementFormat};
use frame_pipeline::worker::{FrameProcessor, PoolConfig, ProcessedFrame, ResultSink, WorkerPool};

/// Sleeps to simulate work, then echoes the frame.
struct Slow(Duration);

impl FrameProcessor for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    fn process(&self, meta: &ConvertedFrameMetadata, pixels: &[u8]) -> PipelineResult<ProcessedFrame> {
        std::thread::sleep(self.0);
        Ok(ProcessedFrame {
            meta: meta.clone(),
            pixels: Bytes::copy_from_slice(pixels),
        })
    }
}

#[derive(Default)]
struct Tally(Mutex<HashMap<i64, Vec<usize>>>);

impl ResultSink for Tally {
    fn accept(&self, worker_id: usize, frame: ProcessedFrame) {
        self.0
            .lock()
            .entry(frame.meta.sequence_id)
            .or_default()
            .push(worker_id);
    }
}

fn converted(seq: i64) -> ConvertedFrameMetadata {
    ConvertedFrameMetadata {
        device_id: "cam".to_string(),
        sequence_id: seq,
        height: 4,
        width: 4,
        timestamp: seq as u64,
        error_count: 0,
        channel_layout: ChannelLayout::Color3,
        element_format: ElementFormat::U8,
    }
}

#[test]
fn every_frame_is_processed_exactly_once() {
    let ctx = BusContext::new();
    let publisher = Publisher::bind(&ctx, "inproc://converted", SocketOptions::default()).unwrap();
    let tally = Arc::new(Tally::default());
    let stats = StageStats::new();
    let mut pool = WorkerPool::new(
        PoolConfig {
            num_workers: 4,
            recv_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        },
        ctx.clone(),
        Arc::new(Slow(Duration::from_millis(5))),
        Some(tally.clone() as Arc<dyn ResultSink>),
        Arc::clone(&stats),
    );
    pool.start().unwrap();

    let payload = Bytes::from(vec![1u8; 4 * 4 * 3]);
    for seq in 0..100 {
        publisher
            .publish_frame("converted", converted(seq).encode().unwrap(), payload.clone())
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while tally.0.lock().len() < 100 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    pool.stop();

    let seen = tally.0.lock();
    assert_eq!(seen.len(), 100);
    assert!(seen.values().all(|workers| workers.len() == 1));
    let busy: std::collections::HashSet<usize> = seen.values().map(|w| w[0]).collect();
    assert!(busy.len() > 1, "work was not spread: {:?}", busy);
    assert_eq!(stats.snapshot().forwarded, 100);
}

#[test]
fn malformed_frames_are_counted_and_skipped() {
    let ctx = BusContext::new();
    let publisher = Publisher::bind(&ctx, "inproc://converted", SocketOptions::default()).unwrap();
    let tally = Arc::new(Tally::default());
    let stats = StageStats::new();
    let mut pool = WorkerPool::new(
        PoolConfig {
            num_workers: 2,
            recv_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        },
        ctx.clone(),
        Arc::new(Slow(Duration::ZERO)),
        Some(tally.clone() as Arc<dyn ResultSink>),
        Arc::clone(&stats),
    );
    pool.start().unwrap();

    // Payload too short for a 4x4 colour frame.
    publisher
        .publish_frame("converted", converted(0).encode().unwrap(), Bytes::from_static(&[0u8; 5]))
        .unwrap();
    publisher
        .publish_frame("converted", converted(1).encode().unwrap(), Bytes::from(vec![0u8; 48]))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while tally.0.lock().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    let deadline = Instant::now() + Duration::from_secs(2);
    while stats.snapshot().errors == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    pool.stop();

    assert_eq!(tally.0.lock().keys().copied().collect::<Vec<_>>(), vec![1]);
    assert_eq!(stats.snapshot().errors, 1);
}

#[test]
fn stop_returns_promptly_when_idle() {
    let ctx = BusContext::new();
    let mut pool = WorkerPool::new(
        PoolConfig {
            num_workers: 3,
            recv_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        },
        ctx,
        Arc::new(Slow(Duration::ZERO)),
        None,
        StageStats::new(),
    );
    pool.start().unwrap();
    let started = Instant::now();
    pool.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!pool.is_running());
}

#[test]
fn stop_finishes_queued_frames_and_restart_starts_clean() {
    let ctx = BusContext::new();
    let publisher = Publisher::bind(&ctx, "inproc://converted", SocketOptions::default()).unwrap();
    let tally = Arc::new(Tally::default());
    let stats = StageStats::new();
    let mut pool = WorkerPool::new(
        PoolConfig {
            num_workers: 1,
            recv_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        },
        ctx.clone(),
        Arc::new(Slow(Duration::from_millis(20))),
        Some(tally.clone() as Arc<dyn ResultSink>),
        Arc::clone(&stats),
    );
    pool.start().unwrap();

    let payload = Bytes::from(vec![1u8; 4 * 4 * 3]);
    for seq in 0..20 {
        publisher
            .publish_frame("converted", converted(seq).encode().unwrap(), payload.clone())
            .unwrap();
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while stats.snapshot().received < 20 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    pool.stop();

    // Everything the receiver accepted was processed before stop returned.
    let after_stop = stats.snapshot();
    assert_eq!(after_stop.received, 20);
    assert_eq!(after_stop.forwarded, 20);
    assert_eq!(after_stop.dropped, 0);
    assert_eq!(tally.0.lock().len(), 20);

    // Nothing from the first session is replayed.
    pool.start().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    pool.stop();
    assert_eq!(stats.snapshot().forwarded, 20);
    assert!(tally.0.lock().values().all(|workers| workers.len() == 1));
}

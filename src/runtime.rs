//! Thread and lifecycle plumbing shared by the stages.
//!
//! - `RunFlag`: the atomic running flag every loop polls between receives
//! - `StageThreads`: named threads joined in reverse spawn order
//! - `StageStats`: per-stage counters injected at construction
//! - `ScopeTimer`: debug-level timing of a scope

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::error::{PipelineError, PipelineResult};

/// Shared running flag. Clones observe the same state.
#[derive(Clone, Debug, Default)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Threads belonging to one stage.
///
/// Threads are joined in the reverse of their spawn order, so a stage that
/// spawns its consumers before its producer always joins the producer
/// first and never leaves a consumer waiting on a queue nobody feeds.
pub struct StageThreads {
    stage: String,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl StageThreads {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            handles: Vec::new(),
        }
    }

    pub fn spawn<F>(&mut self, label: &str, f: F) -> PipelineResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = format!("{}-{}", self.stage, label);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(|source| PipelineError::Spawn {
                name: name.clone(),
                source,
            })?;
        self.handles.push((name, handle));
        Ok(())
    }

    /// Join every thread, newest first. Panics are logged, not propagated.
    pub fn join_all(&mut self) {
        while let Some((name, handle)) = self.handles.pop() {
            if handle.join().is_err() {
                log::error!("{}: thread {} panicked", self.stage, name);
            } else {
                log::debug!("{}: thread {} joined", self.stage, name);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Per-stage counters.
#[derive(Debug, Default)]
pub struct StageStats {
    received: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

impl StageStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a stage's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub errors: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} forwarded={} dropped={} errors={}",
            self.received, self.forwarded, self.dropped, self.errors
        )
    }
}

/// Logs the elapsed time of a scope at debug level when dropped.
pub struct ScopeTimer {
    label: String,
    start: Instant,
}

impl ScopeTimer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            start: Instant::now(),
        }
    }
}

impl Drop for ScopeTimer {
    fn drop(&mut self) {
        log::debug!(
            "{} took {:.3} ms",
            self.label,
            self.start.elapsed().as_secs_f64() * 1000.0
        );
    }
}

//! Structured events emitted by the engine.
//!
//! The engine never prints; it emits `EngineEvent`s to an injected `EventSink`.
//! Sinks provided here:
//! - `ChannelSink`: forwards into a tokio mpsc channel (UI, reporters)
//! - `TracingSink`: forwards into the `tracing` log stream
//! - `MemorySink`: keeps every event in memory (tests, post-run inspection)
//! - `FanoutSink`: duplicates events into several sinks

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::orchestrator::FeatureStatus;
use crate::phase::PhaseTransitionRecord;

/// Events emitted during an orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A run has started.
    RunStarted {
        run_id: String,
        features: usize,
        batches: usize,
    },
    /// A dependency batch has started.
    BatchStarted { batch: usize, features: Vec<String> },
    /// A feature has been handed to a worker.
    FeatureStarted { feature: String, batch: usize },
    /// A phase transition was recorded.
    PhaseTransition { record: PhaseTransitionRecord },
    /// An implementation attempt finished its test run.
    AttemptFinished {
        feature: String,
        attempt: u32,
        passed: bool,
        failing: usize,
        duration_ms: u64,
    },
    /// A retry has been scheduled for a feature.
    RetryScheduled {
        feature: String,
        attempt: u32,
        reason: String,
        hints: Vec<String>,
    },
    /// A test result was served from the cache.
    CacheHit { feature: String, fingerprint: String },
    /// A test result was not in the cache.
    CacheMiss { feature: String, fingerprint: String },
    /// The cache was deliberately skipped (RED validation).
    CacheBypassed { feature: String },
    /// A feature reached a terminal status.
    FeatureFinished {
        feature: String,
        status: FeatureStatus,
        attempts: u32,
        elapsed_ms: u64,
    },
    /// A dependency batch has fully resolved.
    BatchCompleted {
        batch: usize,
        green: usize,
        failed: usize,
        skipped: usize,
        cancelled: usize,
        duration_ms: u64,
    },
    /// The run has finished.
    RunCompleted {
        run_id: String,
        success: bool,
        green: usize,
        total: usize,
        duration_ms: u64,
    },
}

/// Observer interface for engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Forwards events into an unbounded tokio channel. Send errors (receiver
/// dropped) are ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: EngineEvent) {
        self.tx.send(event).ok();
    }
}

/// Writes every event to the `tracing` stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::RunStarted { run_id, features, batches } => {
                tracing::info!(%run_id, features, batches, "run started");
            }
            EngineEvent::BatchStarted { batch, features } => {
                tracing::info!(batch, features = ?features, "batch started");
            }
            EngineEvent::FeatureStarted { feature, batch } => {
                tracing::info!(%feature, batch, "feature started");
            }
            EngineEvent::PhaseTransition { record } => {
                let from = record.from.map(|p| p.as_str()).unwrap_or("-");
                tracing::info!(feature = %record.feature_id, from, to = %record.to, "phase transition");
            }
            EngineEvent::AttemptFinished { feature, attempt, passed, failing, duration_ms } => {
                tracing::debug!(%feature, attempt, passed, failing, duration_ms, "attempt finished");
            }
            EngineEvent::RetryScheduled { feature, attempt, reason, hints } => {
                tracing::warn!(%feature, attempt, %reason, hints = hints.len(), "retry scheduled");
            }
            EngineEvent::CacheHit { feature, fingerprint } => {
                tracing::debug!(%feature, %fingerprint, "cache hit");
            }
            EngineEvent::CacheMiss { feature, fingerprint } => {
                tracing::debug!(%feature, %fingerprint, "cache miss");
            }
            EngineEvent::CacheBypassed { feature } => {
                tracing::debug!(%feature, "cache bypassed for RED validation");
            }
            EngineEvent::FeatureFinished { feature, status, attempts, elapsed_ms } => match status {
                FeatureStatus::Green => {
                    tracing::info!(%feature, %status, attempts, elapsed_ms, "feature finished");
                }
                _ => tracing::warn!(%feature, %status, attempts, elapsed_ms, "feature finished"),
            },
            EngineEvent::BatchCompleted { batch, green, failed, skipped, cancelled, duration_ms } => {
                tracing::info!(batch, green, failed, skipped, cancelled, duration_ms, "batch completed");
            }
            EngineEvent::RunCompleted { run_id, success, green, total, duration_ms } => {
                tracing::info!(%run_id, success, green, total, duration_ms, "run completed");
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<EngineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received so far, in emission order.
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Count events matching a predicate.
    pub fn count(&self, predicate: impl Fn(&EngineEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| predicate(e))
            .count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: EngineEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Duplicates every event into several sinks.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: EngineEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

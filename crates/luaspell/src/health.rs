//! Per-instance health tracking and scoring.
//!
//! The monitor is a side map keyed by instance identity — it never owns an
//! instance, so dropping an entry on recycle/abandon is just a map removal
//! and there is no ownership cycle with the pool.
//!
//! The score is a bounded function in [0, 1]. The exact shape is internal;
//! the ordering it must preserve is: healthy > slow > error-prone >
//! old-and-unused. Penalties:
//! - error ratio, weighted heaviest;
//! - mean latency above [`SOFT_LATENCY`];
//! - idle age beyond [`IDLE_AGE_THRESHOLD`];
//! - memory above the advisory limit (doubled penalty when far above).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::vm::InstanceId;

/// Mean execution time above which an instance counts as slow.
const SOFT_LATENCY: Duration = Duration::from_millis(500);

/// Idle age after which the score starts decaying.
const IDLE_AGE_THRESHOLD: Duration = Duration::from_secs(3600);

/// Rolling counters for one instance.
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    pub execution_count: u64,
    pub error_count: u64,
    pub total_exec_time: Duration,
    pub last_used: Instant,
    pub memory_usage: usize,
    pub created_at: Instant,
}

impl HealthMetrics {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            execution_count: 0,
            error_count: 0,
            total_exec_time: Duration::ZERO,
            last_used: now,
            memory_usage: 0,
            created_at: now,
        }
    }

    fn mean_exec_time(&self) -> Duration {
        if self.execution_count == 0 {
            Duration::ZERO
        } else {
            self.total_exec_time / self.execution_count as u32
        }
    }
}

/// Tracks health for every live instance. All mutations go through the inner
/// lock; reads take snapshots.
pub struct HealthMonitor {
    entries: RwLock<HashMap<InstanceId, HealthMetrics>>,
    /// Advisory per-instance memory budget used for scoring; 0 = none.
    advisory_memory: AtomicUsize,
}

impl HealthMonitor {
    pub fn new(advisory_memory: Option<usize>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            advisory_memory: AtomicUsize::new(advisory_memory.unwrap_or(0)),
        }
    }

    /// Adjusts the advisory budget used for scoring from now on.
    pub fn set_advisory_memory(&self, bytes: usize) {
        self.advisory_memory.store(bytes, Ordering::Release);
    }

    /// Starts tracking a freshly built instance.
    pub fn register(&self, id: InstanceId) {
        self.entries.write().insert(id, HealthMetrics::new());
    }

    /// Records one completed execution.
    pub fn record_execution(&self, id: InstanceId, duration: Duration, errored: bool) {
        let mut entries = self.entries.write();
        let entry = entries.entry(id).or_insert_with(HealthMetrics::new);
        entry.execution_count += 1;
        if errored {
            entry.error_count += 1;
        }
        entry.total_exec_time += duration;
        entry.last_used = Instant::now();
    }

    pub fn update_memory_usage(&self, id: InstanceId, bytes: usize) {
        if let Some(entry) = self.entries.write().get_mut(&id) {
            entry.memory_usage = bytes;
        }
    }

    pub fn set_last_used(&self, id: InstanceId) {
        if let Some(entry) = self.entries.write().get_mut(&id) {
            entry.last_used = Instant::now();
        }
    }

    pub fn get_metrics(&self, id: InstanceId) -> Option<HealthMetrics> {
        self.entries.read().get(&id).cloned()
    }

    /// Total memory across tracked instances, for the engine metrics surface.
    pub fn total_memory(&self) -> usize {
        self.entries.read().values().map(|m| m.memory_usage).sum()
    }

    /// Current score for `id`. Unknown instances score 1.0 — an instance the
    /// monitor has never seen has no evidence against it.
    pub fn score(&self, id: InstanceId) -> f64 {
        let entries = self.entries.read();
        match entries.get(&id) {
            Some(metrics) => self.score_of(metrics),
            None => 1.0,
        }
    }

    /// True when the instance scores below `threshold` and should be
    /// destroyed rather than returned to the idle set.
    pub fn should_recycle(&self, id: InstanceId, threshold: f64) -> bool {
        self.score(id) < threshold
    }

    /// Forgets an instance. Called by the pool on recycle and abandon.
    pub fn cleanup_state(&self, id: InstanceId) {
        self.entries.write().remove(&id);
    }

    fn score_of(&self, metrics: &HealthMetrics) -> f64 {
        let mut score = 1.0_f64;

        if metrics.execution_count > 0 {
            let ratio = metrics.error_count as f64 / metrics.execution_count as f64;
            score -= ratio * 0.8;

            if metrics.mean_exec_time() > SOFT_LATENCY {
                score -= 0.25;
            }
        }

        let idle = metrics.last_used.elapsed();
        if idle > IDLE_AGE_THRESHOLD {
            let hours_over =
                (idle - IDLE_AGE_THRESHOLD).as_secs_f64() / IDLE_AGE_THRESHOLD.as_secs_f64();
            score -= (0.05 + hours_over * 0.05).min(0.2);
        }

        let limit = self.advisory_memory.load(Ordering::Acquire);
        if limit > 0 {
            if metrics.memory_usage >= limit * 2 {
                score -= 0.25;
            } else if metrics.memory_usage > limit {
                score -= 0.1;
            }
        }

        score.clamp(0.0, 1.0)
    }
}

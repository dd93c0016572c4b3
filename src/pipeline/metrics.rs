//! Per-stage latency and error accounting.
//!
//! Each station owns an `Arc<StageStats>` it alone updates; the
//! orchestrator reads snapshots on its metrics cadence. Latency percentiles
//! come from a bounded sliding window of recent measurements.

use crate::pipeline::health::PipelineMode;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Sliding window of recent latency measurements.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: Vec<Duration>,
    capacity: usize,
    next: usize,
    filled: bool,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            next: 0,
            filled: false,
        }
    }

    /// Records one measurement, evicting the oldest when full.
    pub fn record(&mut self, latency: Duration) {
        if self.samples.len() < self.capacity {
            self.samples.push(latency);
        } else {
            self.samples[self.next] = latency;
            self.filled = true;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Latency at the given percentile (0.0 to 1.0), by nearest-rank.
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let rank = ((p.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize)
            .saturating_sub(1)
            .min(sorted.len() - 1);
        Some(sorted[rank])
    }
}

/// Counters and latency window for a single station.
///
/// Updated only by the owning station; read by the orchestrator.
#[derive(Debug)]
pub struct StageStats {
    name: &'static str,
    processed: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
    latency: Mutex<LatencyWindow>,
}

impl StageStats {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            latency: Mutex::new(LatencyWindow::new(256)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_dropped(&self, total: u64) {
        self.dropped.store(total, Ordering::Relaxed);
    }

    pub fn record_latency(&self, latency: Duration) {
        self.latency.lock().unwrap().record(latency);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Point-in-time snapshot; `queue_depth` is filled in by the caller,
    /// which owns the channel handles.
    pub fn snapshot(&self, queue_depth: usize) -> StageSnapshot {
        let window = self.latency.lock().unwrap();
        StageSnapshot {
            name: self.name,
            processed: self.processed(),
            errors: self.errors(),
            dropped: self.dropped(),
            queue_depth,
            latency_p50: window.percentile(0.50),
            latency_p95: window.percentile(0.95),
            latency_p99: window.percentile(0.99),
        }
    }
}

/// Snapshot of one stage at metrics time.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSnapshot {
    pub name: &'static str,
    pub processed: u64,
    pub errors: u64,
    pub dropped: u64,
    pub queue_depth: usize,
    pub latency_p50: Option<Duration>,
    pub latency_p95: Option<Duration>,
    pub latency_p99: Option<Duration>,
}

/// Snapshot of the whole pipeline at metrics time.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineMetrics {
    pub mode: PipelineMode,
    pub uptime: Duration,
    pub utterances_completed: u64,
    pub stages: Vec<StageSnapshot>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self {
            mode: PipelineMode::Active,
            uptime: Duration::ZERO,
            utterances_completed: 0,
            stages: Vec::new(),
        }
    }
}

impl PipelineMetrics {
    /// Snapshot for the named stage, if present.
    pub fn stage(&self, name: &str) -> Option<&StageSnapshot> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Sum of error counters across stages.
    pub fn total_errors(&self) -> u64 {
        self.stages.iter().map(|s| s.errors).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window_has_no_percentiles() {
        let window = LatencyWindow::new(16);
        assert!(window.percentile(0.5).is_none());
        assert!(window.is_empty());
    }

    #[test]
    fn test_percentiles_on_known_distribution() {
        let mut window = LatencyWindow::new(100);
        for ms in 1..=100 {
            window.record(Duration::from_millis(ms));
        }

        assert_eq!(window.percentile(0.50), Some(Duration::from_millis(50)));
        assert_eq!(window.percentile(0.95), Some(Duration::from_millis(95)));
        assert_eq!(window.percentile(0.99), Some(Duration::from_millis(99)));
        assert_eq!(window.percentile(1.0), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = LatencyWindow::new(4);
        for ms in [100u64, 200, 300, 400, 500, 600] {
            window.record(Duration::from_millis(ms));
        }

        assert_eq!(window.len(), 4);
        // 100 and 200 were evicted
        assert_eq!(window.percentile(0.0), Some(Duration::from_millis(300)));
        assert_eq!(window.percentile(1.0), Some(Duration::from_millis(600)));
    }

    #[test]
    fn test_single_sample_serves_all_percentiles() {
        let mut window = LatencyWindow::new(8);
        window.record(Duration::from_millis(42));

        for p in [0.0, 0.5, 0.95, 1.0] {
            assert_eq!(window.percentile(p), Some(Duration::from_millis(42)));
        }
    }

    #[test]
    fn test_stage_stats_counters() {
        let stats = StageStats::new("stt");
        stats.add_processed();
        stats.add_processed();
        stats.add_error();
        stats.set_dropped(7);

        assert_eq!(stats.processed(), 2);
        assert_eq!(stats.errors(), 1);
        assert_eq!(stats.dropped(), 7);
    }

    #[test]
    fn test_stage_snapshot() {
        let stats = StageStats::new("translator");
        stats.add_processed();
        stats.record_latency(Duration::from_millis(150));

        let snapshot = stats.snapshot(3);
        assert_eq!(snapshot.name, "translator");
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.queue_depth, 3);
        assert_eq!(snapshot.latency_p50, Some(Duration::from_millis(150)));
    }

    #[test]
    fn test_pipeline_metrics_lookup() {
        let stats = StageStats::new("vad");
        stats.add_error();

        let metrics = PipelineMetrics {
            mode: PipelineMode::Active,
            uptime: Duration::from_secs(5),
            utterances_completed: 2,
            stages: vec![stats.snapshot(0)],
        };

        assert!(metrics.stage("vad").is_some());
        assert!(metrics.stage("missing").is_none());
        assert_eq!(metrics.total_errors(), 1);
    }
}

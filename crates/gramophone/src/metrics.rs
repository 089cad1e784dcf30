//! Passive per-backend recording metrics.
//!
//! Counters and gauges updated at session state transitions and read as a
//! snapshot by the health endpoint and the periodic statistics log. Purely
//! in-memory: everything starts at zero on process start, and recordings
//! already sitting on disk from a previous run are not counted.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
struct BackendCounters {
    current_recordings: AtomicI64,
    recordings_total: AtomicU64,
    recordings_failed: AtomicU64,
    uploads_failed: AtomicU64,
    recorded_duration_seconds: AtomicU64,
}

/// Point-in-time values for one backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendSnapshot {
    pub current_recordings: i64,
    pub recordings_total: u64,
    pub recordings_failed: u64,
    pub uploads_failed: u64,
    pub recorded_duration_seconds: u64,
}

/// Point-in-time values for all backends, keyed by backend id.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub backends: BTreeMap<String, BackendSnapshot>,
}

impl MetricsSnapshot {
    /// Sums across backends, for the statistics log line.
    pub fn totals(&self) -> BackendSnapshot {
        let mut totals = BackendSnapshot::default();
        for snapshot in self.backends.values() {
            totals.current_recordings += snapshot.current_recordings;
            totals.recordings_total += snapshot.recordings_total;
            totals.recordings_failed += snapshot.recordings_failed;
            totals.uploads_failed += snapshot.uploads_failed;
            totals.recorded_duration_seconds += snapshot.recorded_duration_seconds;
        }
        totals
    }
}

/// Registry of per-backend counters.
#[derive(Default)]
pub struct Metrics {
    backends: DashMap<String, BackendCounters>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_backend(&self, backend: &str, update: impl FnOnce(&BackendCounters)) {
        let counters = self.backends.entry(backend.to_string()).or_default();
        update(&counters);
    }

    /// A session entered `Recording`.
    pub fn recording_started(&self, backend: &str) {
        self.with_backend(backend, |c| {
            c.recordings_total.fetch_add(1, Ordering::Relaxed);
            c.current_recordings.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// A session reached `Finished`; its duration is counted exactly once.
    pub fn recording_finished(&self, backend: &str, duration_seconds: u64) {
        self.with_backend(backend, |c| {
            c.current_recordings.fetch_sub(1, Ordering::Relaxed);
            c.recorded_duration_seconds
                .fetch_add(duration_seconds, Ordering::Relaxed);
        });
    }

    /// A session failed while or before recording. No duration is counted.
    ///
    /// `was_recording` keeps the gauge honest for sessions that failed
    /// before ever reaching `Recording`.
    pub fn recording_failed(&self, backend: &str, was_recording: bool) {
        self.with_backend(backend, |c| {
            c.recordings_failed.fetch_add(1, Ordering::Relaxed);
            if was_recording {
                c.current_recordings.fetch_sub(1, Ordering::Relaxed);
            }
        });
    }

    /// The upload handoff failed; the recording itself is not counted as
    /// failed, the two counters stay disjoint.
    pub fn upload_failed(&self, backend: &str) {
        self.with_backend(backend, |c| {
            c.uploads_failed.fetch_add(1, Ordering::Relaxed);
            c.current_recordings.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// A session was cancelled before producing anything countable.
    pub fn recording_cancelled(&self, backend: &str, was_recording: bool) {
        self.with_backend(backend, |c| {
            if was_recording {
                c.current_recordings.fetch_sub(1, Ordering::Relaxed);
            }
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut backends = BTreeMap::new();
        for entry in self.backends.iter() {
            backends.insert(
                entry.key().clone(),
                BackendSnapshot {
                    current_recordings: entry.current_recordings.load(Ordering::Relaxed),
                    recordings_total: entry.recordings_total.load(Ordering::Relaxed),
                    recordings_failed: entry.recordings_failed.load(Ordering::Relaxed),
                    uploads_failed: entry.uploads_failed.load(Ordering::Relaxed),
                    recorded_duration_seconds: entry
                        .recorded_duration_seconds
                        .load(Ordering::Relaxed),
                },
            );
        }
        MetricsSnapshot { backends }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successful_recording_counts_duration_once() {
        let metrics = Metrics::new();

        metrics.recording_started("cloud");
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.backends["cloud"].current_recordings, 1);
        assert_eq!(snapshot.backends["cloud"].recordings_total, 1);

        metrics.recording_finished("cloud", 120);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.backends["cloud"].current_recordings, 0);
        assert_eq!(snapshot.backends["cloud"].recorded_duration_seconds, 120);
        assert_eq!(snapshot.backends["cloud"].recordings_failed, 0);
        assert_eq!(snapshot.backends["cloud"].uploads_failed, 0);
    }

    #[test]
    fn test_failed_recording_adds_no_duration() {
        let metrics = Metrics::new();

        metrics.recording_started("cloud");
        metrics.recording_failed("cloud", true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.backends["cloud"].recordings_failed, 1);
        assert_eq!(snapshot.backends["cloud"].recorded_duration_seconds, 0);
        assert_eq!(snapshot.backends["cloud"].current_recordings, 0);
    }

    #[test]
    fn test_failure_before_recording_leaves_gauge_untouched() {
        let metrics = Metrics::new();

        metrics.recording_failed("cloud", false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.backends["cloud"].recordings_failed, 1);
        assert_eq!(snapshot.backends["cloud"].current_recordings, 0);
    }

    #[test]
    fn test_upload_failure_is_disjoint_from_recording_failure() {
        let metrics = Metrics::new();

        metrics.recording_started("cloud");
        metrics.upload_failed("cloud");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.backends["cloud"].uploads_failed, 1);
        assert_eq!(snapshot.backends["cloud"].recordings_failed, 0);
        assert_eq!(snapshot.backends["cloud"].current_recordings, 0);
    }

    #[test]
    fn test_backends_are_tracked_separately() {
        let metrics = Metrics::new();

        metrics.recording_started("one");
        metrics.recording_started("two");
        metrics.recording_finished("one", 10);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.backends["one"].recorded_duration_seconds, 10);
        assert_eq!(snapshot.backends["two"].recorded_duration_seconds, 0);
        assert_eq!(snapshot.backends["two"].current_recordings, 1);

        let totals = snapshot.totals();
        assert_eq!(totals.recordings_total, 2);
        assert_eq!(totals.current_recordings, 1);
    }
}

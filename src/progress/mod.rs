//! Job progress accumulation with ETA estimation.
//!
//! One tracker per job. Workers call [`ProgressTracker::increment_one`] once
//! per completed unit regardless of success or failure; the percentage is
//! capped below 100 until [`ProgressTracker::finalize`] runs, so out-of-order
//! async completions can never report a premature done state.

use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Point-in-time view of a job's progress.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressSnapshot {
    pub total_units: usize,
    pub completed_units: usize,
    pub percent: u8,
    pub eta_seconds: Option<u64>,
    pub message: Option<String>,
}

/// Write-through target for persisted progress. Storage mechanics are the
/// caller's concern; the tracker publishes after every state change.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, snapshot: &ProgressSnapshot);
}

/// Sink that discards snapshots, for library use without reporting.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn publish(&self, _snapshot: &ProgressSnapshot) {}
}

struct ProgressState {
    total_units: usize,
    completed_units: usize,
    started_at: Instant,
    finalized: bool,
    message: Option<String>,
}

/// Thread-safe progress accumulator for one job.
pub struct ProgressTracker {
    state: Mutex<ProgressState>,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressTracker {
    pub fn new(total_units: usize, sink: Arc<dyn ProgressSink>) -> Self {
        let tracker = Self {
            state: Mutex::new(ProgressState {
                total_units,
                completed_units: 0,
                started_at: Instant::now(),
                finalized: false,
                message: None,
            }),
            sink,
        };
        tracker.publish();
        tracker
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record one completed unit and recompute percent and ETA.
    pub fn increment_one(&self, message: Option<String>) {
        {
            let mut state = self.lock();
            if state.finalized {
                tracing::debug!("Progress increment after finalize ignored");
                return;
            }
            state.completed_units = (state.completed_units + 1).min(state.total_units.max(1));
            if message.is_some() {
                state.message = message;
            }
        }
        self.publish();
    }

    /// Force the finished state. Effective once; later calls are no-ops.
    pub fn finalize(&self) {
        {
            let mut state = self.lock();
            if state.finalized {
                tracing::debug!("Progress already finalized");
                return;
            }
            state.finalized = true;
            state.completed_units = state.total_units;
            state.message = Some("done".to_string());
        }
        self.publish();
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.lock();
        let percent = if state.finalized {
            100
        } else if state.total_units == 0 || state.completed_units == 0 {
            0
        } else {
            // Capped below 100 while running.
            ((100 * state.completed_units / state.total_units) as u8).min(99)
        };
        let eta_seconds = if state.finalized {
            Some(0)
        } else if state.completed_units == 0 {
            None
        } else {
            let elapsed = state.started_at.elapsed();
            let avg = elapsed / state.completed_units as u32;
            let remaining = state.total_units.saturating_sub(state.completed_units) as u32;
            Some((avg * remaining).as_secs())
        };
        ProgressSnapshot {
            total_units: state.total_units,
            completed_units: state.completed_units,
            percent,
            eta_seconds,
            message: state.message.clone(),
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.sink.publish(&snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(AtomicUsize);

    impl ProgressSink for CountingSink {
        fn publish(&self, _snapshot: &ProgressSnapshot) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn percent_is_capped_below_100_until_finalized() {
        let tracker = ProgressTracker::new(4, Arc::new(NullSink));
        for _ in 0..4 {
            tracker.increment_one(None);
        }
        // All units complete but the job has not been finalized.
        assert_eq!(tracker.snapshot().percent, 99);
        assert_eq!(tracker.snapshot().completed_units, 4);

        tracker.finalize();
        assert_eq!(tracker.snapshot().percent, 100);
        assert_eq!(tracker.snapshot().eta_seconds, Some(0));
    }

    #[test]
    fn stalled_job_never_reports_done() {
        let tracker = ProgressTracker::new(3, Arc::new(NullSink));
        tracker.increment_one(None);
        tracker.increment_one(None);
        assert!(tracker.snapshot().percent < 100);
    }

    #[test]
    fn finalize_is_effective_once() {
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let tracker = ProgressTracker::new(1, sink.clone());
        let after_init = sink.0.load(Ordering::SeqCst);
        tracker.finalize();
        tracker.finalize();
        // Only the first finalize published.
        assert_eq!(sink.0.load(Ordering::SeqCst), after_init + 1);
        assert_eq!(tracker.snapshot().percent, 100);
    }

    #[test]
    fn increments_after_finalize_are_ignored() {
        let tracker = ProgressTracker::new(2, Arc::new(NullSink));
        tracker.finalize();
        tracker.increment_one(Some("late".to_string()));
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.percent, 100);
        assert_eq!(snapshot.message.as_deref(), Some("done"));
    }

    #[test]
    fn eta_shrinks_as_units_complete() {
        let tracker = ProgressTracker::new(10, Arc::new(NullSink));
        assert_eq!(tracker.snapshot().eta_seconds, None);
        tracker.increment_one(None);
        assert!(tracker.snapshot().eta_seconds.is_some());
    }

    #[test]
    fn message_is_carried_into_snapshots() {
        let tracker = ProgressTracker::new(2, Arc::new(NullSink));
        tracker.increment_one(Some("chunk 1 done".to_string()));
        assert_eq!(
            tracker.snapshot().message.as_deref(),
            Some("chunk 1 done")
        );
        // A later increment without a message keeps the previous one.
        tracker.increment_one(None);
        assert_eq!(
            tracker.snapshot().message.as_deref(),
            Some("chunk 1 done")
        );
    }
}

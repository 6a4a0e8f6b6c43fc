use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::TaskId;

/// Progress above which the remaining-time estimate extrapolates from
/// observed speed instead of the expected duration.
const EXTRAPOLATION_THRESHOLD: f64 = 0.05;

#[derive(Debug, Clone)]
pub struct ProgressMonitor {
    pub status: String,
    progress: f64,
    pub start_time: Instant,
    pub expected_duration: Duration,
}

impl ProgressMonitor {
    pub fn new(expected_duration: Duration) -> Self {
        Self {
            status: "starting".to_string(),
            progress: 0.0,
            start_time: Instant::now(),
            expected_duration,
        }
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Clamps into `[0, 1]`; NaN counts as no progress.
    pub fn update(&mut self, status: impl Into<String>, progress: f64) {
        self.status = status.into();
        self.progress = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 1.0) };
    }

    pub fn estimated_time_remaining(&self) -> Duration {
        self.estimate_for(self.start_time.elapsed())
    }

    pub fn estimate_for(&self, elapsed: Duration) -> Duration {
        if self.progress > EXTRAPOLATION_THRESHOLD {
            elapsed.mul_f64((1.0 - self.progress) / self.progress)
        } else {
            self.expected_duration.saturating_sub(elapsed)
        }
    }
}

pub(crate) type MonitorMap = Arc<Mutex<HashMap<TaskId, ProgressMonitor>>>;

/// Handed to task handlers so they can report progress for the one task
/// they are working on.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    monitors: MonitorMap,
}

impl ProgressReporter {
    pub(crate) fn new(task_id: TaskId, monitors: MonitorMap) -> Self {
        Self { task_id, monitors }
    }

    /// Reporter not attached to any agent, for driving handlers directly.
    pub fn detached(task_id: TaskId) -> Self {
        Self::new(task_id, Arc::new(Mutex::new(HashMap::new())))
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn report(&self, status: impl Into<String>, progress: f64) {
        if let Some(monitor) = self.monitors.lock().get_mut(&self.task_id) {
            monitor.update(status, progress);
        }
    }

    pub fn snapshot(&self) -> Option<ProgressMonitor> {
        self.monitors.lock().get(&self.task_id).cloned()
    }
}

//! Typed progress events for long-running operations.
//!
//! Producers emit through a [`ProgressSink`] trait object; observers that
//! are slow see coalesced (time-throttled) updates rather than blocking the
//! producer.

use std::time::{Duration, Instant};

/// High-level stage of an image preparation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resolving,
    Downloading,
    Verifying,
    Preparing,
    Completed,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Resolving => "resolving",
            Phase::Downloading => "downloading",
            Phase::Verifying => "verifying",
            Phase::Preparing => "preparing",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }
}

/// Progress update emitted by long-running operations.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub message: String,
    pub percent: f64,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub speed_bps: f64,
    pub eta: Option<Duration>,
    pub error: Option<String>,
    pub done: bool,
}

impl ProgressEvent {
    /// A bare phase/message event with no byte accounting.
    pub fn message(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            percent: 0.0,
            bytes_done: 0,
            bytes_total: 0,
            speed_bps: 0.0,
            eta: None,
            error: None,
            done: false,
        }
    }
}

/// Receives progress events.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Adapts a closure to a [`ProgressSink`].
pub struct FnSink<F: Fn(ProgressEvent) + Send + Sync>(pub F);

impl<F: Fn(ProgressEvent) + Send + Sync> ProgressSink for FnSink<F> {
    fn emit(&self, event: ProgressEvent) {
        (self.0)(event)
    }
}

/// Drops events.
pub struct NopSink;

impl ProgressSink for NopSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Clamped completion percentage.
pub(crate) fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 * 100.0 / total as f64).clamp(0.0, 100.0)
}

/// Byte-count accumulator that throttles emission to once per interval,
/// computing speed from the bytes moved since the previous emission and an
/// ETA from the remaining total.
pub(crate) struct ProgressMeter {
    total: u64,
    done: u64,
    last_done: u64,
    last_tick: Instant,
    interval: Duration,
}

impl ProgressMeter {
    pub(crate) fn new(total: u64, already_done: u64) -> Self {
        Self {
            total,
            done: already_done,
            last_done: already_done,
            last_tick: Instant::now(),
            interval: Duration::from_millis(200),
        }
    }

    pub(crate) fn done(&self) -> u64 {
        self.done
    }

    /// Record `n` transferred bytes; emit at most once per interval.
    pub(crate) fn add(&mut self, n: u64, sink: &dyn ProgressSink) {
        self.done += n;
        let elapsed = self.last_tick.elapsed();
        if elapsed < self.interval {
            return;
        }

        let delta_bytes = self.done - self.last_done;
        let delta_seconds = elapsed.as_secs_f64();
        let speed = if delta_seconds > 0.0 {
            delta_bytes as f64 / delta_seconds
        } else {
            0.0
        };
        let eta = if speed > 0.0 && self.total > self.done {
            Some(Duration::from_secs_f64(
                (self.total - self.done) as f64 / speed,
            ))
        } else {
            None
        };

        sink.emit(ProgressEvent {
            phase: Phase::Downloading,
            message: "downloading image".into(),
            percent: percent(self.done, self.total),
            bytes_done: self.done,
            bytes_total: self.total,
            speed_bps: speed,
            eta,
            error: None,
            done: false,
        });
        self.last_tick = Instant::now();
        self.last_done = self.done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectSink(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for CollectSink {
        fn emit(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn test_percent_bounds() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(50, 100), 50.0);
        assert_eq!(percent(200, 100), 100.0);
    }

    #[test]
    fn test_meter_throttles() {
        let sink = CollectSink(Mutex::new(Vec::new()));
        let mut meter = ProgressMeter::new(1000, 0);
        // Rapid additions inside one interval produce no events.
        for _ in 0..10 {
            meter.add(10, &sink);
        }
        assert!(sink.0.lock().unwrap().is_empty());
        assert_eq!(meter.done(), 100);
    }

    #[test]
    fn test_meter_emits_after_interval() {
        let sink = CollectSink(Mutex::new(Vec::new()));
        let mut meter = ProgressMeter::new(1000, 0);
        meter.interval = Duration::from_millis(0);
        meter.add(500, &sink);
        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].bytes_done, 500);
        assert_eq!(events[0].percent, 50.0);
    }

    #[test]
    fn test_meter_resume_offset() {
        let meter = ProgressMeter::new(100, 40);
        assert_eq!(meter.done(), 40);
    }
}

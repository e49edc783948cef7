// src/stats.rs
//! Counters and timing for the light manager.

use std::time::Duration;

use serde::Serialize;

/// Rolling window of recreate durations (ms). Fixed capacity ring, no allocation after `new`.
#[derive(Debug, Clone)]
pub struct UpdateTimings {
    samples: Vec<f32>,
    capacity: usize,
    index: usize,
}

impl UpdateTimings {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            index: 0,
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f32() * 1000.0;
        if self.samples.len() < self.capacity {
            self.samples.push(ms);
        } else {
            self.samples[self.index] = ms;
        }
        self.index = (self.index + 1) % self.capacity;
    }

    /// Average over the window, 0 when nothing was recorded.
    pub fn average_ms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f32>() / self.samples.len() as f32
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Monotonic totals since startup.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Counters {
    pub created: u64,
    pub destroyed: u64,
    pub updates_applied: u64,
    pub updates_coalesced: u64,
    pub updates_dropped: u64,
    pub update_failures: u64,
    pub draw_calls: u64,
    pub draw_failures: u64,
    pub gc_passes: u64,
    pub gc_collected: u64,
}

/// Point-in-time view of the service.
#[derive(Debug, Default, Clone, Serialize)]
pub struct LightStats {
    pub live_lights: usize,
    pub tracked_entities: usize,
    pub pending_updates: usize,
    pub deferred_destroys: usize,
    pub in_frame: bool,
    pub frames_drawn: u64,

    pub created: u64,
    pub destroyed: u64,
    pub updates_applied: u64,
    pub updates_coalesced: u64,
    pub updates_dropped: u64,
    pub update_failures: u64,
    pub draw_calls: u64,
    pub draw_failures: u64,
    pub gc_passes: u64,
    pub gc_collected: u64,

    pub average_update_ms: f32,
}

impl LightStats {
    pub(crate) fn apply_counters(&mut self, c: &Counters) {
        self.created = c.created;
        self.destroyed = c.destroyed;
        self.updates_applied = c.updates_applied;
        self.updates_coalesced = c.updates_coalesced;
        self.updates_dropped = c.updates_dropped;
        self.update_failures = c.update_failures;
        self.draw_calls = c.draw_calls;
        self.draw_failures = c.draw_failures;
        self.gc_passes = c.gc_passes;
        self.gc_collected = c.gc_collected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_rolls_over() {
        let mut timings = UpdateTimings::new(2);
        assert_eq!(timings.average_ms(), 0.0);

        timings.record(Duration::from_millis(2));
        timings.record(Duration::from_millis(4));
        assert!((timings.average_ms() - 3.0).abs() < 1e-3);

        timings.record(Duration::from_millis(10));
        assert_eq!(timings.len(), 2);
        assert!((timings.average_ms() - 7.0).abs() < 1e-3);
    }
}

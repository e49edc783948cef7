// src/frame.rs
//! Frame bracket bookkeeping.
//!
//! Updates submitted while a frame is open are queued here and applied by the next
//! flush (EndFrame, or BeginFrame for anything still left over). Queueing a second
//! update for the same handle supersedes the first, so a light that changes every
//! tick is recreated once per frame.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::backend::LightHandle;
use crate::light::LightProperties;

/// Two-state frame machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FramePhase {
    #[default]
    Idle,
    InFrame,
}

/// A deferred recreate request. Consumed exactly once, in submission order.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub target: LightHandle,
    pub properties: LightProperties,
    /// Cleared when a later update for the same target supersedes this one.
    pub needs_update: bool,
}

/// FIFO of pending updates with last-write-wins per target.
///
/// Entries are numbered in submission order; `latest` maps each target to the number
/// of its newest entry, so an entry's slot is `seq - head`.
#[derive(Default)]
pub struct PendingUpdateQueue {
    entries: VecDeque<PendingUpdate>,
    latest: HashMap<LightHandle, u64>,
    head: u64,
}

impl PendingUpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an update. Returns true if it superseded an earlier pending update.
    pub fn push(&mut self, target: LightHandle, properties: LightProperties) -> bool {
        let seq = self.head + self.entries.len() as u64;
        let superseded = match self.latest.insert(target, seq) {
            Some(previous) => {
                if let Some(entry) = self.entries.get_mut((previous - self.head) as usize) {
                    entry.needs_update = false;
                }
                true
            }
            None => false,
        };
        self.entries.push_back(PendingUpdate {
            target,
            properties,
            needs_update: true,
        });
        superseded
    }

    /// Take the oldest entry. Whatever is still queued stays queued if the caller
    /// bails out before the next pop.
    pub fn pop_front(&mut self) -> Option<PendingUpdate> {
        let entry = self.entries.pop_front()?;
        let seq = self.head;
        self.head += 1;
        if self.latest.get(&entry.target) == Some(&seq) {
            self.latest.remove(&entry.target);
        }
        Some(entry)
    }

    /// True if a live (not superseded) update targets `handle`.
    #[inline]
    pub fn contains(&self, handle: LightHandle) -> bool {
        self.latest.contains_key(&handle)
    }

    /// Latest queued properties for `handle`.
    pub fn latest_for(&self, handle: LightHandle) -> Option<&LightProperties> {
        let seq = *self.latest.get(&handle)?;
        self.entries
            .get((seq - self.head) as usize)
            .map(|entry| &entry.properties)
    }

    /// Live updates waiting for a flush.
    #[inline]
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// Take every entry in submission order, including superseded ones
    /// (`needs_update == false`).
    pub fn drain(&mut self) -> Vec<PendingUpdate> {
        self.head += self.entries.len() as u64;
        self.latest.clear();
        self.entries.drain(..).collect()
    }
}

/// What one flush did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Recreates that succeeded and were swapped in.
    pub applied: usize,
    /// Entries skipped because a later update for the same light superseded them.
    pub coalesced: usize,
    /// Entries whose target was destroyed before the flush.
    pub dropped: usize,
    /// Recreates the backend refused; the old light stays.
    pub failed: usize,
    /// Deferred destroys released to the backend.
    pub released: usize,
}

impl FlushReport {
    pub fn merge(&mut self, other: FlushReport) {
        self.applied += other.applied;
        self.coalesced += other.coalesced;
        self.dropped += other.dropped;
        self.failed += other.failed;
        self.released += other.released;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn handle(raw: u64) -> LightHandle {
        LightHandle::from_raw(raw).unwrap()
    }

    fn props(size: f32) -> LightProperties {
        LightProperties::new(Vec3::ZERO, size, 1.0, Vec3::ONE).unwrap()
    }

    #[test]
    fn later_update_supersedes_earlier() {
        let mut queue = PendingUpdateQueue::new();
        assert!(!queue.push(handle(1), props(10.0)));
        assert!(!queue.push(handle(2), props(5.0)));
        assert!(queue.push(handle(1), props(20.0)));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.latest_for(handle(1)).map(|p| p.size()), Some(20.0));

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        let live: Vec<(u64, f32)> = drained
            .iter()
            .filter(|u| u.needs_update)
            .map(|u| (u.target.raw(), u.properties.size()))
            .collect();
        assert_eq!(live, vec![(2, 5.0), (1, 20.0)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_front_keeps_the_rest_queued() {
        let mut queue = PendingUpdateQueue::new();
        queue.push(handle(1), props(10.0));
        queue.push(handle(2), props(5.0));
        queue.push(handle(1), props(20.0));

        let first = queue.pop_front().unwrap();
        assert_eq!(first.target, handle(1));
        assert!(!first.needs_update);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.latest_for(handle(1)).map(|p| p.size()), Some(20.0));

        // Pushes after a partial pop still supersede the right slot.
        assert!(queue.push(handle(2), props(7.0)));
        let second = queue.pop_front().unwrap();
        assert_eq!(second.target, handle(2));
        assert!(!second.needs_update);

        let rest: Vec<(u64, f32, bool)> = std::iter::from_fn(|| queue.pop_front())
            .map(|u| (u.target.raw(), u.properties.size(), u.needs_update))
            .collect();
        assert_eq!(rest, vec![(1, 20.0, true), (2, 7.0, true)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_resets_lookup() {
        let mut queue = PendingUpdateQueue::new();
        queue.push(handle(3), props(1.0));
        assert!(queue.contains(handle(3)));
        assert_eq!(queue.drain().len(), 1);
        assert!(!queue.contains(handle(3)));
        assert!(queue.latest_for(handle(3)).is_none());
    }

    #[test]
    fn reports_merge() {
        let mut total = FlushReport {
            applied: 1,
            ..Default::default()
        };
        total.merge(FlushReport {
            applied: 2,
            dropped: 1,
            released: 3,
            ..Default::default()
        });
        assert_eq!(total.applied, 3);
        assert_eq!(total.dropped, 1);
        assert_eq!(total.released, 3);
    }
}

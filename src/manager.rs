// src/manager.rs
//! Managed light service.
//! - Resource table + entity index behind one state lock (dedup is O(1) per entity)
//! - Recreate-on-update: create new, swap, then release old; never a partial state
//! - Frame bracket: updates inside a frame are queued, coalesced and flushed on EndFrame
//! - Deferred destruction: handles replaced or destroyed mid-frame are released by the next BeginFrame
//! - GC: validator pass every N drawn frames, rate limited, grace window, fail-safe on errors
//!
//! Locking: `state` is the only lock guarding lights, queue and frame phase. `validator`
//! and `last_gc` are leaf locks and are never held while `state` is acquired. Backend
//! calls happen under `state` (the backend is serialized and non-blocking); the validator
//! is only ever called with no lock held.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::backend::{LightBackend, LightHandle};
use crate::config::LightManagerConfig;
use crate::frame::{FlushReport, FramePhase, PendingUpdateQueue};
use crate::light::{EntityId, LightDescriptor, LightProperties};
use crate::resource_table::{ManagedLight, ResourceTable};
use crate::stats::{Counters, LightStats, UpdateTimings};
use crate::validator::{check_entity, EntityValidator, GcReport, Verdict};
use crate::{Error, Result};

// ---------- Results ----------

/// How an accepted update was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Applied synchronously; the light now lives under this handle.
    Applied(LightHandle),
    /// Queued for the end of the current frame. Use `resolve_handle` afterwards.
    Deferred,
}

impl UpdateOutcome {
    #[inline]
    pub fn new_handle(self) -> Option<LightHandle> {
        match self {
            UpdateOutcome::Applied(handle) => Some(handle),
            UpdateOutcome::Deferred => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrawReport {
    pub drawn: usize,
    pub failed: usize,
    /// Set when this draw triggered a GC pass that actually ran.
    pub gc: Option<GcReport>,
}

// ---------- Guards ----------

/// Single-flight flag, cleared on every exit path.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlagGuard(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

thread_local! {
    /// Managers this thread is currently inside `update_light` for.
    static UPDATING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Per-thread re-entrancy marker for `update_light`. Other threads are not rejected,
/// they wait on the state lock.
struct UpdateScope {
    key: usize,
}

impl UpdateScope {
    fn enter(key: usize) -> Option<Self> {
        UPDATING.with(|active| {
            let mut active = active.borrow_mut();
            if active.contains(&key) {
                None
            } else {
                active.push(key);
                Some(UpdateScope { key })
            }
        })
    }
}

impl Drop for UpdateScope {
    fn drop(&mut self) {
        let _ = UPDATING.try_with(|active| active.borrow_mut().retain(|&k| k != self.key));
    }
}

// ---------- State ----------

struct LightState {
    table: ResourceTable,
    queue: PendingUpdateQueue,
    /// Old handles waiting for the next BeginFrame before the backend releases them.
    retired: Vec<LightHandle>,
    /// old -> new for recreates applied by the most recent flushes.
    forwards: HashMap<LightHandle, LightHandle>,
    phase: FramePhase,
    shut_down: bool,
    counters: Counters,
    timings: UpdateTimings,
}

// ---------- LightManager ----------

pub struct LightManager {
    backend: Arc<dyn LightBackend>,
    cfg: LightManagerConfig,
    state: Mutex<LightState>,
    validator: RwLock<Option<Arc<dyn EntityValidator>>>,
    drawing: AtomicBool,
    collecting: AtomicBool,
    frames_drawn: AtomicU64,
    last_gc: Mutex<Option<Instant>>,
}

impl LightManager {
    pub fn new(backend: Arc<dyn LightBackend>, cfg: LightManagerConfig) -> Self {
        let state = LightState {
            table: ResourceTable::with_capacity(cfg.max_lights.min(1024)),
            queue: PendingUpdateQueue::new(),
            retired: Vec::new(),
            forwards: HashMap::new(),
            phase: FramePhase::Idle,
            shut_down: false,
            counters: Counters::default(),
            timings: UpdateTimings::new(cfg.timing_samples),
        };
        log::info!(
            "light manager initialized (max {} lights, gc every {} frames / {:?}, grace {:?})",
            cfg.max_lights,
            cfg.gc_frame_interval.max(1),
            cfg.gc_min_interval(),
            cfg.gc_grace_window()
        );
        Self {
            backend,
            cfg,
            state: Mutex::new(state),
            validator: RwLock::new(None),
            drawing: AtomicBool::new(false),
            collecting: AtomicBool::new(false),
            frames_drawn: AtomicU64::new(0),
            last_gc: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LightManagerConfig {
        &self.cfg
    }

    // ---------- Public API ----------

    /// Create a light, or return the existing handle if `entity` already owns one.
    /// On backend failure nothing changes.
    pub fn create_light(
        &self,
        properties: LightProperties,
        entity: Option<EntityId>,
    ) -> Result<LightHandle> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.shut_down {
            return Err(Error::ShutDown);
        }

        if let Some(entity) = entity {
            if let Some(existing) = state.table.handle_for_entity(entity) {
                log::debug!("entity {} already owns light {}, reusing", entity, existing);
                return Ok(existing);
            }
        }

        if state.table.len() >= self.cfg.max_lights {
            log::warn!("light limit reached ({}), create refused", self.cfg.max_lights);
            return Err(Error::CapacityExceeded {
                limit: self.cfg.max_lights,
            });
        }

        let desc = LightDescriptor::sphere(&properties);
        let handle = self.backend.create_light(&desc).map_err(|err| {
            log::warn!("backend create failed: {}", err);
            Error::from(err)
        })?;
        state.counters.created += 1;

        let now = Instant::now();
        state.table.insert(ManagedLight {
            handle,
            properties,
            owning_entity: entity,
            last_update: now,
            needs_update: false,
            update_count: 0,
        });
        log::debug!(
            "created light {} at {:?} size {} (entity {:?}, total {})",
            handle,
            properties.position(),
            properties.size(),
            entity,
            state.table.len()
        );
        Ok(handle)
    }

    /// Replace the properties of a live light.
    ///
    /// Idle: recreate now, release the old handle, return the new one.
    /// In frame: queue the update for the end of the frame.
    /// An unknown handle is rejected; a backend failure leaves the old light intact.
    pub fn update_light(
        &self,
        handle: LightHandle,
        properties: LightProperties,
    ) -> Result<UpdateOutcome> {
        let _scope = UpdateScope::enter(self.key()).ok_or_else(|| {
            log::error!("re-entrant update_light for {} ignored", handle);
            Error::Reentrant("update_light")
        })?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.shut_down {
            return Err(Error::ShutDown);
        }
        if !state.table.contains(handle) {
            log::warn!("update of unknown light {} rejected", handle);
            return Err(Error::InvalidHandle(handle));
        }

        if state.phase == FramePhase::InFrame {
            if state.queue.push(handle, properties) {
                log::debug!("update for {} supersedes a queued one", handle);
            }
            if let Some(light) = state.table.get_mut(handle) {
                light.needs_update = true;
            }
            return Ok(UpdateOutcome::Deferred);
        }

        let new_handle = self.recreate(state, handle, properties)?;
        self.release(state, handle);
        Ok(UpdateOutcome::Applied(new_handle))
    }

    /// Destroy a light. Unknown or already destroyed handles are a no-op.
    /// Returns whether a light was removed.
    pub fn destroy_light(&self, handle: LightHandle) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.table.remove(handle).is_none() {
            log::debug!("destroy of unknown light {} ignored", handle);
            return false;
        }
        self.retire(state, handle);
        log::debug!("destroyed light {} (remaining {})", handle, state.table.len());
        true
    }

    /// Open a frame. Releases last frame's deferred destroys and flushes anything
    /// still queued. Calling it twice without `end_frame` is an error and changes nothing.
    pub fn begin_frame(&self) -> Result<FlushReport> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.shut_down {
            return Err(Error::ShutDown);
        }
        if state.phase == FramePhase::InFrame {
            log::error!("begin_frame called while a frame is already open");
            return Err(Error::FrameBracket("begin_frame called twice"));
        }

        let mut report = FlushReport {
            released: self.release_retired(state),
            ..Default::default()
        };
        report.merge(self.flush_pending(state));
        state.phase = FramePhase::InFrame;
        Ok(report)
    }

    /// Close the frame and apply the updates queued during it.
    pub fn end_frame(&self) -> Result<FlushReport> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.shut_down {
            return Err(Error::ShutDown);
        }
        if state.phase == FramePhase::Idle {
            log::error!("end_frame called without a matching begin_frame");
            return Err(Error::FrameBracket("end_frame without begin_frame"));
        }

        state.phase = FramePhase::Idle;
        state.forwards.clear();
        Ok(self.flush_pending(state))
    }

    /// Open a frame that closes itself when the scope is dropped.
    pub fn frame(&self) -> Result<FrameScope<'_>> {
        let begin = self.begin_frame()?;
        Ok(FrameScope {
            manager: self,
            begin,
            open: true,
        })
    }

    /// Draw every live light. Failures are logged, never removed here.
    /// Every `gc_frame_interval` draws this also attempts a GC pass.
    pub fn draw_lights(&self) -> Result<DrawReport> {
        let Some(_drawing) = FlagGuard::try_acquire(&self.drawing) else {
            log::error!("re-entrant draw_lights call ignored");
            return Err(Error::Reentrant("draw_lights"));
        };

        let mut report = DrawReport::default();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.shut_down {
                return Err(Error::ShutDown);
            }
            for light in state.table.iter() {
                match self.backend.draw_light_instance(light.handle) {
                    Ok(()) => report.drawn += 1,
                    Err(err) => {
                        log::warn!("failed to draw light {}: {}", light.handle, err);
                        report.failed += 1;
                    }
                }
            }
            state.counters.draw_calls += (report.drawn + report.failed) as u64;
            state.counters.draw_failures += report.failed as u64;
        }

        let frames = self.frames_drawn.fetch_add(1, Ordering::Relaxed) + 1;
        if frames % self.cfg.gc_frame_interval.max(1) == 0 {
            report.gc = self.collect_garbage_if_due();
        }
        Ok(report)
    }

    /// Install the entity liveness check used by GC. Replaces any previous one.
    pub fn register_entity_validator<V>(&self, validator: V)
    where
        V: EntityValidator + 'static,
    {
        *self.validator.write() = Some(Arc::new(validator));
        log::info!("entity validator registered");
    }

    pub fn clear_entity_validator(&self) {
        *self.validator.write() = None;
    }

    /// Run a GC pass if the minimum interval since the last one has elapsed.
    pub fn collect_garbage_if_due(&self) -> Option<GcReport> {
        if let Some(last) = *self.last_gc.lock() {
            if last.elapsed() < self.cfg.gc_min_interval() {
                return None;
            }
        }
        match self.collect_garbage() {
            Ok(report) if report.ran => Some(report),
            Ok(_) => None,
            Err(err) => {
                log::debug!("gc pass skipped: {}", err);
                None
            }
        }
    }

    /// Run a GC pass now, ignoring the rate limit.
    ///
    /// An entity's light is collected only if the validator says the entity is gone
    /// and the light has not been updated for the grace window. Nothing is collected
    /// unless at least one entity validated alive.
    pub fn collect_garbage(&self) -> Result<GcReport> {
        let Some(_collecting) = FlagGuard::try_acquire(&self.collecting) else {
            log::warn!("gc pass already running, overlapping pass ignored");
            return Err(Error::Reentrant("collect_garbage"));
        };

        let Some(validator) = self.validator.read().clone() else {
            return Ok(GcReport::default());
        };

        let entries = {
            let state = self.state.lock();
            if state.shut_down {
                return Err(Error::ShutDown);
            }
            state.table.entity_entries()
        };

        let grace = self.cfg.gc_grace_window();
        let now = Instant::now();
        let mut report = GcReport {
            ran: true,
            examined: entries.len(),
            ..Default::default()
        };

        let mut candidates = Vec::new();
        for entry in entries {
            match check_entity(validator.as_ref(), entry.entity) {
                Verdict::Alive => report.alive += 1,
                Verdict::Unknown => report.unknown += 1,
                Verdict::Gone => {
                    if now.saturating_duration_since(entry.last_update) >= grace {
                        candidates.push(entry);
                    } else {
                        report.spared += 1;
                    }
                }
            }
        }
        report.candidates = candidates.len();
        *self.last_gc.lock() = Some(Instant::now());

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.counters.gc_passes += 1;

        if !candidates.is_empty() && report.alive == 0 {
            log::warn!(
                "{} lights look orphaned but no entity validated alive, keeping them",
                candidates.len()
            );
            report.withheld = true;
        } else {
            for candidate in candidates {
                // Re-check under the lock: the light may have been updated, destroyed or
                // replaced while the validator ran.
                if state.table.handle_for_entity(candidate.entity) != Some(candidate.handle) {
                    continue;
                }
                let untouched = state
                    .table
                    .get(candidate.handle)
                    .is_some_and(|light| light.last_update == candidate.last_update);
                if !untouched || state.table.remove(candidate.handle).is_none() {
                    continue;
                }
                self.retire(state, candidate.handle);
                report.collected += 1;
                log::debug!(
                    "collected light {} of vanished entity {}",
                    candidate.handle,
                    candidate.entity
                );
            }
            state.counters.gc_collected += report.collected as u64;
        }

        log::info!(
            "gc pass: examined {}, alive {}, unknown {}, spared {}, collected {}",
            report.examined,
            report.alive,
            report.unknown,
            report.spared,
            report.collected
        );
        Ok(report)
    }

    /// Destroy every light and deferred destroy. Later mutations fail with `ShutDown`.
    /// Returns how many backend resources were released.
    pub fn shutdown(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.shut_down {
            return 0;
        }
        state.shut_down = true;
        state.phase = FramePhase::Idle;

        let released = self.release_retired(state);
        let abandoned = state.queue.drain().len();
        state.forwards.clear();

        let lights = state.table.drain();
        for light in &lights {
            self.backend.destroy_light(light.handle);
        }
        state.counters.destroyed += lights.len() as u64;

        log::info!(
            "light manager shut down: {} lights destroyed, {} deferred released, {} queued updates dropped",
            lights.len(),
            released,
            abandoned
        );
        lights.len() + released
    }

    // ---------- Queries ----------

    /// True iff the handle is live in the table. A handle with a queued update stays in
    /// the table until its replacement is swapped in.
    pub fn is_valid_handle(&self, handle: LightHandle) -> bool {
        self.state.lock().table.contains(handle)
    }

    /// Map a possibly stale handle to the live handle of the same light, following
    /// replacements made by recent frame flushes.
    pub fn resolve_handle(&self, handle: LightHandle) -> Option<LightHandle> {
        let state = self.state.lock();
        if state.table.contains(handle) {
            return Some(handle);
        }
        let mut current = handle;
        for _ in 0..state.forwards.len() {
            let next = *state.forwards.get(&current)?;
            if state.table.contains(next) {
                return Some(next);
            }
            current = next;
        }
        None
    }

    pub fn light_count(&self) -> usize {
        self.state.lock().table.len()
    }

    pub fn has_light_for_entity(&self, entity: EntityId) -> bool {
        self.state.lock().table.handle_for_entity(entity).is_some()
    }

    pub fn handle_for_entity(&self, entity: EntityId) -> Option<LightHandle> {
        self.state.lock().table.handle_for_entity(entity)
    }

    pub fn properties(&self, handle: LightHandle) -> Option<LightProperties> {
        self.state.lock().table.get(handle).map(|light| light.properties)
    }

    /// Snapshot of one managed record.
    pub fn light(&self, handle: LightHandle) -> Option<ManagedLight> {
        self.state.lock().table.get(handle).cloned()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    pub fn in_frame(&self) -> bool {
        self.state.lock().phase == FramePhase::InFrame
    }

    pub fn pending_updates(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Properties the next flush will apply to `handle`, if an update is queued.
    pub fn queued_properties(&self, handle: LightHandle) -> Option<LightProperties> {
        let state = self.state.lock();
        if !state.queue.contains(handle) {
            return None;
        }
        state.queue.latest_for(handle).copied()
    }

    pub fn is_consistent(&self) -> bool {
        self.state.lock().table.is_consistent()
    }

    pub fn stats(&self) -> LightStats {
        let state = self.state.lock();
        let mut stats = LightStats {
            live_lights: state.table.len(),
            tracked_entities: state.table.entity_count(),
            pending_updates: state.queue.len(),
            deferred_destroys: state.retired.len(),
            in_frame: state.phase == FramePhase::InFrame,
            frames_drawn: self.frames_drawn.load(Ordering::Relaxed),
            average_update_ms: state.timings.average_ms(),
            ..Default::default()
        };
        stats.apply_counters(&state.counters);
        stats
    }

    // ---------- Helpers ----------

    #[inline]
    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Create the replacement backend light and swap it into the record of `old`.
    /// The old handle is left for the caller to release or retire.
    fn recreate(
        &self,
        state: &mut LightState,
        old: LightHandle,
        properties: LightProperties,
    ) -> Result<LightHandle> {
        let started = Instant::now();
        let desc = LightDescriptor::sphere(&properties);
        let new_handle = match self.backend.create_light(&desc) {
            Ok(handle) => handle,
            Err(err) => {
                state.counters.update_failures += 1;
                log::warn!("recreate of light {} failed, keeping it: {}", old, err);
                return Err(Error::from(err).context(format!("updating light {}", old)));
            }
        };
        state.counters.created += 1;

        state.table.swap(old, new_handle, properties, Instant::now());
        state.counters.updates_applied += 1;
        state.timings.record(started.elapsed());
        log::debug!("light {} recreated as {}", old, new_handle);
        Ok(new_handle)
    }

    /// Apply the queue in submission order. Replaced handles are retired, not released.
    ///
    /// Entries are taken one at a time: if a backend call unwinds out of the flush,
    /// the entry in hand is abandoned and everything behind it stays queued for the
    /// next flush.
    fn flush_pending(&self, state: &mut LightState) -> FlushReport {
        let mut report = FlushReport::default();
        while let Some(update) = state.queue.pop_front() {
            if !update.needs_update {
                report.coalesced += 1;
                state.counters.updates_coalesced += 1;
                continue;
            }
            let Some(light) = state.table.get_mut(update.target) else {
                log::debug!("dropping queued update for destroyed light {}", update.target);
                report.dropped += 1;
                state.counters.updates_dropped += 1;
                continue;
            };
            // Cleared before the backend call so an unwind never leaves it set.
            light.needs_update = false;

            match self.recreate(state, update.target, update.properties) {
                Ok(new_handle) => {
                    state.retired.push(update.target);
                    state.forwards.insert(update.target, new_handle);
                    report.applied += 1;
                }
                Err(_) => report.failed += 1,
            }
        }
        if report != FlushReport::default() {
            log::debug!("frame flush: {:?}", report);
        }
        report
    }

    /// Release a removed handle now when idle, or defer it to the next BeginFrame when
    /// a frame is open and a draw may still reference it.
    fn retire(&self, state: &mut LightState, handle: LightHandle) {
        match state.phase {
            FramePhase::InFrame => state.retired.push(handle),
            FramePhase::Idle => self.release(state, handle),
        }
    }

    fn release(&self, state: &mut LightState, handle: LightHandle) {
        self.backend.destroy_light(handle);
        state.counters.destroyed += 1;
    }

    fn release_retired(&self, state: &mut LightState) -> usize {
        let retired = std::mem::take(&mut state.retired);
        for &handle in &retired {
            self.release(state, handle);
        }
        retired.len()
    }
}

impl Drop for LightManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------- Scoped frame ----------

/// Open frame bracket. Ends the frame on drop; `end` does it explicitly and reports.
pub struct FrameScope<'a> {
    manager: &'a LightManager,
    begin: FlushReport,
    open: bool,
}

impl FrameScope<'_> {
    /// What the opening BeginFrame flushed.
    pub fn begin_report(&self) -> FlushReport {
        self.begin
    }

    pub fn end(mut self) -> Result<FlushReport> {
        self.open = false;
        self.manager.end_frame()
    }
}

impl Drop for FrameScope<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.manager.end_frame() {
                log::error!("closing frame scope failed: {}", err);
            }
        }
    }
}

// src/backend.rs
//! Backend adapter: the narrow call surface into the native light API.
//!
//! The native API hands out opaque light handles and has no mutate-in-place
//! operation, so the whole contract is create / destroy / draw-instance.
//! `HeadlessBackend` is an in-memory implementation with failure injection,
//! used by the demo binary and the test suites.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::light::LightDescriptor;

// ---------- Handle type ----------

/// Opaque backend light handle. Never dereferenced by the service, equality only.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct LightHandle(NonZeroU64);

impl LightHandle {
    /// Wrap a raw native value. Zero is the native "null handle" and is rejected.
    #[inline]
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(LightHandle)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for LightHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

// ---------- Errors ----------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("light creation rejected: {0}")]
    CreateFailed(String),

    #[error("draw of light {handle} failed: {reason}")]
    DrawFailed { handle: LightHandle, reason: String },

    #[error("backend unavailable")]
    Unavailable,
}

// ---------- Adapter trait ----------

/// Native light API. Every call may fail; none of the failures are fatal to the service.
///
/// Implementations are called with the service's state lock held, so they must not
/// block. A nested `update_light` from inside a backend call is rejected; other
/// nested manager calls deadlock.
pub trait LightBackend: Send + Sync {
    fn create_light(&self, desc: &LightDescriptor) -> Result<LightHandle, BackendError>;

    /// Release a handle. Destroying an unknown handle must be harmless.
    fn destroy_light(&self, handle: LightHandle);

    fn draw_light_instance(&self, handle: LightHandle) -> Result<(), BackendError>;
}

// ---------- Headless backend ----------

/// In-memory backend. Allocates sequential handles and keeps the descriptor of
/// every live light so callers can inspect what was submitted.
pub struct HeadlessBackend {
    next_handle: AtomicU64,
    live: Mutex<HashMap<LightHandle, LightDescriptor>>,
    drawn: Mutex<Vec<LightHandle>>,
    failing_draws: Mutex<HashSet<LightHandle>>,
    fail_creates: AtomicUsize,

    created: AtomicU64,
    destroyed: AtomicU64,
    draw_calls: AtomicU64,
    unknown_destroys: AtomicU64,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(0x1000),
            live: Mutex::new(HashMap::new()),
            drawn: Mutex::new(Vec::new()),
            failing_draws: Mutex::new(HashSet::new()),
            fail_creates: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            draw_calls: AtomicU64::new(0),
            unknown_destroys: AtomicU64::new(0),
        }
    }

    /// The next `count` create calls fail.
    pub fn fail_next_creates(&self, count: usize) {
        self.fail_creates.store(count, Ordering::SeqCst);
    }

    /// Draw calls for `handle` fail until cleared.
    pub fn fail_draws_for(&self, handle: LightHandle) {
        self.failing_draws.lock().insert(handle);
    }

    pub fn clear_draw_failures(&self) {
        self.failing_draws.lock().clear();
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_live(&self, handle: LightHandle) -> bool {
        self.live.lock().contains_key(&handle)
    }

    pub fn descriptor(&self, handle: LightHandle) -> Option<LightDescriptor> {
        self.live.lock().get(&handle).copied()
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn destroyed_count(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    pub fn draw_calls(&self) -> u64 {
        self.draw_calls.load(Ordering::Relaxed)
    }

    /// Destroys of handles this backend never issued or already released.
    pub fn unknown_destroys(&self) -> u64 {
        self.unknown_destroys.load(Ordering::Relaxed)
    }

    /// Handles drawn since the last call, in draw order.
    pub fn take_drawn(&self) -> Vec<LightHandle> {
        std::mem::take(&mut *self.drawn.lock())
    }
}

impl LightBackend for HeadlessBackend {
    fn create_light(&self, desc: &LightDescriptor) -> Result<LightHandle, BackendError> {
        let pending_failures = self.fail_creates.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_creates.store(pending_failures - 1, Ordering::SeqCst);
            return Err(BackendError::CreateFailed("injected failure".into()));
        }

        let raw = self.next_handle.fetch_add(0x10, Ordering::Relaxed);
        let handle = LightHandle::from_raw(raw).ok_or(BackendError::Unavailable)?;
        self.live.lock().insert(handle, *desc);
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn destroy_light(&self, handle: LightHandle) {
        if self.live.lock().remove(&handle).is_some() {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
        } else {
            log::warn!("headless backend: destroy of unknown light {}", handle);
            self.unknown_destroys.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn draw_light_instance(&self, handle: LightHandle) -> Result<(), BackendError> {
        self.draw_calls.fetch_add(1, Ordering::Relaxed);
        if !self.live.lock().contains_key(&handle) {
            return Err(BackendError::DrawFailed {
                handle,
                reason: "handle not live".into(),
            });
        }
        if self.failing_draws.lock().contains(&handle) {
            return Err(BackendError::DrawFailed {
                handle,
                reason: "injected failure".into(),
            });
        }
        self.drawn.lock().push(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::light::LightProperties;
    use glam::Vec3;

    fn descriptor() -> LightDescriptor {
        let props = LightProperties::new(Vec3::ZERO, 10.0, 1.0, Vec3::ONE).unwrap();
        LightDescriptor::sphere(&props)
    }

    #[test]
    fn zero_is_not_a_handle() {
        assert!(LightHandle::from_raw(0).is_none());
        assert_eq!(LightHandle::from_raw(42).map(LightHandle::raw), Some(42));
    }

    #[test]
    fn headless_handles_are_unique_and_tracked() {
        let backend = HeadlessBackend::new();
        let a = backend.create_light(&descriptor()).unwrap();
        let b = backend.create_light(&descriptor()).unwrap();
        assert_ne!(a, b);
        assert_eq!(backend.live_count(), 2);

        backend.destroy_light(a);
        backend.destroy_light(a);
        assert_eq!(backend.live_count(), 1);
        assert_eq!(backend.destroyed_count(), 1);
        assert_eq!(backend.unknown_destroys(), 1);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let backend = HeadlessBackend::new();
        backend.fail_next_creates(1);
        assert!(backend.create_light(&descriptor()).is_err());
        let handle = backend.create_light(&descriptor()).unwrap();

        backend.fail_draws_for(handle);
        assert!(backend.draw_light_instance(handle).is_err());
        backend.clear_draw_failures();
        assert!(backend.draw_light_instance(handle).is_ok());
        assert_eq!(backend.take_drawn(), vec![handle]);
    }
}

// src/host.rs
//! Script bridge: the host-facing surface of the light manager.
//!
//! Arguments arrive as plain script numbers and handles cross as raw `u64`. Nothing
//! escapes an entry point: errors are logged and flattened into `None`/`false`,
//! panics are caught the same way.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::backend::LightHandle;
use crate::light::{EntityId, LightProperties};
use crate::manager::{LightManager, UpdateOutcome};
use crate::validator::EntityValidator;
use crate::{Error, Result};

/// Run one entry point with error and panic isolation.
fn guarded<T>(op: &'static str, fallback: T, f: impl FnOnce() -> Result<T>) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            log::warn!("{}: {}", op, err);
            fallback
        }
        Err(_) => {
            log::error!("{} panicked, call abandoned", op);
            fallback
        }
    }
}

fn parse_handle(raw: u64) -> Result<LightHandle> {
    LightHandle::from_raw(raw).ok_or_else(|| Error::custom("null light handle"))
}

/// Script validator: an entity-id callback that may itself fail.
struct ScriptValidator<F>(F);

impl<F> EntityValidator for ScriptValidator<F>
where
    F: Fn(u64) -> anyhow::Result<bool> + Send + Sync,
{
    fn is_alive(&self, entity: EntityId) -> anyhow::Result<bool> {
        (self.0)(entity.0)
    }
}

#[derive(Clone)]
pub struct ScriptBridge {
    manager: Arc<LightManager>,
}

impl ScriptBridge {
    pub fn new(manager: Arc<LightManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<LightManager> {
        &self.manager
    }

    /// Returns the new handle, or the existing one if `entity` already owns a light.
    #[allow(clippy::too_many_arguments)]
    pub fn create_light(
        &self,
        x: f64,
        y: f64,
        z: f64,
        size: f64,
        brightness: f64,
        r: f64,
        g: f64,
        b: f64,
        entity: Option<u64>,
    ) -> Option<u64> {
        guarded("create_light", None, || {
            let props = LightProperties::from_script(x, y, z, size, brightness, r, g, b)?;
            let handle = self.manager.create_light(props, entity.map(EntityId))?;
            Ok(Some(handle.raw()))
        })
    }

    /// `(accepted, new_handle)`. Inside a frame the update is queued and no handle is
    /// returned yet.
    #[allow(clippy::too_many_arguments)]
    pub fn update_light(
        &self,
        handle: u64,
        x: f64,
        y: f64,
        z: f64,
        size: f64,
        brightness: f64,
        r: f64,
        g: f64,
        b: f64,
    ) -> (bool, Option<u64>) {
        guarded("update_light", (false, None), || {
            let handle = parse_handle(handle)?;
            let props = LightProperties::from_script(x, y, z, size, brightness, r, g, b)?;
            match self.manager.update_light(handle, props)? {
                UpdateOutcome::Applied(new_handle) => Ok((true, Some(new_handle.raw()))),
                UpdateOutcome::Deferred => Ok((true, None)),
            }
        })
    }

    /// Current handle for a light that may have been replaced by a frame flush.
    pub fn resolve_handle(&self, handle: u64) -> Option<u64> {
        guarded("resolve_handle", None, || {
            Ok(self.manager.resolve_handle(parse_handle(handle)?).map(LightHandle::raw))
        })
    }

    pub fn destroy_light(&self, handle: u64) -> bool {
        guarded("destroy_light", false, || {
            Ok(self.manager.destroy_light(parse_handle(handle)?))
        })
    }

    pub fn draw_lights(&self) -> bool {
        guarded("draw_lights", false, || self.manager.draw_lights().map(|_| true))
    }

    pub fn register_entity_validator<F>(&self, validator: F)
    where
        F: Fn(u64) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.manager
            .register_entity_validator(ScriptValidator(validator));
    }

    pub fn begin_frame(&self) -> bool {
        guarded("begin_frame", false, || self.manager.begin_frame().map(|_| true))
    }

    pub fn end_frame(&self) -> bool {
        guarded("end_frame", false, || self.manager.end_frame().map(|_| true))
    }

    pub fn status(&self) -> Value {
        guarded("status", Value::Null, || {
            let stats = self.manager.stats();
            Ok(json!({
                "initialized": !self.manager.is_shut_down(),
                "light_count": stats.live_lights,
                "average_update_ms": stats.average_update_ms,
                "stats": serde_json::to_value(&stats).map_err(|e| Error::custom(e.to_string()))?,
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, HeadlessBackend, LightBackend};
    use crate::config::LightManagerConfig;
    use crate::light::LightDescriptor;

    fn bridge() -> (Arc<HeadlessBackend>, ScriptBridge) {
        let backend = Arc::new(HeadlessBackend::new());
        let manager = Arc::new(LightManager::new(backend.clone(), LightManagerConfig::default()));
        (backend, ScriptBridge::new(manager))
    }

    #[test]
    fn script_colors_are_normalized() {
        let (backend, bridge) = bridge();
        let raw = bridge
            .create_light(0.0, 0.0, 0.0, 10.0, 2.0, 255.0, 0.0, 127.5, Some(1))
            .unwrap();
        let desc = backend.descriptor(LightHandle::from_raw(raw).unwrap()).unwrap();
        assert_eq!(desc.radius, 10.0);
        assert!((desc.radiance[0] - 2.0).abs() < 1e-5);
        assert_eq!(desc.radiance[1], 0.0);
        assert!((desc.radiance[2] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn invalid_input_flattens_to_none() {
        let (backend, bridge) = bridge();
        assert!(bridge
            .create_light(f64::NAN, 0.0, 0.0, 10.0, 1.0, 255.0, 255.0, 255.0, None)
            .is_none());
        assert_eq!(bridge.update_light(0, 0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0), (false, None));
        assert!(!bridge.destroy_light(0));
        assert!(!bridge.end_frame());
        assert_eq!(backend.created_count(), 0);
    }

    #[test]
    fn update_reports_new_handle_or_deferral() {
        let (_backend, bridge) = bridge();
        let first = bridge
            .create_light(0.0, 0.0, 0.0, 10.0, 1.0, 255.0, 255.0, 255.0, Some(5))
            .unwrap();

        let (ok, second) = bridge.update_light(first, 1.0, 0.0, 0.0, 10.0, 1.0, 255.0, 255.0, 255.0);
        assert!(ok);
        let second = second.unwrap();
        assert_ne!(first, second);

        assert!(bridge.begin_frame());
        assert_eq!(
            bridge.update_light(second, 2.0, 0.0, 0.0, 10.0, 1.0, 255.0, 255.0, 255.0),
            (true, None)
        );
        assert!(bridge.end_frame());
        let third = bridge.resolve_handle(second).unwrap();
        assert_ne!(third, second);
        assert!(bridge.destroy_light(third));
        assert!(!bridge.destroy_light(third));
    }

    #[test]
    fn script_validator_errors_keep_lights() {
        let (_backend, bridge) = bridge();
        bridge.create_light(0.0, 0.0, 0.0, 10.0, 1.0, 255.0, 255.0, 255.0, Some(1));
        bridge.create_light(0.0, 0.0, 0.0, 10.0, 1.0, 255.0, 255.0, 255.0, Some(2));
        bridge.register_entity_validator(|id| {
            if id == 2 {
                anyhow::bail!("attempt to index a nil value");
            }
            Ok(true)
        });

        let report = bridge.manager().collect_garbage().unwrap();
        assert_eq!(report.unknown, 1);
        assert_eq!(bridge.manager().light_count(), 2);
    }

    #[test]
    fn status_reports_counts() {
        let (_backend, bridge) = bridge();
        bridge.create_light(0.0, 0.0, 0.0, 10.0, 1.0, 255.0, 255.0, 255.0, Some(1));
        assert!(bridge.draw_lights());

        let status = bridge.status();
        assert_eq!(status["initialized"], json!(true));
        assert_eq!(status["light_count"], json!(1));
        assert_eq!(status["stats"]["draw_calls"], json!(1));

        bridge.manager().shutdown();
        assert_eq!(bridge.status()["initialized"], json!(false));
    }

    struct PanickyBackend(HeadlessBackend);

    impl LightBackend for PanickyBackend {
        fn create_light(&self, desc: &LightDescriptor) -> std::result::Result<LightHandle, BackendError> {
            self.0.create_light(desc)
        }

        fn destroy_light(&self, handle: LightHandle) {
            self.0.destroy_light(handle)
        }

        fn draw_light_instance(&self, _handle: LightHandle) -> std::result::Result<(), BackendError> {
            panic!("driver fault");
        }
    }

    #[test]
    fn panics_do_not_cross_the_boundary() {
        let backend = Arc::new(PanickyBackend(HeadlessBackend::new()));
        let manager = Arc::new(LightManager::new(backend, LightManagerConfig::default()));
        let bridge = ScriptBridge::new(manager);
        bridge.create_light(0.0, 0.0, 0.0, 10.0, 1.0, 255.0, 255.0, 255.0, Some(1));

        assert!(!bridge.draw_lights());
        // Flags and locks were released by the unwind.
        assert!(!bridge.draw_lights());
        assert!(bridge
            .create_light(0.0, 0.0, 0.0, 10.0, 1.0, 255.0, 255.0, 255.0, Some(2))
            .is_some());
    }
}

// src/main.rs
//! Headless demo: a small scene of entities carrying lights, driven through the
//! script bridge for a few hundred frames. Some entities vanish without cleaning up
//! and the GC pass reclaims their lights.
//!
//! Usage: `managed_lights_demo [config.json]`

use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::panic;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{error, info, LevelFilter};
use parking_lot::{Mutex, RwLock};

use managed_lights::{HeadlessBackend, LightManager, LightManagerConfig, ScriptBridge};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const ENTITIES: u64 = 16;
const TICKS: u32 = 240;
const DESPAWN_AT: u32 = 60;
const TICK: Duration = Duration::from_millis(4);
const CRASH_LOG: &str = "managed_lights_crash.log";

fn main() {
    setup_diagnostics();

    info!("Starting managed light demo (headless)...");

    match panic::catch_unwind(run) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Demo failed: {:#}", e);
            std::process::exit(1);
        }
        Err(payload) => {
            error!("Demo terminated abruptly: {}", panic_message(payload.as_ref()));
            write_crash_report(payload.as_ref());
            std::process::exit(1);
        }
    }
}

fn load_config() -> anyhow::Result<LightManagerConfig> {
    match std::env::args().nth(1) {
        Some(path) => LightManagerConfig::load(&path)
            .with_context(|| format!("loading light manager config from {}", path)),
        // Compressed timings so the GC has something to do within a short run.
        None => Ok(LightManagerConfig {
            gc_frame_interval: 30,
            gc_min_interval_ms: 50,
            gc_grace_window_ms: 100,
            ..Default::default()
        }),
    }
}

fn run() -> anyhow::Result<()> {
    let cfg = load_config()?;
    info!("config: {}", serde_json::to_string(&cfg)?);

    let backend = Arc::new(HeadlessBackend::new());
    let manager = Arc::new(LightManager::new(backend.clone(), cfg));
    let bridge = ScriptBridge::new(manager.clone());

    let alive: Arc<RwLock<HashSet<u64>>> = Arc::new(RwLock::new((0..ENTITIES).collect()));
    let world = alive.clone();
    bridge.register_entity_validator(move |entity| Ok(world.read().contains(&entity)));

    let mut lights: HashMap<u64, u64> = HashMap::new();
    for entity in 0..ENTITIES {
        let hue = entity as f64 / ENTITIES as f64;
        let handle = bridge
            .create_light(
                entity as f64 * 50.0,
                0.0,
                100.0,
                20.0,
                1.0 + hue,
                255.0 * hue,
                128.0,
                255.0 * (1.0 - hue),
                Some(entity),
            )
            .with_context(|| format!("creating light for entity {}", entity))?;
        lights.insert(entity, handle);
    }
    info!("spawned {} lit entities", lights.len());

    for tick in 0..TICKS {
        if tick == DESPAWN_AT {
            // Every fourth entity disappears without destroying its light.
            let mut world = alive.write();
            world.retain(|entity| entity % 4 != 0);
            lights.retain(|entity, _| world.contains(entity));
            info!("despawned entities, {} remain alive", world.len());
        }

        if !bridge.begin_frame() {
            anyhow::bail!("begin_frame rejected at tick {}", tick);
        }
        let phase = tick as f64 * 0.05;
        for (&entity, &handle) in &lights {
            let angle = phase + entity as f64;
            let (accepted, _) = bridge.update_light(
                handle,
                entity as f64 * 50.0 + angle.cos() * 25.0,
                angle.sin() * 25.0,
                100.0,
                20.0,
                1.0,
                255.0,
                200.0,
                160.0,
            );
            if !accepted {
                log::warn!("update for entity {} rejected", entity);
            }
        }
        bridge.draw_lights();
        if !bridge.end_frame() {
            anyhow::bail!("end_frame rejected at tick {}", tick);
        }

        // Frame flushes replaced the handles; follow them.
        for handle in lights.values_mut() {
            if let Some(current) = bridge.resolve_handle(*handle) {
                *handle = current;
            }
        }

        std::thread::sleep(TICK);
    }

    println!("{}", serde_json::to_string_pretty(&bridge.status())?);

    let released = manager.shutdown();
    info!(
        "demo finished: released {} lights, backend live {}, unknown destroys {}",
        released,
        backend.live_count(),
        backend.unknown_destroys()
    );
    Ok(())
}

/// Logger plus a panic recorder. Panics the script bridge or the validator isolate are
/// recoverable, so the hook only records and warns; the crash report is written by
/// `main` once a panic actually ends the run.
fn setup_diagnostics() {
    env_logger::Builder::new()
        .filter_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .init();

    panic::set_hook(Box::new(|panic_info| {
        let location = panic_info.location().map_or("unknown location".to_string(), |loc| {
            format!("{}:{}", loc.file(), loc.line())
        });
        let reason = panic_message(panic_info.payload());
        log::warn!("panic at {}: {}", location, reason);

        *LAST_PANIC.lock() = Some(PanicRecord {
            reason: reason.to_string(),
            location,
            backtrace: Backtrace::force_capture().to_string(),
        });
    }));
}

/// Most recent panic seen by the hook, caught or not.
static LAST_PANIC: Mutex<Option<PanicRecord>> = parking_lot::const_mutex(None);

struct PanicRecord {
    reason: String,
    location: String,
    backtrace: String,
}

impl PanicRecord {
    fn report(&self) -> String {
        format!(
            "=== LIGHT DEMO CRASH ===\nReason: {}\nLocation: {}\n\nStack Trace:\n{}",
            self.reason, self.location, self.backtrace
        )
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    match payload.downcast_ref::<&'static str>() {
        Some(s) => *s,
        None => match payload.downcast_ref::<String>() {
            Some(s) => s.as_str(),
            None => "Box<dyn Any>",
        },
    }
}

/// Print and persist the report for the panic that ended the run.
fn write_crash_report(payload: &(dyn Any + Send)) {
    let report = match LAST_PANIC.lock().take() {
        Some(record) => record.report(),
        None => format!("=== LIGHT DEMO CRASH ===\nReason: {}", panic_message(payload)),
    };
    eprintln!("\x1b[31;1m{}\x1b[0m", report);

    if let Ok(mut file) = File::create(CRASH_LOG) {
        let _ = file.write_all(report.as_bytes());
        eprintln!("Crash report saved to {}", CRASH_LOG);
    }
}

// src/lib.rs
//! Managed light service.
//!
//! Sits between script code and a native light API that only knows
//! create / destroy / draw. Tracks every light it created, deduplicates per entity,
//! turns updates into recreate-and-swap, batches updates inside a frame bracket and
//! reclaims lights whose owning entity disappeared.

// Submodules
pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod host;
pub mod light;
pub mod manager;
pub mod resource_table;
pub mod stats;
pub mod validator;

// Re-exports
pub use backend::{BackendError, HeadlessBackend, LightBackend, LightHandle};
pub use config::LightManagerConfig;
pub use error::{Error, Result};
pub use frame::{FlushReport, FramePhase};
pub use host::ScriptBridge;
pub use light::{EntityId, LightDescriptor, LightProperties};
pub use manager::{DrawReport, FrameScope, LightManager, UpdateOutcome};
pub use resource_table::ManagedLight;
pub use stats::LightStats;
pub use validator::{EntityValidator, GcReport, Verdict};

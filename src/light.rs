// src/light.rs
//! Light identity and properties.
//!
//! `LightProperties` is the caller-facing value (captured once, replaced wholesale on
//! update). `LightDescriptor` is what actually goes to the backend: a sphere light with
//! premultiplied radiance and a fresh identity hash per create.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Sizes at or below zero (or NaN) are raised to this.
pub const MIN_LIGHT_SIZE: f32 = 1.0;
/// Brightness floor.
pub const MIN_BRIGHTNESS: f32 = 0.01;
/// Script colors arrive as 0..=255 channels.
pub const SCRIPT_COLOR_SCALE: f64 = 255.0;

/// Caller-supplied identity of the game object owning a light.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable light value. Construct through `new`/`from_script` so every instance is clamped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LightProperties {
    position: Vec3,
    size: f32,
    brightness: f32,
    color: Vec3,
}

impl LightProperties {
    /// Clamp size/brightness to their floors and color into [0,1].
    /// A non-finite position cannot be repaired and is rejected.
    pub fn new(position: Vec3, size: f32, brightness: f32, color: Vec3) -> Result<Self> {
        if !position.is_finite() {
            return Err(Error::InvalidProperties("position must be finite"));
        }
        Ok(Self {
            position,
            size: floor_clamp(size, MIN_LIGHT_SIZE),
            brightness: floor_clamp(brightness, MIN_BRIGHTNESS),
            color: Vec3::new(
                unit_clamp(color.x),
                unit_clamp(color.y),
                unit_clamp(color.z),
            ),
        })
    }

    /// Script-facing constructor: plain numbers, color channels in 0..=255.
    #[allow(clippy::too_many_arguments)]
    pub fn from_script(
        x: f64,
        y: f64,
        z: f64,
        size: f64,
        brightness: f64,
        r: f64,
        g: f64,
        b: f64,
    ) -> Result<Self> {
        Self::new(
            Vec3::new(x as f32, y as f32, z as f32),
            size as f32,
            brightness as f32,
            Vec3::new(
                (r / SCRIPT_COLOR_SCALE) as f32,
                (g / SCRIPT_COLOR_SCALE) as f32,
                (b / SCRIPT_COLOR_SCALE) as f32,
            ),
        )
    }

    #[inline]
    pub fn position(&self) -> Vec3 {
        self.position
    }

    #[inline]
    pub fn size(&self) -> f32 {
        self.size
    }

    #[inline]
    pub fn brightness(&self) -> f32 {
        self.brightness
    }

    #[inline]
    pub fn color(&self) -> Vec3 {
        self.color
    }

    /// Color scaled by brightness, the value the backend consumes.
    #[inline]
    pub fn radiance(&self) -> Vec3 {
        self.color * self.brightness
    }
}

#[inline]
fn floor_clamp(value: f32, floor: f32) -> f32 {
    if value.is_nan() || value < floor {
        floor
    } else if value.is_infinite() {
        f32::MAX
    } else {
        value
    }
}

#[inline]
fn unit_clamp(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

// ---------- Backend descriptor ----------

static LIGHT_SERIAL: AtomicU32 = AtomicU32::new(0);

/// Process-unique identity for a backend light: `(pid << 32) | serial`.
fn next_light_hash() -> u64 {
    let serial = LIGHT_SERIAL.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    (u64::from(std::process::id()) << 32) | u64::from(serial)
}

/// Sphere light as submitted to the backend. No shaping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightDescriptor {
    pub hash: u64,
    pub position: [f32; 3],
    pub radius: f32,
    pub radiance: [f32; 3],
}

impl LightDescriptor {
    /// Build a descriptor with a fresh identity hash. Called once per backend create,
    /// including the create half of recreate-on-update.
    pub fn sphere(props: &LightProperties) -> Self {
        Self {
            hash: next_light_hash(),
            position: props.position().to_array(),
            radius: props.size(),
            radiance: props.radiance().to_array(),
        }
    }
}

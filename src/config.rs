// src/config.rs
//! Tunables for the light manager. Defaults follow the values the service has always
//! shipped with; every field can be overridden from JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightManagerConfig {
    /// Cap on live managed lights.
    pub max_lights: usize,
    /// A GC pass is attempted every N drawn frames.
    pub gc_frame_interval: u64,
    /// Minimum time between frame-triggered GC passes (ms).
    pub gc_min_interval_ms: u64,
    /// A light whose owner is reported gone is only reclaimed once it has gone
    /// this long without an update (ms).
    pub gc_grace_window_ms: u64,
    /// Rolling window for the average update time.
    pub timing_samples: usize,
}

impl Default for LightManagerConfig {
    fn default() -> Self {
        Self {
            max_lights: 1000,
            gc_frame_interval: 60,
            gc_min_interval_ms: 5_000,
            gc_grace_window_ms: 10_000,
            timing_samples: 100,
        }
    }
}

impl LightManagerConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::from(e).context(format!("reading {}", path.display())))?;
        Self::from_json(&text).map_err(|e| e.context(format!("parsing {}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        if self.gc_frame_interval == 0 {
            return Err(Error::Config("gc_frame_interval must be at least 1".into()));
        }
        if self.timing_samples == 0 {
            return Err(Error::Config("timing_samples must be at least 1".into()));
        }
        if self.max_lights == 0 {
            return Err(Error::Config("max_lights must be at least 1".into()));
        }
        Ok(())
    }

    #[inline]
    pub fn gc_min_interval(&self) -> Duration {
        Duration::from_millis(self.gc_min_interval_ms)
    }

    #[inline]
    pub fn gc_grace_window(&self) -> Duration {
        Duration::from_millis(self.gc_grace_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = LightManagerConfig::from_json(r#"{ "gc_grace_window_ms": 2500 }"#).unwrap();
        assert_eq!(cfg.gc_grace_window(), Duration::from_millis(2500));
        assert_eq!(cfg.max_lights, 1000);
        assert_eq!(cfg.gc_frame_interval, 60);
        assert_eq!(cfg.gc_min_interval(), Duration::from_secs(5));
    }

    #[test]
    fn zero_frame_interval_is_rejected() {
        let err = LightManagerConfig::from_json(r#"{ "gc_frame_interval": 0 }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = LightManagerConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.json"));
        assert!(matches!(err.root(), Error::Config(_)));
    }
}

// src/error.rs
//! Error handling for the light manager.
//!
//! - **Cheap**: enum discriminant, allocations only on error paths.
//! - **Chaining**: `context()` wraps any error with a message, `is_*` helpers for matching.
//! - **Boundary**: the script bridge flattens every variant into nil/false, nothing here
//!   is ever thrown across to the host.

use thiserror::Error;

use crate::backend::{BackendError, LightHandle};

/// Main error type. Send + Sync + 'static, cloneable so reports can be stored and replayed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The native backend refused a create (or was unavailable).
    #[error("backend failure: {0}")]
    Backend(#[from] BackendError),

    /// Handle is not (or no longer) present in the resource table.
    #[error("unknown light handle {0}")]
    InvalidHandle(LightHandle),

    /// Property values that cannot be clamped into something drawable.
    #[error("invalid light properties: {0}")]
    InvalidProperties(&'static str),

    /// Live light cap reached.
    #[error("light capacity exceeded (limit {limit})")]
    CapacityExceeded { limit: usize },

    /// A guarded operation was entered from inside itself, or is already running.
    #[error("re-entrant call to {0} rejected")]
    Reentrant(&'static str),

    /// BeginFrame/EndFrame called out of order.
    #[error("frame bracket misuse: {0}")]
    FrameBracket(&'static str),

    /// The service was shut down; no further mutation is accepted.
    #[error("light manager has been shut down")]
    ShutDown,

    /// Configuration could not be read, parsed, or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Simple custom message.
    #[error("{0}")]
    Custom(String),

    /// Context chaining.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a custom error message.
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    /// Add context to any error.
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip context layers and return the underlying error.
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Error::WithContext { source, .. } = current {
            current = source;
        }
        current
    }

    #[inline]
    pub fn is_backend(&self) -> bool {
        matches!(self.root(), Error::Backend(_))
    }

    #[inline]
    pub fn is_invalid_handle(&self) -> bool {
        matches!(self.root(), Error::InvalidHandle(_))
    }

    #[inline]
    pub fn is_reentrant(&self) -> bool {
        matches!(self.root(), Error::Reentrant(_))
    }

    #[inline]
    pub fn is_frame_bracket(&self) -> bool {
        matches!(self.root(), Error::FrameBracket(_))
    }

    #[inline]
    pub fn is_shut_down(&self) -> bool {
        matches!(self.root(), Error::ShutDown)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Convenient `Result` alias, use `crate::Result<T>` everywhere.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_root_kind() {
        let handle = LightHandle::from_raw(7).unwrap();
        let err = Error::InvalidHandle(handle).context("update_light");
        assert!(err.is_invalid_handle());
        assert!(!err.is_backend());
        assert_eq!(err.to_string(), "update_light: unknown light handle 0x7");
    }

    #[test]
    fn json_errors_become_config_errors() {
        let err: Error = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, Error::Config(_)));
    }
}

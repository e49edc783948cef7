// src/validator.rs
//! Entity liveness validation for the garbage-collection pass.
//!
//! The validator is foreign code (usually a script callback). It may be slow, may
//! fail, may panic; each call is isolated and any failure reads as `Unknown`, which
//! never leads to a light being destroyed.

use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;

use crate::light::EntityId;

/// Answers "does this entity still exist?".
///
/// Closures `Fn(EntityId) -> bool` implement this directly; implement it by hand when
/// the check itself can fail.
pub trait EntityValidator: Send + Sync {
    fn is_alive(&self, entity: EntityId) -> anyhow::Result<bool>;
}

impl<F> EntityValidator for F
where
    F: Fn(EntityId) -> bool + Send + Sync,
{
    fn is_alive(&self, entity: EntityId) -> anyhow::Result<bool> {
        Ok(self(entity))
    }
}

/// Outcome of validating one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Alive,
    Gone,
    /// Validator errored or panicked. Treated as "keep".
    Unknown,
}

/// Run the validator for one entity with error and panic isolation.
pub fn check_entity(validator: &dyn EntityValidator, entity: EntityId) -> Verdict {
    match panic::catch_unwind(AssertUnwindSafe(|| validator.is_alive(entity))) {
        Ok(Ok(true)) => Verdict::Alive,
        Ok(Ok(false)) => Verdict::Gone,
        Ok(Err(err)) => {
            log::warn!("validator failed for entity {}: {:#}", entity, err);
            Verdict::Unknown
        }
        Err(_) => {
            log::warn!("validator panicked for entity {}", entity);
            Verdict::Unknown
        }
    }
}

/// Summary of one GC pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// False when the pass was skipped (no validator registered).
    pub ran: bool,
    pub examined: usize,
    pub alive: usize,
    pub unknown: usize,
    /// Reported gone but updated within the grace window.
    pub spared: usize,
    pub candidates: usize,
    pub collected: usize,
    /// Candidates were found but no entity validated alive, so nothing was destroyed.
    pub withheld: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky;

    impl EntityValidator for Flaky {
        fn is_alive(&self, entity: EntityId) -> anyhow::Result<bool> {
            match entity.0 {
                0 => anyhow::bail!("lookup failed"),
                1 => panic!("validator blew up"),
                n => Ok(n % 2 == 0),
            }
        }
    }

    #[test]
    fn closures_are_validators() {
        let validator = |entity: EntityId| entity.0 != 5;
        assert_eq!(check_entity(&validator, EntityId(4)), Verdict::Alive);
        assert_eq!(check_entity(&validator, EntityId(5)), Verdict::Gone);
    }

    #[test]
    fn errors_and_panics_are_unknown() {
        assert_eq!(check_entity(&Flaky, EntityId(0)), Verdict::Unknown);
        assert_eq!(check_entity(&Flaky, EntityId(1)), Verdict::Unknown);
        assert_eq!(check_entity(&Flaky, EntityId(2)), Verdict::Alive);
        assert_eq!(check_entity(&Flaky, EntityId(3)), Verdict::Gone);
    }
}

//! `cryomove-types` – shared vocabulary of the cryomove workspace.
//!
//! Every other crate speaks in terms of these types: axis descriptors,
//! positions, per-actuator [`Metadata`], the [`Tolerances`] used by safety
//! checks, and the single [`MoveError`] enum that every operation reports.

pub mod axis;
pub mod metadata;
pub mod tolerance;
pub mod util;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use axis::{AxisDescriptor, AxisKind, Choice};
pub use metadata::Metadata;
pub use tolerance::Tolerances;

/// Axis name → value. Keys are always a subset of the owning actuator's axes.
///
/// A `BTreeMap` keeps iteration (and therefore dispatch and logging) order
/// deterministic.
pub type Position = BTreeMap<String, f64>;

/// Axis name → "has completed homing".
pub type Referenced = BTreeMap<String, bool>;

/// Axis name → speed (unit per second).
pub type Speed = BTreeMap<String, f64>;

/// Build a [`Position`] from `(axis, value)` pairs.
///
/// ```
/// let p = cryomove_types::position([("x", 1.0), ("y", -2.0)]);
/// assert_eq!(p["y"], -2.0);
/// ```
pub fn position<'a>(pairs: impl IntoIterator<Item = (&'a str, f64)>) -> Position {
    pairs
        .into_iter()
        .map(|(axis, value)| (axis.to_string(), value))
        .collect()
}

/// Return the sub-position of `pos` restricted to `axes`. Axes absent from
/// `pos` are skipped.
pub fn filter_position(pos: &Position, axes: &[&str]) -> Position {
    axes.iter()
        .filter_map(|a| pos.get(*a).map(|v| (a.to_string(), *v)))
        .collect()
}

/// Error type shared by every actuator, composite and orchestrator operation.
///
/// `Clone` because a single task outcome may be observed by several waiters.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MoveError {
    /// Construction-time configuration problem; the component is not created.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unknown axis '{axis}' on {actuator}")]
    InvalidAxis { actuator: String, axis: String },

    #[error("Value {value} for axis '{axis}' of {actuator} is out of range")]
    OutOfRange {
        actuator: String,
        axis: String,
        value: f64,
    },

    #[error("Unsupported operation on {actuator}: {details}")]
    UnsupportedOperation { actuator: String, details: String },

    #[error("Timed out after {seconds:.1}s while {operation}")]
    Timeout { operation: String, seconds: f64 },

    /// The task was cancelled. Reported through the same channel as failures
    /// but callers should treat it as a distinct outcome.
    #[error("Cancelled")]
    Cancelled,

    /// A geometric precondition was violated; no motion was issued for the
    /// leg that detected it.
    #[error("Safety check failed: {0}")]
    SafetyCheckFailed(String),

    /// Failure reported by a leaf driver.
    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },
}

impl MoveError {
    /// `true` for [`MoveError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MoveError::Cancelled)
    }

    /// Shorthand for [`MoveError::InvalidAxis`].
    pub fn invalid_axis(actuator: &str, axis: &str) -> Self {
        MoveError::InvalidAxis {
            actuator: actuator.to_string(),
            axis: axis.to_string(),
        }
    }
}

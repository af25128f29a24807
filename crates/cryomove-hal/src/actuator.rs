//! Generic `Actuator` trait for stages, focus drives, filter wheels and any
//! other multi-axis, position-controlled hardware.
//!
//! Leaf drivers and composite actuators implement the same trait, so
//! composites can be stacked (a multiplexer over an anti-backlash wrapper over
//! a leaf, …) and the orchestrator never needs to know which kind it drives.
//!
//! Moves never block: they validate their arguments, queue the work and return
//! a [`MoveTask`].  Validation errors are reported through an already-failed
//! task so callers handle every failure in one place.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use cryomove_types::{AxisDescriptor, Metadata, MoveError, Position, Referenced, Speed};
use tracing::warn;

use crate::observable::ObservableView;
use crate::task::MoveTask;

/// Operational state of a composite that may fail outside of any caller's
/// request (e.g. while referencing at construction).
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentState {
    Running,
    Error(MoveError),
}

/// A multi-axis actuator.
///
/// Every actuator has a stable name used in logs and errors, a fixed set of
/// axes, and an observable position whose keys are a subset of those axes.
#[async_trait]
pub trait Actuator: Send + Sync {
    fn name(&self) -> &str;

    /// Axis descriptors, fixed at construction.
    fn axes(&self) -> &BTreeMap<String, AxisDescriptor>;

    fn has_axis(&self, axis: &str) -> bool {
        self.axes().contains_key(axis)
    }

    /// Current position, in this actuator's own coordinate frame.
    fn position(&self) -> ObservableView<Position>;

    /// Per-axis homing state, `None` if the actuator cannot reference.
    fn referenced(&self) -> Option<ObservableView<Referenced>> {
        None
    }

    fn has_referenced(&self) -> bool {
        self.referenced().is_some()
    }

    /// Per-axis speed, `None` if the actuator does not expose it.
    fn speed(&self) -> Option<ObservableView<Speed>> {
        None
    }

    fn has_speed(&self) -> bool {
        self.speed().is_some()
    }

    /// Change the speed of some axes.
    ///
    /// # Errors
    ///
    /// [`MoveError::UnsupportedOperation`] unless overridden.
    fn set_speed(&self, _speed: &Speed) -> Result<(), MoveError> {
        Err(MoveError::UnsupportedOperation {
            actuator: self.name().to_string(),
            details: "speed cannot be changed".to_string(),
        })
    }

    /// Snapshot of the attached metadata.
    fn metadata(&self) -> Metadata;

    /// Overlay `md` onto the attached metadata.
    fn update_metadata(&self, md: Metadata) -> Result<(), MoveError>;

    /// Move the given axes to absolute values. Axes not present stay put.
    fn move_abs(&self, pos: Position) -> MoveTask;

    /// Move the given axes by relative amounts.
    fn move_rel(&self, shift: Position) -> MoveTask;

    /// Drive `axes` to their reference (homing) switch.
    fn reference(&self, axes: BTreeSet<String>) -> MoveTask {
        let _ = axes;
        MoveTask::failed(
            format!("{}.reference", self.name()),
            MoveError::UnsupportedOperation {
                actuator: self.name().to_string(),
                details: "referencing is not supported".to_string(),
            },
        )
    }

    /// Best-effort immediate halt of `axes` (all axes if `None`).
    ///
    /// Never fails; a child that does not acknowledge in time is logged.
    async fn stop(&self, axes: Option<BTreeSet<String>>);
}

// ────────────────────────────────────────────────────────────────────────────
// Argument validation shared by every implementation
// ────────────────────────────────────────────────────────────────────────────

/// Check an absolute target: every key must be an axis and every value must be
/// inside the axis range or choice set.
///
/// # Errors
///
/// [`MoveError::InvalidAxis`] or [`MoveError::OutOfRange`].
pub fn check_move_abs(
    actuator: &str,
    axes: &BTreeMap<String, AxisDescriptor>,
    pos: &Position,
) -> Result<(), MoveError> {
    for (axis, value) in pos {
        let desc = axes
            .get(axis)
            .ok_or_else(|| MoveError::invalid_axis(actuator, axis))?;
        desc.check_value(actuator, axis, *value)?;
    }
    Ok(())
}

/// Check a relative shift: every key must be an axis, and a shift on a
/// continuous axis cannot exceed the width of its range.
///
/// # Errors
///
/// [`MoveError::InvalidAxis`] or [`MoveError::OutOfRange`].
pub fn check_move_rel(
    actuator: &str,
    axes: &BTreeMap<String, AxisDescriptor>,
    shift: &Position,
) -> Result<(), MoveError> {
    for (axis, value) in shift {
        let desc = axes
            .get(axis)
            .ok_or_else(|| MoveError::invalid_axis(actuator, axis))?;
        let too_far = match desc.bounds() {
            Some((min, max)) => !value.is_finite() || value.abs() > max - min,
            None => !value.is_finite(),
        };
        if too_far {
            return Err(MoveError::OutOfRange {
                actuator: actuator.to_string(),
                axis: axis.clone(),
                value: *value,
            });
        }
    }
    Ok(())
}

/// # Errors
///
/// [`MoveError::InvalidAxis`] for the first name that is not an axis.
pub fn check_axes<'a>(
    actuator: &str,
    axes: &BTreeMap<String, AxisDescriptor>,
    names: impl IntoIterator<Item = &'a String>,
) -> Result<(), MoveError> {
    for name in names {
        if !axes.contains_key(name) {
            return Err(MoveError::invalid_axis(actuator, name));
        }
    }
    Ok(())
}

/// Stop `actuator`, giving up after `limit`.
pub async fn stop_with_timeout(
    actuator: &dyn Actuator,
    axes: Option<BTreeSet<String>>,
    limit: Duration,
) {
    if tokio::time::timeout(limit, actuator.stop(axes)).await.is_err() {
        warn!(
            actuator = %actuator.name(),
            timeout_s = limit.as_secs_f64(),
            "actuator did not stop in time"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryomove_types::{Choice, position};

    fn axes() -> BTreeMap<String, AxisDescriptor> {
        BTreeMap::from([
            ("x".to_string(), AxisDescriptor::range(-1e-3, 1e-3)),
            (
                "band".to_string(),
                AxisDescriptor::choices([Choice::new(0.0), Choice::new(0.5)]),
            ),
        ])
    }

    #[test]
    fn abs_check_rejects_unknown_axis_and_out_of_range() {
        let axes = axes();
        assert!(check_move_abs("stage", &axes, &position([("x", 5e-4)])).is_ok());
        assert!(matches!(
            check_move_abs("stage", &axes, &position([("q", 0.0)])),
            Err(MoveError::InvalidAxis { .. })
        ));
        assert!(matches!(
            check_move_abs("stage", &axes, &position([("x", 2e-3)])),
            Err(MoveError::OutOfRange { .. })
        ));
        assert!(check_move_abs("stage", &axes, &position([("band", 0.25)])).is_err());
    }

    #[test]
    fn rel_check_bounds_shift_by_range_width() {
        let axes = axes();
        assert!(check_move_rel("stage", &axes, &position([("x", 2e-3)])).is_ok());
        assert!(check_move_rel("stage", &axes, &position([("x", 3e-3)])).is_err());
        assert!(check_move_rel("stage", &axes, &position([("x", f64::NAN)])).is_err());
    }

    #[test]
    fn axes_check() {
        let axes = axes();
        let names = ["x".to_string(), "y".to_string()];
        assert!(matches!(
            check_axes("stage", &axes, &names),
            Err(MoveError::InvalidAxis { axis, .. }) if axis == "y"
        ));
    }
}

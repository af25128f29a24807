//! Geometric checks on stage positions: active-range membership, proximity
//! to a reference position, and progress along the loading path.

use std::collections::BTreeMap;

use cryomove_types::util::{almost_equal, rot_almost_equal};
use cryomove_types::{MoveError, Position, Tolerances};

/// Axes used for distance measurements along the loading path.
pub const LINEAR_AXES: [&str; 3] = ["x", "y", "z"];

/// Axes holding a rotation, compared modulo a full turn.
pub const ROTATION_AXES: [&str; 2] = ["rx", "rz"];

fn require(pos: &Position, axis: &str, what: &str) -> Result<f64, MoveError> {
    pos.get(axis)
        .copied()
        .ok_or_else(|| MoveError::invalid_axis(what, axis))
}

fn distance(a: &Position, b: &Position) -> Result<f64, MoveError> {
    let mut sum = 0.0;
    for axis in LINEAR_AXES {
        let d = require(a, axis, "position")? - require(b, axis, "position")?;
        sum += d * d;
    }
    Ok(sum.sqrt())
}

/// Ratio of the path `start → end` already travelled by `current`.
///
/// Returns `Ok(None)` when `current` is not on the segment, i.e. when the
/// detour through it is longer than the direct path by more than `rtol`.
/// A degenerate path (`start == end`) reports `1.0` if `current` sits on it.
///
/// # Errors
///
/// [`MoveError::InvalidAxis`] if any of the positions lacks `x`, `y` or `z`.
pub fn loading_progress(
    current: &Position,
    start: &Position,
    end: &Position,
    rtol: f64,
) -> Result<Option<f64>, MoveError> {
    let from_start = distance(start, current)?;
    let to_end = distance(current, end)?;
    let total = distance(start, end)?;

    if total == 0.0 {
        return Ok((from_start == 0.0).then_some(1.0));
    }
    if almost_equal(from_start + to_end, total, 0.0, rtol) {
        Ok(Some((from_start / total).min(1.0)))
    } else {
        Ok(None)
    }
}

/// `true` if every axis of `axes` in `pos` lies within its range, widened on
/// both sides by `margin` times the range width.
///
/// # Errors
///
/// [`MoveError::InvalidAxis`] if `pos` lacks one of `axes`,
/// [`MoveError::InvalidConfiguration`] if `ranges` has no entry for it.
pub fn is_in_range(
    pos: &Position,
    ranges: &BTreeMap<String, (f64, f64)>,
    axes: &[&str],
    margin: f64,
) -> Result<bool, MoveError> {
    for axis in axes {
        let value = require(pos, axis, "position")?;
        let (min, max) = ranges.get(*axis).copied().ok_or_else(|| {
            MoveError::InvalidConfiguration(format!("no active range for axis '{axis}'"))
        })?;
        let slack = (max - min) * margin;
        if value < min - slack || value > max + slack {
            return Ok(false);
        }
    }
    Ok(true)
}

/// `true` if `current` is close to `target` on every axis of `target`:
/// within `linear_atol` for `x`/`y`/`z`, within `rotation_atol` (modulo a
/// turn) for `rx`/`rz`.  Axes of `current` that `target` does not name are
/// ignored.
///
/// # Errors
///
/// [`MoveError::InvalidAxis`] for an axis of `target` that is neither linear
/// nor rotational, or that is missing from `current`.
pub fn is_near_position(
    current: &Position,
    target: &Position,
    tolerances: &Tolerances,
) -> Result<bool, MoveError> {
    for (axis, reference) in target {
        let value = require(current, axis, "position")?;
        let near = if LINEAR_AXES.contains(&axis.as_str()) {
            (reference - value).abs() < tolerances.linear_atol
        } else if ROTATION_AXES.contains(&axis.as_str()) {
            rot_almost_equal(value, *reference, tolerances.rotation_atol)
        } else {
            return Err(MoveError::invalid_axis("reference position", axis));
        };
        if !near {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryomove_types::position;

    fn xyz(x: f64, y: f64, z: f64) -> Position {
        position([("x", x), ("y", y), ("z", z)])
    }

    // ------------------------------------------------------------------ loading_progress

    #[test]
    fn progress_on_the_line_is_a_ratio() {
        let start = xyz(0.0, 0.0, 0.0);
        let end = xyz(10e-3, 0.0, 0.0);

        let p = loading_progress(&xyz(2.5e-3, 0.0, 0.0), &start, &end, 0.1).unwrap();
        assert!((p.unwrap() - 0.25).abs() < 1e-9);

        assert_eq!(loading_progress(&start, &start, &end, 0.1).unwrap(), Some(0.0));
        assert_eq!(loading_progress(&end, &start, &end, 0.1).unwrap(), Some(1.0));
    }

    #[test]
    fn progress_off_the_line_is_indeterminate() {
        let start = xyz(0.0, 0.0, 0.0);
        let end = xyz(10e-3, 0.0, 0.0);
        let off = xyz(5e-3, 5e-3, 0.0);
        assert_eq!(loading_progress(&off, &start, &end, 0.1).unwrap(), None);
    }

    #[test]
    fn progress_tolerates_small_detours() {
        let start = xyz(0.0, 0.0, 0.0);
        let end = xyz(10e-3, 0.0, 0.0);
        let near = xyz(5e-3, 1e-4, 0.0);
        let p = loading_progress(&near, &start, &end, 0.1).unwrap().unwrap();
        assert!((p - 0.5).abs() < 1e-3);
    }

    #[test]
    fn progress_on_degenerate_path() {
        let p = xyz(1e-3, 1e-3, 1e-3);
        assert_eq!(loading_progress(&p, &p, &p, 0.1).unwrap(), Some(1.0));
        assert_eq!(
            loading_progress(&xyz(0.0, 0.0, 0.0), &p, &p, 0.1).unwrap(),
            None
        );
    }

    #[test]
    fn progress_requires_xyz() {
        let start = xyz(0.0, 0.0, 0.0);
        let partial = position([("x", 0.0), ("y", 0.0)]);
        assert!(matches!(
            loading_progress(&partial, &start, &start, 0.1),
            Err(MoveError::InvalidAxis { .. })
        ));
    }

    // ------------------------------------------------------------------ is_in_range

    #[test]
    fn range_check_applies_margin() {
        let ranges = BTreeMap::from([("x".to_string(), (0.0, 1.0))]);
        assert!(is_in_range(&position([("x", 0.5)]), &ranges, &["x"], 0.01).unwrap());
        assert!(is_in_range(&position([("x", 1.005)]), &ranges, &["x"], 0.01).unwrap());
        assert!(!is_in_range(&position([("x", 1.02)]), &ranges, &["x"], 0.01).unwrap());
        assert!(!is_in_range(&position([("x", -0.02)]), &ranges, &["x"], 0.01).unwrap());
    }

    #[test]
    fn range_check_without_range_is_configuration_error() {
        let ranges = BTreeMap::new();
        assert!(matches!(
            is_in_range(&position([("x", 0.5)]), &ranges, &["x"], 0.01),
            Err(MoveError::InvalidConfiguration(_))
        ));
    }

    // ------------------------------------------------------------------ is_near_position

    #[test]
    fn near_position_uses_per_kind_tolerance() {
        let tol = Tolerances::default();
        let target = position([("x", 0.0), ("rx", 0.0)]);
        assert!(is_near_position(&position([("x", 50e-6), ("rx", 5e-4)]), &target, &tol).unwrap());
        assert!(!is_near_position(&position([("x", 200e-6), ("rx", 0.0)]), &target, &tol).unwrap());
        assert!(!is_near_position(&position([("x", 0.0), ("rx", 0.1)]), &target, &tol).unwrap());
    }

    #[test]
    fn near_position_rejects_unknown_axis() {
        let tol = Tolerances::default();
        let target = position([("q", 0.0)]);
        assert!(matches!(
            is_near_position(&position([("q", 0.0)]), &target, &tol),
            Err(MoveError::InvalidAxis { .. })
        ));
    }

    #[test]
    fn near_position_requires_every_reference_axis() {
        let tol = Tolerances::default();
        let target = position([("x", 0.0), ("y", 0.0), ("rx", 0.0)]);
        assert!(matches!(
            is_near_position(&Position::new(), &target, &tol),
            Err(MoveError::InvalidAxis { .. })
        ));
        assert!(matches!(
            is_near_position(&position([("x", 0.0), ("y", 0.0)]), &target, &tol),
            Err(MoveError::InvalidAxis { .. })
        ));
        let extra = position([("x", 0.0), ("y", 0.0), ("z", 3.0), ("rx", 0.0)]);
        assert!(is_near_position(&extra, &target, &tol).unwrap());
    }
}

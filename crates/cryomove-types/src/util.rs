//! Small numeric helpers: tolerant comparison and nearest-value search.

use std::f64::consts::TAU;

/// Compare two floats within `max(atol, max(|a|, |b|) * rtol)`.
pub fn almost_equal(a: f64, b: f64, atol: f64, rtol: f64) -> bool {
    if a == b {
        return true;
    }
    let tol = atol.max(a.abs().max(b.abs()) * rtol);
    (a - b).abs() <= tol
}

/// Compare two angles (rad) modulo a full turn.
pub fn rot_almost_equal(a: f64, b: f64, atol: f64) -> bool {
    let d = (a - b).rem_euclid(TAU);
    d.min(TAU - d) <= atol
}

/// Return the element of `values` closest to `value`, `None` if empty.
///
/// With `cycle` set, distances are measured around a circle of that
/// circumference (see [`cyclic_distance`]).
pub fn find_closest(
    value: f64,
    values: impl IntoIterator<Item = f64>,
    cycle: Option<f64>,
) -> Option<f64> {
    let dist = |v: f64| match cycle {
        Some(c) => cyclic_distance(value, v, c),
        None => (value - v).abs(),
    };
    values.into_iter().min_by(|a, b| dist(*a).total_cmp(&dist(*b)))
}

/// Distance between `a` and `b` on a circle of circumference `cycle`.
pub fn cyclic_distance(a: f64, b: f64, cycle: f64) -> f64 {
    let d = (a - b).rem_euclid(cycle);
    d.min(cycle - d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn almost_equal_uses_largest_tolerance() {
        assert!(almost_equal(1.0, 1.0 + 1e-9, 0.0, 1e-7));
        assert!(!almost_equal(1.0, 1.1, 0.0, 1e-7));
        assert!(almost_equal(0.0, 50e-6, 100e-6, 0.0));
    }

    #[test]
    fn rotation_wraps_around() {
        assert!(rot_almost_equal(0.0, TAU - 1e-4, 1e-3));
        assert!(rot_almost_equal(-1e-4, 1e-4, 1e-3));
        assert!(!rot_almost_equal(0.0, 0.1, 1e-3));
    }

    #[test]
    fn closest_value() {
        assert_eq!(find_closest(0.26, [0.0, 0.25, 0.5], None), Some(0.25));
        assert_eq!(find_closest(0.9, [0.0, 0.5], None), Some(0.5));
        assert_eq!(find_closest(0.9, [0.0, 0.5], Some(1.0)), Some(0.0));
        assert_eq!(find_closest(1.0, std::iter::empty(), None), None);
    }

    #[test]
    fn cyclic_distance_takes_short_way() {
        assert!((cyclic_distance(0.95, 0.0, 1.0) - 0.05).abs() < 1e-12);
        assert!((cyclic_distance(0.25, 0.75, 1.0) - 0.5).abs() < 1e-12);
    }
}

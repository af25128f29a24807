//! Per-actuator metadata: favourite positions, active ranges and the
//! coordinate-correction parameters used by coupled stages.
//!
//! Metadata is supplied externally (configuration load or calibration) and is
//! only read while a move is in progress.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{MoveError, Position};

/// Key→value store attached to an actuator.
///
/// Each field corresponds to one well-known key; `None` means "not set".
/// [`Metadata::merge`] overlays the keys that are set in another instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Position in which the component is "in use" (e.g. imaging).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fav_pos_active: Option<Position>,

    /// Position in which the component is parked (e.g. loading).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fav_pos_deactive: Option<Position>,

    /// Per-axis `(min, max)` range considered safe while active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos_active_range: Option<BTreeMap<String, (f64, f64)>>,

    /// Scale correction `(sx, sy)` between two coupled stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_size_cor: Option<(f64, f64)>,

    /// Rotation correction (rad) between two coupled stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_cor: Option<f64>,

    /// Translation correction `(tx, ty)` between two coupled stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos_cor: Option<(f64, f64)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fav_pos_active(mut self, pos: Position) -> Self {
        self.fav_pos_active = Some(pos);
        self
    }

    pub fn with_fav_pos_deactive(mut self, pos: Position) -> Self {
        self.fav_pos_deactive = Some(pos);
        self
    }

    pub fn with_active_range(mut self, axis: &str, min: f64, max: f64) -> Self {
        self.pos_active_range
            .get_or_insert_with(BTreeMap::new)
            .insert(axis.to_string(), (min, max));
        self
    }

    pub fn with_correction(mut self, scale: (f64, f64), rotation: f64, translation: (f64, f64)) -> Self {
        self.pixel_size_cor = Some(scale);
        self.rotation_cor = Some(rotation);
        self.pos_cor = Some(translation);
        self
    }

    /// Overlay every key set in `other` onto `self`.
    pub fn merge(&mut self, other: Metadata) {
        if other.fav_pos_active.is_some() {
            self.fav_pos_active = other.fav_pos_active;
        }
        if other.fav_pos_deactive.is_some() {
            self.fav_pos_deactive = other.fav_pos_deactive;
        }
        if let Some(ranges) = other.pos_active_range {
            self.pos_active_range
                .get_or_insert_with(BTreeMap::new)
                .extend(ranges);
        }
        if other.pixel_size_cor.is_some() {
            self.pixel_size_cor = other.pixel_size_cor;
        }
        if other.rotation_cor.is_some() {
            self.rotation_cor = other.rotation_cor;
        }
        if other.pos_cor.is_some() {
            self.pos_cor = other.pos_cor;
        }
    }

    /// `true` if any coordinate-correction key is set.
    pub fn has_correction(&self) -> bool {
        self.pixel_size_cor.is_some() || self.rotation_cor.is_some() || self.pos_cor.is_some()
    }

    /// The favourite active position of `component`.
    ///
    /// # Errors
    ///
    /// [`MoveError::InvalidConfiguration`] when the key is missing.
    pub fn require_fav_pos_active(&self, component: &str) -> Result<&Position, MoveError> {
        self.fav_pos_active
            .as_ref()
            .ok_or_else(|| missing(component, "fav_pos_active"))
    }

    /// The favourite deactivated position of `component`.
    ///
    /// # Errors
    ///
    /// [`MoveError::InvalidConfiguration`] when the key is missing.
    pub fn require_fav_pos_deactive(&self, component: &str) -> Result<&Position, MoveError> {
        self.fav_pos_deactive
            .as_ref()
            .ok_or_else(|| missing(component, "fav_pos_deactive"))
    }

    /// The active range of one axis of `component`.
    ///
    /// # Errors
    ///
    /// [`MoveError::InvalidConfiguration`] when no range is recorded for `axis`.
    pub fn require_active_range(&self, component: &str, axis: &str) -> Result<(f64, f64), MoveError> {
        self.pos_active_range
            .as_ref()
            .and_then(|r| r.get(axis).copied())
            .ok_or_else(|| missing(component, &format!("pos_active_range[{axis}]")))
    }
}

fn missing(component: &str, key: &str) -> MoveError {
    MoveError::InvalidConfiguration(format!("{component} has no {key} metadata"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position;

    #[test]
    fn merge_overlays_only_set_keys() {
        let mut md = Metadata::new()
            .with_fav_pos_active(position([("x", 1.0)]))
            .with_active_range("x", -1.0, 1.0)
            .with_correction((1.0, 1.0), 0.0, (0.0, 0.0));

        md.merge(
            Metadata::new()
                .with_active_range("y", -2.0, 2.0)
                .with_correction((2.0, 2.0), 0.1, (1e-3, 0.0)),
        );

        assert_eq!(md.fav_pos_active, Some(position([("x", 1.0)])));
        assert_eq!(md.require_active_range("stage", "x").unwrap(), (-1.0, 1.0));
        assert_eq!(md.require_active_range("stage", "y").unwrap(), (-2.0, 2.0));
        assert_eq!(md.pixel_size_cor, Some((2.0, 2.0)));
        assert_eq!(md.rotation_cor, Some(0.1));
    }

    #[test]
    fn missing_keys_are_configuration_errors() {
        let md = Metadata::new();
        assert!(!md.has_correction());
        assert!(matches!(
            md.require_fav_pos_deactive("focus"),
            Err(MoveError::InvalidConfiguration(msg)) if msg.contains("focus")
        ));
        assert!(md.require_active_range("stage", "z").is_err());
    }
}

//! [`StateVerifier`] – geometric safety interlock for stage transitions.
//!
//! Before a transition sequence dispatches its first sub-move, the current
//! positions and metadata of the stage and focus are captured in a
//! [`MotionSnapshot`] and passed through [`StateVerifier::verify`].  Every
//! registered [`Rule`] is evaluated in order:
//!
//! - a [`Severity::Hard`] violation returns the error and nothing moves;
//! - a [`Severity::Soft`] violation is logged as a warning and evaluation
//!   continues.
//!
//! Configuration errors (missing metadata, missing axes) always propagate,
//! whatever the severity of the rule that hit them.
//!
//! Built-in rules:
//! - [`ActiveRangeRule`] – stage axes inside their active range (with margin).
//! - [`LoadingPathRule`] – stage on the line between active and deactivated.
//! - [`DeactiveTiltRule`] – the deactivated position has no `rx` tilt.
//! - [`NearDeactiveRule`] – a component sits at its deactivated position.
//! - [`TiltFocusRule`] – a tilted stage only moves with the focus parked.

use cryomove_types::util::almost_equal;
use cryomove_types::{Metadata, MoveError, Position, Tolerances};
use tracing::warn;

use crate::geometry::{is_in_range, is_near_position, loading_progress};

// ────────────────────────────────────────────────────────────────────────────
// Snapshot
// ────────────────────────────────────────────────────────────────────────────

/// Positions and metadata of the two components involved in a transition,
/// read once before the sequence starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MotionSnapshot {
    pub stage: Position,
    pub stage_md: Metadata,
    pub focus: Position,
    pub focus_md: Metadata,
}

/// The component a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Stage,
    Focus,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::Stage => "stage",
            Component::Focus => "focus",
        }
    }
}

/// `true` when both `rx` and `rz` of `stage` are within `atol` of 0.
///
/// Missing rotation axes count as 0.
pub fn is_untilted(stage: &Position, atol: f64) -> bool {
    ["rx", "rz"]
        .iter()
        .all(|a| almost_equal(stage.get(*a).copied().unwrap_or(0.0), 0.0, atol, 0.0))
}

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// How a violation is handled by [`StateVerifier::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Abort the transition.
    Hard,
    /// Log a warning and continue.
    Soft,
}

/// A single geometric invariant a transition must satisfy before it starts.
///
/// Implement this trait to create custom safety rules and add them to a
/// [`StateVerifier`] via [`StateVerifier::add_rule`].
pub trait Rule: Send + Sync {
    /// Human-readable name used in log records.
    fn name(&self) -> &str;

    fn severity(&self) -> Severity {
        Severity::Hard
    }

    /// Return `Ok(())` when the snapshot satisfies the invariant,
    /// [`MoveError::SafetyCheckFailed`] when it is violated, or any other
    /// error when the snapshot cannot be evaluated.
    fn check(&self, snapshot: &MotionSnapshot) -> Result<(), MoveError>;
}

// ────────────────────────────────────────────────────────────────────────────
// StateVerifier
// ────────────────────────────────────────────────────────────────────────────

/// Rule engine that validates a [`MotionSnapshot`] against all registered
/// [`Rule`]s.
///
/// # Example
///
/// ```
/// use cryomove_kernel::state_verifier::{DeactiveTiltRule, MotionSnapshot, StateVerifier};
/// use cryomove_types::{Metadata, position};
///
/// let mut verifier = StateVerifier::new();
/// verifier.add_rule(Box::new(DeactiveTiltRule { rotation_atol: 1e-3 }));
///
/// let mut snapshot = MotionSnapshot::default();
/// snapshot.stage_md = Metadata::new().with_fav_pos_deactive(position([("rx", 0.0)]));
/// assert!(verifier.verify(&snapshot).is_ok());
///
/// snapshot.stage_md = Metadata::new().with_fav_pos_deactive(position([("rx", 0.3)]));
/// assert!(verifier.verify(&snapshot).is_err());
/// ```
#[derive(Default)]
pub struct StateVerifier {
    rules: Vec<Box<dyn Rule>>,
}

impl StateVerifier {
    /// Create an empty verifier with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules checked before moving to the loading position.
    pub fn for_loading(tolerances: &Tolerances) -> Self {
        let mut v = Self::new();
        v.add_rule(Box::new(ActiveRangeRule::soft(tolerances.active_range_margin)));
        v.add_rule(Box::new(LoadingPathRule {
            progress_rtol: tolerances.progress_rtol,
        }));
        v.add_rule(Box::new(DeactiveTiltRule {
            rotation_atol: tolerances.rotation_atol,
        }));
        v
    }

    /// Rules checked before moving to the imaging position.
    pub fn for_imaging(tolerances: &Tolerances) -> Self {
        let mut v = Self::new();
        v.add_rule(Box::new(NearDeactiveRule {
            component: Component::Stage,
            tolerances: tolerances.clone(),
        }));
        v
    }

    /// Rules checked before tilting the stage.
    pub fn for_tilt(tolerances: &Tolerances) -> Self {
        let mut v = Self::new();
        v.add_rule(Box::new(ActiveRangeRule::hard(tolerances.active_range_margin)));
        v.add_rule(Box::new(TiltFocusRule {
            tolerances: tolerances.clone(),
        }));
        v
    }

    /// Register a new [`Rule`].  Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Validate `snapshot` against every registered rule.
    ///
    /// # Errors
    ///
    /// The first hard violation, or the first error that is not a safety
    /// violation (e.g. missing metadata) from any rule.
    pub fn verify(&self, snapshot: &MotionSnapshot) -> Result<(), MoveError> {
        for rule in &self.rules {
            match rule.check(snapshot) {
                Ok(()) => {}
                Err(MoveError::SafetyCheckFailed(reason)) if rule.severity() == Severity::Soft => {
                    warn!(rule = rule.name(), %reason, "soft safety check violated");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Stage `x`, `y`, `z` inside the metadata active range, widened by
/// `margin` times the range width.
pub struct ActiveRangeRule {
    pub margin: f64,
    pub severity: Severity,
}

impl ActiveRangeRule {
    pub fn hard(margin: f64) -> Self {
        Self {
            margin,
            severity: Severity::Hard,
        }
    }

    pub fn soft(margin: f64) -> Self {
        Self {
            margin,
            severity: Severity::Soft,
        }
    }
}

impl Rule for ActiveRangeRule {
    fn name(&self) -> &str {
        "active_range"
    }

    fn severity(&self) -> Severity {
        self.severity
    }

    fn check(&self, snapshot: &MotionSnapshot) -> Result<(), MoveError> {
        let ranges = snapshot.stage_md.pos_active_range.as_ref().ok_or_else(|| {
            MoveError::InvalidConfiguration("stage has no pos_active_range metadata".into())
        })?;
        for axis in ["x", "y", "z"] {
            if !is_in_range(&snapshot.stage, ranges, &[axis], self.margin)? {
                return Err(MoveError::SafetyCheckFailed(format!(
                    "stage axis '{axis}' position is out of active range"
                )));
            }
        }
        Ok(())
    }
}

/// Stage position on the line between its active and deactivated
/// positions, within `progress_rtol`.
pub struct LoadingPathRule {
    pub progress_rtol: f64,
}

impl Rule for LoadingPathRule {
    fn name(&self) -> &str {
        "loading_path"
    }

    fn severity(&self) -> Severity {
        Severity::Soft
    }

    fn check(&self, snapshot: &MotionSnapshot) -> Result<(), MoveError> {
        let active = snapshot.stage_md.require_fav_pos_active("stage")?;
        let deactive = snapshot.stage_md.require_fav_pos_deactive("stage")?;
        match loading_progress(&snapshot.stage, active, deactive, self.progress_rtol)? {
            Some(_) => Ok(()),
            None => Err(MoveError::SafetyCheckFailed(
                "stage position is not near the active to deactivated line".into(),
            )),
        }
    }
}

/// The stage deactivated position must not be tilted around `x`.
pub struct DeactiveTiltRule {
    pub rotation_atol: f64,
}

impl Rule for DeactiveTiltRule {
    fn name(&self) -> &str {
        "deactive_tilt"
    }

    fn check(&self, snapshot: &MotionSnapshot) -> Result<(), MoveError> {
        let deactive = snapshot.stage_md.require_fav_pos_deactive("stage")?;
        let rx = deactive.get("rx").copied().ok_or_else(|| {
            MoveError::InvalidConfiguration("stage fav_pos_deactive has no 'rx'".into())
        })?;
        if rx.abs() > self.rotation_atol {
            return Err(MoveError::SafetyCheckFailed(format!(
                "|rx| of the stage deactivated position is {} (limit {})",
                rx.abs(),
                self.rotation_atol
            )));
        }
        Ok(())
    }
}

/// `component` must currently be at its deactivated position.
///
/// Every axis of the deactivated position is compared; the stage uses the
/// linear or rotational tolerance per axis, the focus the linear one.  An
/// axis missing from the current position is an error, not a pass.
pub struct NearDeactiveRule {
    pub component: Component,
    pub tolerances: Tolerances,
}

impl Rule for NearDeactiveRule {
    fn name(&self) -> &str {
        match self.component {
            Component::Stage => "stage_near_deactive",
            Component::Focus => "focus_near_deactive",
        }
    }

    fn check(&self, snapshot: &MotionSnapshot) -> Result<(), MoveError> {
        let near = match self.component {
            Component::Stage => {
                let deactive = snapshot.stage_md.require_fav_pos_deactive("stage")?;
                is_near_position(&snapshot.stage, deactive, &self.tolerances)?
            }
            Component::Focus => focus_is_parked(snapshot, &self.tolerances)?,
        };
        if near {
            Ok(())
        } else {
            Err(MoveError::SafetyCheckFailed(format!(
                "{} is not near its deactivated position",
                self.component.as_str()
            )))
        }
    }
}

/// A stage that is already tilted may only move if the focus is parked at
/// its deactivated position. An untilted stage always passes; the
/// transition parks the focus itself.
pub struct TiltFocusRule {
    pub tolerances: Tolerances,
}

impl Rule for TiltFocusRule {
    fn name(&self) -> &str {
        "tilt_focus"
    }

    fn check(&self, snapshot: &MotionSnapshot) -> Result<(), MoveError> {
        if is_untilted(&snapshot.stage, self.tolerances.rotation_atol) {
            return Ok(());
        }
        let parked = NearDeactiveRule {
            component: Component::Focus,
            tolerances: self.tolerances.clone(),
        };
        parked.check(snapshot).map_err(|e| match e {
            MoveError::SafetyCheckFailed(_) => MoveError::SafetyCheckFailed(
                "cannot tilt while the focus is not near its deactivated position".into(),
            ),
            other => other,
        })
    }
}

fn focus_is_parked(snapshot: &MotionSnapshot, tolerances: &Tolerances) -> Result<bool, MoveError> {
    let deactive = snapshot.focus_md.require_fav_pos_deactive("focus")?;
    for (axis, target) in deactive {
        let current = snapshot
            .focus
            .get(axis)
            .copied()
            .ok_or_else(|| MoveError::invalid_axis("focus", axis))?;
        if !almost_equal(current, *target, tolerances.linear_atol, 0.0) {
            return Ok(false);
        }
    }
    Ok(true)
}

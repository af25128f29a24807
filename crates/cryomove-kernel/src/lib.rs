//! `cryomove-kernel` – Safety Checks
//!
//! Pure geometry: nothing here moves hardware. The runtime consults these
//! checks before a transition issues its first sub-move.
//!
//! # Modules
//!
//! - [`geometry`] – active-range membership, proximity to a reference
//!   position, and [`loading_progress`][geometry::loading_progress] along
//!   the active ↔ deactivated path.
//! - [`state_verifier`] – [`StateVerifier`][state_verifier::StateVerifier]:
//!   a rule engine that validates a
//!   [`MotionSnapshot`][state_verifier::MotionSnapshot] against registered
//!   hard and soft [`Rule`][state_verifier::Rule]s, with one preset per
//!   transition.

pub mod geometry;
pub mod state_verifier;

pub use geometry::{is_in_range, is_near_position, loading_progress};
pub use state_verifier::{
    ActiveRangeRule, Component, DeactiveTiltRule, LoadingPathRule, MotionSnapshot,
    NearDeactiveRule, Rule, Severity, StateVerifier, TiltFocusRule, is_untilted,
};

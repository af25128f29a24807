//! [`SampleMover`] – safe transitions of a cryo sample stage.
//!
//! Three transitions are supported, each run as one cancellable
//! [`MoveTask`]:
//!
//! | transition | precondition | sub-moves |
//! |---|---|---|
//! | [`LoadTarget::Loading`] | `rx` of the deactivated position ≈ 0 | focus → deactive, stage `rx,rz` → deactive, stage `x,y` → deactive, stage `z` → deactive |
//! | [`LoadTarget::Imaging`] | stage at its deactivated position | focus → deactive, stage `z` → active, stage `x,y` → active, stage `rx,rz` → active, focus → active |
//! | [`SampleMover::tilt_sample`] | stage inside its active range; focus parked if already tilted | (focus → deactive), stage `rx`, `rz` |
//!
//! Preconditions are checked by the [`StateVerifier`] presets before the
//! first sub-move; a violation fails the task without moving anything.
//!
//! Sub-moves run strictly one after another.  Before and after each one the
//! task checks for cancellation, so cancelling the transition lets the
//! current leg finish and skips the rest.  A leg that does not finish within
//! [`Tolerances::max_submove_duration`] is cancelled and the transition fails
//! with [`MoveError::Timeout`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cryomove_hal::{Actuator, HardwareRegistry, MoveTask, TaskContext};
use cryomove_kernel::{MotionSnapshot, StateVerifier, is_untilted, loading_progress};
use cryomove_types::{MoveError, Position, Tolerances, filter_position, position};
use tracing::{debug, error, info, instrument};

/// Destination of [`SampleMover::load_sample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadTarget {
    /// Stage at its deactivated position, sample reachable by the loader.
    Loading,
    /// Stage at its active position, focus engaged.
    Imaging,
}

impl fmt::Display for LoadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadTarget::Loading => f.write_str("loading"),
            LoadTarget::Imaging => f.write_str("imaging"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SampleMover
// ────────────────────────────────────────────────────────────────────────────

/// Orchestrates the stage and focus of a cryo microscope.
///
/// Cheap to clone; clones drive the same hardware.
#[derive(Clone)]
pub struct SampleMover {
    stage: Arc<dyn Actuator>,
    focus: Arc<dyn Actuator>,
    tolerances: Tolerances,
}

impl SampleMover {
    /// The stage needs `x`, `y`, `z`, `rx`, `rz` and the favourite
    /// positions plus active range in its metadata; the focus needs its
    /// favourite positions.  Metadata is read when a transition starts, not
    /// here.
    pub fn new(stage: Arc<dyn Actuator>, focus: Arc<dyn Actuator>, tolerances: Tolerances) -> Self {
        Self {
            stage,
            focus,
            tolerances,
        }
    }

    /// Resolve the `"stage"` and `"focus"` roles from `registry`.
    ///
    /// # Errors
    ///
    /// [`MoveError::InvalidConfiguration`] if either role is missing.
    pub fn from_registry(registry: &HardwareRegistry, tolerances: Tolerances) -> Result<Self, MoveError> {
        Ok(Self::new(
            registry.require("stage")?,
            registry.require("focus")?,
            tolerances,
        ))
    }

    pub fn stage(&self) -> &Arc<dyn Actuator> {
        &self.stage
    }

    pub fn focus(&self) -> &Arc<dyn Actuator> {
        &self.focus
    }

    pub fn tolerances(&self) -> &Tolerances {
        &self.tolerances
    }

    /// Move the sample to the loading or the imaging position.
    ///
    /// Returns immediately; the transition runs on the current tokio
    /// runtime.
    #[instrument(skip(self), fields(stage = %self.stage.name(), focus = %self.focus.name()))]
    pub fn load_sample(&self, target: LoadTarget) -> MoveTask {
        let this = self.clone();
        MoveTask::spawn(format!("load_sample({target})"), move |ctx| async move {
            info!(%target, "starting sample transition");
            let result = match target {
                LoadTarget::Loading => this.to_loading(&ctx).await,
                LoadTarget::Imaging => this.to_imaging(&ctx).await,
            };
            report(&format!("move to {target} position"), &result);
            result
        })
    }

    /// Tilt the stage to `rx` (and `rz` when given).
    ///
    /// `rx == 0` with `rz == Some(0)` means "back to imaging": the actual
    /// rotation is then read from the stage's favourite active position.
    #[instrument(skip(self), fields(stage = %self.stage.name(), focus = %self.focus.name()))]
    pub fn tilt_sample(&self, rx: f64, rz: Option<f64>) -> MoveTask {
        let this = self.clone();
        MoveTask::spawn(format!("tilt_sample(rx={rx}, rz={rz:?})"), move |ctx| async move {
            info!(rx, ?rz, "starting stage tilt");
            let result = this.tilt(&ctx, rx, rz).await;
            report(&format!("tilt to rx={rx}, rz={rz:?}"), &result);
            result
        })
    }

    /// Progress of the stage along the active → deactivated line: `0` at
    /// imaging, `1` at loading, `None` when the stage is off the line.
    ///
    /// # Errors
    ///
    /// [`MoveError::InvalidConfiguration`] if the favourite positions are
    /// missing, [`MoveError::InvalidAxis`] if they lack `x`, `y` or `z`.
    pub fn current_progress(&self) -> Result<Option<f64>, MoveError> {
        let md = self.stage.metadata();
        loading_progress(
            &self.stage.position().get(),
            md.require_fav_pos_active(self.stage.name())?,
            md.require_fav_pos_deactive(self.stage.name())?,
            self.tolerances.progress_rtol,
        )
    }

    fn snapshot(&self) -> MotionSnapshot {
        MotionSnapshot {
            stage: self.stage.position().get(),
            stage_md: self.stage.metadata(),
            focus: self.focus.position().get(),
            focus_md: self.focus.metadata(),
        }
    }

    // ── transitions ─────────────────────────────────────────────────────────

    async fn to_loading(&self, ctx: &TaskContext) -> Result<(), MoveError> {
        let snapshot = self.snapshot();
        let stage_deactive = snapshot.stage_md.require_fav_pos_deactive(self.stage.name())?;
        let focus_deactive = snapshot.focus_md.require_fav_pos_deactive(self.focus.name())?;
        StateVerifier::for_loading(&self.tolerances).verify(&snapshot)?;

        let legs = [
            (&self.focus, focus_deactive.clone()),
            (&self.stage, filter_position(stage_deactive, &["rx", "rz"])),
            (&self.stage, filter_position(stage_deactive, &["x", "y"])),
            (&self.stage, filter_position(stage_deactive, &["z"])),
        ];
        self.run_legs(ctx, legs).await
    }

    async fn to_imaging(&self, ctx: &TaskContext) -> Result<(), MoveError> {
        let snapshot = self.snapshot();
        let stage_active = snapshot.stage_md.require_fav_pos_active(self.stage.name())?;
        let focus_active = snapshot.focus_md.require_fav_pos_active(self.focus.name())?;
        let focus_deactive = snapshot.focus_md.require_fav_pos_deactive(self.focus.name())?;
        StateVerifier::for_imaging(&self.tolerances).verify(&snapshot)?;

        let legs = [
            (&self.focus, focus_deactive.clone()),
            (&self.stage, filter_position(stage_active, &["z"])),
            (&self.stage, filter_position(stage_active, &["x", "y"])),
            (&self.stage, filter_position(stage_active, &["rx", "rz"])),
            (&self.focus, focus_active.clone()),
        ];
        self.run_legs(ctx, legs).await
    }

    async fn tilt(&self, ctx: &TaskContext, rx: f64, rz: Option<f64>) -> Result<(), MoveError> {
        let snapshot = self.snapshot();
        StateVerifier::for_tilt(&self.tolerances).verify(&snapshot)?;

        let mut legs = Vec::new();
        if is_untilted(&snapshot.stage, self.tolerances.rotation_atol) {
            let focus_deactive = snapshot.focus_md.require_fav_pos_deactive(self.focus.name())?;
            legs.push((&self.focus, focus_deactive.clone()));
        }

        if rx == 0.0 && rz == Some(0.0) {
            let active = snapshot.stage_md.require_fav_pos_active(self.stage.name())?;
            let rotation = |axis: &str| {
                active.get(axis).copied().ok_or_else(|| {
                    MoveError::InvalidConfiguration(format!(
                        "fav_pos_active of {} has no '{axis}'",
                        self.stage.name()
                    ))
                })
            };
            legs.push((&self.stage, position([("rz", rotation("rz")?)])));
            legs.push((&self.stage, position([("rx", rotation("rx")?)])));
        } else {
            legs.push((&self.stage, position([("rx", rx)])));
            if let Some(rz) = rz {
                legs.push((&self.stage, position([("rz", rz)])));
            }
        }
        self.run_legs(ctx, legs).await
    }

    async fn run_legs<'a>(
        &self,
        ctx: &TaskContext,
        legs: impl IntoIterator<Item = (&'a Arc<dyn Actuator>, Position)>,
    ) -> Result<(), MoveError> {
        let limit = self.tolerances.max_submove_duration();
        for (component, target) in legs {
            run_sub_move(ctx, component.as_ref(), target, limit).await?;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sub-moves
// ────────────────────────────────────────────────────────────────────────────

/// Move `component` to `target` as a sub-task of `ctx`, waiting at most
/// `limit`.
///
/// # Errors
///
/// - [`MoveError::Cancelled`] if the transition is cancelled before or
///   after the leg;
/// - [`MoveError::Timeout`] if the leg outlasts `limit` (the leg is
///   cancelled);
/// - whatever the leg itself fails with.
#[instrument(skip(ctx, component, limit), fields(component = %component.name()))]
pub async fn run_sub_move(
    ctx: &TaskContext,
    component: &dyn Actuator,
    target: Position,
    limit: Duration,
) -> Result<(), MoveError> {
    if ctx.is_cancelled() {
        info!(?target, "transition cancelled before sub-move");
        return Err(MoveError::Cancelled);
    }
    debug!(?target, "performing sub-move");
    let description = format!("moving {} to {target:?}", component.name());
    let sub = ctx.dispatch(|| component.move_abs(target))?;

    match tokio::time::timeout(limit, ctx.wait(&sub)).await {
        Ok(result) => result?,
        Err(_) => {
            sub.cancel();
            error!(seconds = limit.as_secs_f64(), "sub-move timed out");
            return Err(MoveError::Timeout {
                operation: description,
                seconds: limit.as_secs_f64(),
            });
        }
    }

    if ctx.is_cancelled() {
        info!("transition cancelled after sub-move");
        return Err(MoveError::Cancelled);
    }
    Ok(())
}

fn report(what: &str, result: &Result<(), MoveError>) {
    match result {
        Ok(()) => info!("{what}: done"),
        Err(MoveError::Cancelled) => info!("{what}: cancelled"),
        Err(e) => error!(error = %e, "{what}: failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryomove_hal::{SimActuator, SimCall, TaskState};
    use cryomove_types::{AxisDescriptor, Metadata};
    use tokio::sync::Semaphore;

    // ------------------------------------------------------------------ helpers

    fn imaging() -> Position {
        position([("x", 0.0), ("y", 0.0), ("z", 0.0), ("rx", 0.0), ("rz", 0.0)])
    }

    fn loading() -> Position {
        position([("x", 10e-3), ("y", 0.0), ("z", -5e-3), ("rx", 0.0), ("rz", 0.0)])
    }

    fn stage_at(pos: Position) -> Arc<SimActuator> {
        Arc::new(
            SimActuator::builder("stage")
                .axis("x", AxisDescriptor::range(-50e-3, 50e-3))
                .axis("y", AxisDescriptor::range(-50e-3, 50e-3))
                .axis("z", AxisDescriptor::range(-20e-3, 20e-3))
                .axis("rx", AxisDescriptor::range(-0.5, 0.5))
                .axis("rz", AxisDescriptor::range(-3.2, 3.2))
                .position(pos)
                .metadata(
                    Metadata::new()
                        .with_fav_pos_active(imaging())
                        .with_fav_pos_deactive(loading())
                        .with_active_range("x", -5e-3, 5e-3)
                        .with_active_range("y", -5e-3, 5e-3)
                        .with_active_range("z", -1e-3, 1e-3),
                )
                .build()
                .unwrap(),
        )
    }

    fn focus_builder(z: f64) -> cryomove_hal::sim::SimActuatorBuilder {
        SimActuator::builder("focus")
            .axis("z", AxisDescriptor::range(-5e-3, 5e-3))
            .position(position([("z", z)]))
            .metadata(
                Metadata::new()
                    .with_fav_pos_active(position([("z", 2e-3)]))
                    .with_fav_pos_deactive(position([("z", 0.0)])),
            )
    }

    fn focus_at(z: f64) -> Arc<SimActuator> {
        Arc::new(focus_builder(z).build().unwrap())
    }

    fn mover(stage: &Arc<SimActuator>, focus: &Arc<SimActuator>) -> SampleMover {
        SampleMover::new(stage.clone(), focus.clone(), Tolerances::default())
    }

    fn abs(pairs: &[(&str, f64)]) -> SimCall {
        SimCall::MoveAbs(position(pairs.iter().copied()))
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    // ------------------------------------------------------------------ loading / imaging

    #[tokio::test]
    async fn loading_runs_legs_in_order() {
        let stage = stage_at(imaging());
        let focus = focus_at(2e-3);
        let task = mover(&stage, &focus).load_sample(LoadTarget::Loading);

        assert_eq!(task.wait().await, Ok(()));
        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(focus.calls(), vec![abs(&[("z", 0.0)])]);
        assert_eq!(
            stage.calls(),
            vec![
                abs(&[("rx", 0.0), ("rz", 0.0)]),
                abs(&[("x", 10e-3), ("y", 0.0)]),
                abs(&[("z", -5e-3)]),
            ]
        );
        assert_eq!(stage.position().get(), loading());
    }

    #[tokio::test]
    async fn imaging_runs_legs_in_order() {
        let stage = stage_at(loading());
        let focus = focus_at(0.0);
        let task = mover(&stage, &focus).load_sample(LoadTarget::Imaging);

        assert_eq!(task.wait().await, Ok(()));
        assert_eq!(focus.calls(), vec![abs(&[("z", 0.0)]), abs(&[("z", 2e-3)])]);
        assert_eq!(
            stage.calls(),
            vec![
                abs(&[("z", 0.0)]),
                abs(&[("x", 0.0), ("y", 0.0)]),
                abs(&[("rx", 0.0), ("rz", 0.0)]),
            ]
        );
        assert_eq!(stage.position().get(), imaging());
    }

    #[tokio::test]
    async fn imaging_with_rotation_off_deactive_moves_nothing() {
        let mut start = loading();
        start.insert("rx".into(), 0.05);
        let stage = stage_at(start);
        let focus = focus_at(0.0);

        let task = mover(&stage, &focus).load_sample(LoadTarget::Imaging);
        assert!(matches!(task.wait().await, Err(MoveError::SafetyCheckFailed(_))));
        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(stage.move_count(), 0);
        assert_eq!(focus.move_count(), 0);
    }

    #[tokio::test]
    async fn loading_with_tilted_deactive_position_is_refused() {
        let stage = stage_at(imaging());
        let mut tilted = loading();
        tilted.insert("rx".into(), 0.2);
        stage
            .update_metadata(Metadata::new().with_fav_pos_deactive(tilted))
            .unwrap();
        let focus = focus_at(2e-3);

        let task = mover(&stage, &focus).load_sample(LoadTarget::Loading);
        assert!(matches!(task.wait().await, Err(MoveError::SafetyCheckFailed(_))));
        assert_eq!(focus.move_count(), 0);
    }

    #[tokio::test]
    async fn loading_from_off_path_position_still_runs() {
        let stage = stage_at(position([("x", 20e-3), ("y", 8e-3), ("z", 3e-3), ("rx", 0.0), ("rz", 0.0)]));
        let focus = focus_at(0.0);
        let task = mover(&stage, &focus).load_sample(LoadTarget::Loading);
        assert_eq!(task.wait().await, Ok(()));
        assert_eq!(stage.position().get(), loading());
    }

    #[tokio::test]
    async fn failing_leg_aborts_remaining_legs() {
        let stage = stage_at(imaging());
        let focus = focus_at(2e-3);
        stage.fail_with(Some(MoveError::HardwareFault {
            component: "stage".into(),
            details: "stall".into(),
        }));

        let task = mover(&stage, &focus).load_sample(LoadTarget::Loading);
        assert!(matches!(task.wait().await, Err(MoveError::HardwareFault { .. })));
        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(focus.move_count(), 1);
        assert_eq!(stage.move_count(), 1);
    }

    #[tokio::test]
    async fn missing_metadata_is_configuration_error() {
        let stage = stage_at(imaging());
        let focus = Arc::new(
            SimActuator::builder("focus")
                .axis("z", AxisDescriptor::range(-5e-3, 5e-3))
                .build()
                .unwrap(),
        );
        let task = mover(&stage, &focus).load_sample(LoadTarget::Loading);
        assert!(matches!(task.wait().await, Err(MoveError::InvalidConfiguration(_))));
        assert_eq!(stage.move_count(), 0);
    }

    // ------------------------------------------------------------------ cancellation & timeout

    #[tokio::test]
    async fn cancel_after_first_leg_stops_the_sequence() {
        let gate = Arc::new(Semaphore::new(0));
        let stage = stage_at(imaging());
        let focus = Arc::new(focus_builder(2e-3).gate(Arc::clone(&gate)).build().unwrap());

        let task = mover(&stage, &focus).load_sample(LoadTarget::Loading);
        for _ in 0..100 {
            if focus.move_count() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        settle().await;
        assert_eq!(focus.move_count(), 1);

        assert!(task.cancel());
        gate.add_permits(1);

        assert_eq!(task.wait().await, Err(MoveError::Cancelled));
        assert_eq!(task.state(), TaskState::Finished);
        // The first leg completed, nothing after it started.
        assert_eq!(focus.position().get()["z"], 0.0);
        assert_eq!(stage.move_count(), 0);
        assert_eq!(stage.position().get(), imaging());
    }

    #[tokio::test]
    async fn cancel_before_start_moves_nothing() {
        let stage = stage_at(imaging());
        let focus = focus_at(2e-3);
        let task = mover(&stage, &focus).load_sample(LoadTarget::Loading);
        assert!(task.cancel());

        assert_eq!(task.wait().await, Err(MoveError::Cancelled));
        assert_eq!(focus.move_count(), 0);
        assert_eq!(stage.move_count(), 0);
    }

    #[tokio::test]
    async fn stuck_leg_times_out() {
        let gate = Arc::new(Semaphore::new(0));
        let stage = stage_at(imaging());
        let focus = Arc::new(focus_builder(2e-3).gate(gate).build().unwrap());
        let tolerances = Tolerances::default().with_max_submove_duration(Duration::from_millis(20));
        let mover = SampleMover::new(stage.clone(), focus.clone(), tolerances);

        let task = mover.load_sample(LoadTarget::Loading);
        assert!(matches!(task.wait().await, Err(MoveError::Timeout { .. })));
        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(stage.move_count(), 0);
    }

    // ------------------------------------------------------------------ tilt

    #[tokio::test]
    async fn tilt_from_imaging_parks_focus_first() {
        let stage = stage_at(imaging());
        let focus = focus_at(2e-3);
        let task = mover(&stage, &focus).tilt_sample(0.3, Some(0.1));

        assert_eq!(task.wait().await, Ok(()));
        assert_eq!(focus.calls(), vec![abs(&[("z", 0.0)])]);
        assert_eq!(
            stage.calls(),
            vec![abs(&[("rx", 0.3)]), abs(&[("rz", 0.1)])]
        );
    }

    #[tokio::test]
    async fn tilt_without_rz_moves_rx_only() {
        let stage = stage_at(imaging());
        let focus = focus_at(0.0);
        let task = mover(&stage, &focus).tilt_sample(0.2, None);
        assert_eq!(task.wait().await, Ok(()));
        assert_eq!(stage.calls(), vec![abs(&[("rx", 0.2)])]);
    }

    #[tokio::test]
    async fn tilt_back_to_imaging_uses_active_rotation() {
        let mut tilted = imaging();
        tilted.insert("rx".into(), 0.3);
        tilted.insert("rz".into(), 0.1);
        let stage = stage_at(tilted);
        let focus = focus_at(0.0);

        let task = mover(&stage, &focus).tilt_sample(0.0, Some(0.0));
        assert_eq!(task.wait().await, Ok(()));
        assert_eq!(focus.move_count(), 0);
        assert_eq!(
            stage.calls(),
            vec![abs(&[("rz", 0.0)]), abs(&[("rx", 0.0)])]
        );
    }

    #[tokio::test]
    async fn tilted_stage_with_engaged_focus_is_refused() {
        let mut tilted = imaging();
        tilted.insert("rx".into(), 0.3);
        let stage = stage_at(tilted);
        let focus = focus_at(2e-3);

        let task = mover(&stage, &focus).tilt_sample(0.1, None);
        assert!(matches!(task.wait().await, Err(MoveError::SafetyCheckFailed(_))));
        assert_eq!(stage.move_count(), 0);
        assert_eq!(focus.move_count(), 0);
    }

    #[tokio::test]
    async fn tilt_outside_active_range_is_refused() {
        let stage = stage_at(loading());
        let focus = focus_at(0.0);
        let task = mover(&stage, &focus).tilt_sample(0.3, None);
        assert!(matches!(task.wait().await, Err(MoveError::SafetyCheckFailed(_))));
        assert_eq!(stage.move_count(), 0);
    }

    // ------------------------------------------------------------------ misc

    #[tokio::test]
    async fn progress_follows_the_loading_line() {
        let stage = stage_at(imaging());
        let focus = focus_at(0.0);
        let m = mover(&stage, &focus);
        assert_eq!(m.current_progress().unwrap(), Some(0.0));

        stage.force_position(position([("x", 5e-3), ("z", -2.5e-3)]));
        let p = m.current_progress().unwrap().unwrap();
        assert!((p - 0.5).abs() < 1e-9);

        stage.force_position(position([("y", 10e-3)]));
        assert_eq!(m.current_progress().unwrap(), None);
    }

    #[tokio::test]
    async fn from_registry_requires_both_roles() {
        let mut registry = HardwareRegistry::new();
        registry.register("stage", stage_at(imaging()));
        assert!(matches!(
            SampleMover::from_registry(&registry, Tolerances::default()),
            Err(MoveError::InvalidConfiguration(_))
        ));

        registry.register("focus", focus_at(0.0));
        let m = SampleMover::from_registry(&registry, Tolerances::default()).unwrap();
        assert_eq!(m.stage().name(), "stage");
        assert_eq!(m.focus().name(), "focus");
    }
}

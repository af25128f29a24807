//! [`AntiBacklashActuator`] – makes every move on selected axes finish in a
//! fixed direction, cancelling mechanical slack.
//!
//! For an axis with backlash `b` and a requested shift `v`:
//! - `v · b >= 0`: the move already ends in the right direction, move by `v`;
//! - otherwise: move by `v - b`, then by `b`.
//!
//! Absolute moves take the same decision on `target - current` and use two
//! absolute legs (`target - b`, then `target`).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use cryomove_types::{AxisDescriptor, Metadata, MoveError, Position, Referenced, Speed};
use tracing::debug;

use crate::actuator::{Actuator, check_move_abs, check_move_rel};
use crate::observable::ObservableView;
use crate::task::{MoveTask, SerialExecutor, TaskContext};

struct BacklashInner {
    name: String,
    child: Arc<dyn Actuator>,
    backlash: BTreeMap<String, f64>,
    metadata: RwLock<Metadata>,
    executor: SerialExecutor,
}

impl BacklashInner {
    /// Split a relative shift into the main leg and the corrective leg.
    fn split_rel(&self, shift: &Position) -> (Position, Position) {
        let mut main = Position::new();
        let mut correction = Position::new();
        for (axis, v) in shift {
            match self.backlash.get(axis) {
                Some(b) if v * b < 0.0 => {
                    main.insert(axis.clone(), v - b);
                    correction.insert(axis.clone(), *b);
                }
                _ => {
                    main.insert(axis.clone(), *v);
                }
            }
        }
        (main, correction)
    }

    /// Split an absolute target into the approach leg and the final leg.
    fn split_abs(&self, pos: &Position) -> (Position, Position) {
        let current = self.child.position().get();
        let mut approach = Position::new();
        let mut finish = Position::new();
        for (axis, target) in pos {
            let shift = current.get(axis).map_or(0.0, |c| target - c);
            match self.backlash.get(axis) {
                Some(b) if shift * b < 0.0 => {
                    approach.insert(axis.clone(), target - b);
                    finish.insert(axis.clone(), *target);
                }
                _ => {
                    approach.insert(axis.clone(), *target);
                }
            }
        }
        (approach, finish)
    }

    async fn do_move_rel(&self, ctx: &TaskContext, shift: Position) -> Result<(), MoveError> {
        let (main, correction) = self.split_rel(&shift);
        debug!(actuator = %self.name, ?main, ?correction, "backlash-compensated relative move");
        ctx.run(|| self.child.move_rel(main)).await?;
        ctx.run(|| self.child.move_rel(correction)).await
    }

    async fn do_move_abs(&self, ctx: &TaskContext, pos: Position) -> Result<(), MoveError> {
        let (approach, finish) = self.split_abs(&pos);
        debug!(actuator = %self.name, ?approach, ?finish, "backlash-compensated absolute move");
        ctx.run(|| self.child.move_abs(approach)).await?;
        ctx.run(|| self.child.move_abs(finish)).await
    }
}

/// Anti-backlash wrapper. See the [module docs](self).
///
/// Position, referenced and speed are the child's own observables.
pub struct AntiBacklashActuator {
    inner: Arc<BacklashInner>,
}

impl AntiBacklashActuator {
    /// `backlash` maps child axes to a signed distance; axes without an entry
    /// are moved directly.
    ///
    /// # Errors
    ///
    /// [`MoveError::InvalidConfiguration`] for an axis the child lacks or a
    /// non-finite backlash value.
    pub fn new(
        name: impl Into<String>,
        child: Arc<dyn Actuator>,
        backlash: BTreeMap<String, f64>,
    ) -> Result<Self, MoveError> {
        let name = name.into();
        for (axis, b) in &backlash {
            if !child.has_axis(axis) {
                return Err(MoveError::InvalidConfiguration(format!(
                    "{name}: child {} has no axis '{axis}'",
                    child.name()
                )));
            }
            if !b.is_finite() {
                return Err(MoveError::InvalidConfiguration(format!(
                    "{name}: backlash of '{axis}' must be a finite number, got {b}"
                )));
            }
        }
        let executor = SerialExecutor::new(name.clone())?;
        Ok(Self {
            inner: Arc::new(BacklashInner {
                name,
                child,
                backlash,
                metadata: RwLock::new(Metadata::default()),
                executor,
            }),
        })
    }

    pub async fn terminate(&self) {
        self.stop(None).await;
        self.inner.executor.shutdown();
    }
}

#[async_trait]
impl Actuator for AntiBacklashActuator {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn axes(&self) -> &BTreeMap<String, AxisDescriptor> {
        self.inner.child.axes()
    }

    fn position(&self) -> ObservableView<Position> {
        self.inner.child.position()
    }

    fn referenced(&self) -> Option<ObservableView<Referenced>> {
        self.inner.child.referenced()
    }

    fn speed(&self) -> Option<ObservableView<Speed>> {
        self.inner.child.speed()
    }

    fn set_speed(&self, speed: &Speed) -> Result<(), MoveError> {
        self.inner.child.set_speed(speed)
    }

    fn metadata(&self) -> Metadata {
        self.inner
            .metadata
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update_metadata(&self, md: Metadata) -> Result<(), MoveError> {
        self.inner
            .metadata
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .merge(md);
        Ok(())
    }

    fn move_abs(&self, pos: Position) -> MoveTask {
        let label = format!("{}.move_abs", self.inner.name);
        if pos.is_empty() {
            return MoveTask::completed(label);
        }
        if let Err(e) = check_move_abs(&self.inner.name, self.axes(), &pos) {
            return MoveTask::failed(label, e);
        }
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .submit(label, move |ctx| async move { inner.do_move_abs(&ctx, pos).await })
    }

    fn move_rel(&self, shift: Position) -> MoveTask {
        let label = format!("{}.move_rel", self.inner.name);
        if shift.is_empty() {
            return MoveTask::completed(label);
        }
        if let Err(e) = check_move_rel(&self.inner.name, self.axes(), &shift) {
            return MoveTask::failed(label, e);
        }
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .submit(label, move |ctx| async move { inner.do_move_rel(&ctx, shift).await })
    }

    fn reference(&self, axes: BTreeSet<String>) -> MoveTask {
        self.inner.child.reference(axes)
    }

    async fn stop(&self, axes: Option<BTreeSet<String>>) {
        self.inner.executor.cancel_all();
        self.inner.child.stop(axes).await;
    }
}

impl Drop for AntiBacklashActuator {
    fn drop(&mut self) {
        self.inner.executor.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimActuator, SimCall};
    use cryomove_types::position;

    fn wrapped(backlash: f64) -> (Arc<SimActuator>, AntiBacklashActuator) {
        let child = Arc::new(
            SimActuator::builder("focus")
                .axis("z", AxisDescriptor::range(-1e-2, 1e-2))
                .axis("x", AxisDescriptor::range(-1e-2, 1e-2))
                .build()
                .unwrap(),
        );
        let ab = AntiBacklashActuator::new(
            "focus_ab",
            child.clone(),
            BTreeMap::from([("z".to_string(), backlash)]),
        )
        .unwrap();
        (child, ab)
    }

    #[tokio::test]
    async fn opposite_shift_is_split_into_two_legs() {
        let (child, ab) = wrapped(100e-6);
        ab.move_rel(position([("z", -1e-3)])).wait().await.unwrap();

        assert_eq!(
            child.calls(),
            vec![
                SimCall::MoveRel(position([("z", -1e-3 - 100e-6)])),
                SimCall::MoveRel(position([("z", 100e-6)])),
            ]
        );
        assert!((child.position().get()["z"] - (-1e-3)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn shift_in_backlash_direction_is_direct() {
        let (child, ab) = wrapped(-50e-6);
        ab.move_rel(position([("z", -1e-3), ("x", 2e-3)])).wait().await.unwrap();
        assert_eq!(
            child.calls(),
            vec![SimCall::MoveRel(position([("x", 2e-3), ("z", -1e-3)]))]
        );
    }

    #[tokio::test]
    async fn absolute_move_approaches_from_backlash_side() {
        let (child, ab) = wrapped(100e-6);
        child.force_position(position([("z", 2e-3)]));

        ab.move_abs(position([("z", 1e-3)])).wait().await.unwrap();
        assert_eq!(
            child.calls(),
            vec![
                SimCall::MoveAbs(position([("z", 1e-3 - 100e-6)])),
                SimCall::MoveAbs(position([("z", 1e-3)])),
            ]
        );

        child.clear_calls();
        ab.move_abs(position([("z", 3e-3)])).wait().await.unwrap();
        assert_eq!(child.calls(), vec![SimCall::MoveAbs(position([("z", 3e-3)]))]);
    }

    #[tokio::test]
    async fn failed_first_leg_aborts_correction() {
        let (child, ab) = wrapped(100e-6);
        child.fail_with(Some(MoveError::HardwareFault {
            component: "focus".into(),
            details: "blocked".into(),
        }));
        assert!(ab.move_rel(position([("z", -1e-3)])).wait().await.is_err());
        assert_eq!(child.move_count(), 1);
    }

    #[tokio::test]
    async fn observables_are_shared_with_child() {
        let (child, ab) = wrapped(1e-4);
        child.force_position(position([("x", 4e-3)]));
        assert_eq!(ab.position().get()["x"], 4e-3);
        assert_eq!(ab.axes().len(), 2);
        assert!(ab.has_speed());
        assert!(!ab.has_referenced());
    }

    #[tokio::test]
    async fn unknown_backlash_axis_is_rejected() {
        let child: Arc<dyn Actuator> = Arc::new(
            SimActuator::builder("focus")
                .axis("z", AxisDescriptor::range(-1.0, 1.0))
                .build()
                .unwrap(),
        );
        let err = AntiBacklashActuator::new("ab", child.clone(), BTreeMap::from([("q".to_string(), 1.0)]));
        assert!(matches!(err, Err(MoveError::InvalidConfiguration(_))));
        let err = AntiBacklashActuator::new("ab", child, BTreeMap::from([("z".to_string(), f64::NAN)]));
        assert!(matches!(err, Err(MoveError::InvalidConfiguration(_))));
    }
}

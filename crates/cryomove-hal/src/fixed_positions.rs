//! [`FixedPositionsActuator`] – one axis of a child restricted to a discrete
//! set of positions (filter-wheel slots, turret holes, …), optionally cyclic.
//!
//! In cyclic mode a move goes the short way round and is issued as a relative
//! move.  Forward travel is accumulated; once it reaches a full cycle the
//! wheel goes back through its reference switch to bound encoder drift.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use cryomove_types::util::{cyclic_distance, find_closest};
use cryomove_types::{AxisDescriptor, Choice, Metadata, MoveError, Position, Referenced, Tolerances};
use tracing::{debug, error, warn};

use crate::actuator::{Actuator, ComponentState, check_axes, check_move_abs, stop_with_timeout};
use crate::observable::{Observable, ObservableView, Subscription};
use crate::task::{MoveTask, SerialExecutor, TaskContext};

/// The allowed positions and, in cyclic mode, the cycle length.
#[derive(Clone)]
struct Grid {
    positions: Vec<Choice>,
    cycle: Option<f64>,
}

impl Grid {
    /// Nearest declared position to a raw child value, and its distance.
    fn nearest(&self, raw: f64) -> Option<(&Choice, f64)> {
        let value = find_closest(raw, self.positions.iter().map(|c| c.value), self.cycle)?;
        let choice = self.positions.iter().find(|c| c.value == value)?;
        let dist = match self.cycle {
            Some(cycle) => cyclic_distance(raw, value, cycle),
            None => (raw - value).abs(),
        };
        Some((choice, dist))
    }
}

struct FixedInner {
    name: String,
    child: Arc<dyn Actuator>,
    child_axis: String,
    axis: String,
    axes: BTreeMap<String, AxisDescriptor>,
    grid: Grid,
    cycle_offset: f64,
    move_sum: Mutex<f64>,
    position: Observable<Position>,
    referenced: Option<Observable<Referenced>>,
    state: Observable<ComponentState>,
    metadata: RwLock<Metadata>,
    executor: SerialExecutor,
    snap_atol: f64,
    stop_timeout: Duration,
}

impl FixedInner {
    fn raw_position(&self) -> Result<f64, MoveError> {
        self.child
            .position()
            .get()
            .get(&self.child_axis)
            .copied()
            .ok_or_else(|| MoveError::HardwareFault {
                component: self.child.name().to_string(),
                details: format!("position of '{}' unknown", self.child_axis),
            })
    }

    fn child_pos(&self, value: f64) -> Position {
        Position::from([(self.child_axis.clone(), value)])
    }

    fn child_axes(&self) -> BTreeSet<String> {
        BTreeSet::from([self.child_axis.clone()])
    }

    fn lock_sum(&self) -> std::sync::MutexGuard<'_, f64> {
        self.move_sum.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn do_move_abs(&self, ctx: &TaskContext, target: f64) -> Result<(), MoveError> {
        let Some(cycle) = self.grid.cycle else {
            return ctx.run(|| self.child.move_abs(self.child_pos(target))).await;
        };

        let current = self.raw_position()?.rem_euclid(cycle);
        let forward = (target - current).rem_euclid(cycle);
        let backward = (current - target).rem_euclid(cycle);
        if forward == 0.0 || backward == 0.0 {
            return Ok(());
        }

        if forward < backward {
            let rereference = {
                let mut sum = self.lock_sum();
                *sum += forward;
                if *sum >= cycle {
                    *sum = 0.0;
                    true
                } else {
                    false
                }
            };
            if rereference {
                let to_switch = (cycle - current).rem_euclid(cycle) + self.cycle_offset;
                debug!(actuator = %self.name, to_switch, "full cycle travelled, re-referencing");
                ctx.run(|| self.child.move_rel(self.child_pos(to_switch))).await?;
                ctx.run(|| self.child.reference(self.child_axes())).await?;
                ctx.run(|| self.child.move_rel(self.child_pos(target))).await
            } else {
                ctx.run(|| self.child.move_rel(self.child_pos(forward))).await
            }
        } else {
            ctx.run(|| self.child.move_rel(self.child_pos(-backward))).await?;
            *self.lock_sum() -= backward;
            Ok(())
        }
    }

    /// Reference the child axis, then correct an off-grid result.
    async fn do_reference(&self, ctx: &TaskContext) -> Result<(), MoveError> {
        ctx.run(|| self.child.reference(self.child_axes())).await?;
        *self.lock_sum() = 0.0;
        self.snap_to_grid(ctx).await
    }

    /// Move to the nearest declared position if the child is off-grid.
    async fn snap_to_grid(&self, ctx: &TaskContext) -> Result<(), MoveError> {
        let raw = self.raw_position()?;
        match self.grid.nearest(raw) {
            Some((choice, dist)) if dist > self.snap_atol => {
                debug!(actuator = %self.name, raw, target = choice.value, "moving to nearest position");
                self.do_move_abs(ctx, choice.value).await
            }
            _ => Ok(()),
        }
    }
}

/// Discrete-position wrapper. See the [module docs](self).
pub struct FixedPositionsActuator {
    inner: Arc<FixedInner>,
    init_task: MoveTask,
    _subscriptions: Vec<Subscription>,
}

impl FixedPositionsActuator {
    /// Wrap `child_axis` of `child`, exposed as `axis`.
    ///
    /// In cyclic mode every position must lie in `[0, cycle)`.  At
    /// construction the axis is referenced if it can be and is not yet
    /// referenced (always, in cyclic mode); otherwise it is moved to the
    /// nearest declared position.  A failure there sets
    /// [`ComponentState::Error`].
    ///
    /// # Errors
    ///
    /// [`MoveError::InvalidConfiguration`] for a missing child axis, an empty
    /// position set, a non-positive cycle or a position outside the cycle.
    pub fn new(
        name: impl Into<String>,
        child: Arc<dyn Actuator>,
        child_axis: &str,
        axis: &str,
        positions: Vec<Choice>,
        cycle: Option<f64>,
        tolerances: &Tolerances,
    ) -> Result<Self, MoveError> {
        let name = name.into();
        let bad = |msg: String| MoveError::InvalidConfiguration(format!("{name}: {msg}"));

        let child_desc = child
            .axes()
            .get(child_axis)
            .ok_or_else(|| bad(format!("child {} has no axis '{child_axis}'", child.name())))?;
        if positions.is_empty() {
            return Err(bad("at least one position is required".into()));
        }
        if let Some(c) = positions.iter().find(|c| !c.value.is_finite()) {
            return Err(bad(format!("position {} is not a finite number", c.value)));
        }
        if let Some(cycle) = cycle {
            if !(cycle.is_finite() && cycle > 0.0) {
                return Err(bad(format!("cycle must be positive, got {cycle}")));
            }
            if let Some(c) = positions.iter().find(|c| c.value < 0.0 || c.value >= cycle) {
                return Err(bad(format!("position {} is outside the cycle [0, {cycle})", c.value)));
            }
        }

        let mut positions = positions;
        positions.sort_by(|a, b| a.value.total_cmp(&b.value));
        let cycle_offset = cycle.map_or(0.0, |c| c / positions.len() as f64);
        let mut desc = AxisDescriptor::choices(positions.clone());
        desc.unit = child_desc.unit.clone();
        let axes = BTreeMap::from([(axis.to_string(), desc)]);
        let grid = Grid { positions, cycle };

        let snap_atol = tolerances.fixed_position_atol;
        let snap = {
            let grid = grid.clone();
            let name = name.clone();
            let axis = axis.to_string();
            let child_axis = child_axis.to_string();
            move |raw_pos: &Position| -> Option<Position> {
                let raw = *raw_pos.get(&child_axis)?;
                let (choice, dist) = grid.nearest(raw)?;
                if dist > snap_atol {
                    warn!(actuator = %name, raw, nearest = choice.value, "position is off the declared grid");
                }
                Some(Position::from([(axis.clone(), choice.value)]))
            }
        };

        let position = Observable::new(snap(&child.position().get()).unwrap_or_default());
        let mut subscriptions = Vec::new();
        let own = position.clone();
        subscriptions.push(child.position().subscribe(move |p| {
            if let Some(snapped) = snap(p) {
                own.set(snapped);
            }
        }));

        let referenced = child.referenced().map(|child_ref| {
            let read = {
                let axis = axis.to_string();
                let child_axis = child_axis.to_string();
                move |r: &Referenced| {
                    Referenced::from([(axis.clone(), r.get(&child_axis).copied().unwrap_or(false))])
                }
            };
            let own = Observable::new(read(&child_ref.get()));
            let writer = own.clone();
            subscriptions.push(child_ref.subscribe(move |r| writer.set(read(r))));
            own
        });

        let executor = SerialExecutor::new(name.clone())?;
        let inner = Arc::new(FixedInner {
            name,
            child,
            child_axis: child_axis.to_string(),
            axis: axis.to_string(),
            axes,
            grid,
            cycle_offset,
            move_sum: Mutex::new(0.0),
            position,
            referenced,
            state: Observable::new(ComponentState::Running),
            metadata: RwLock::new(Metadata::default()),
            executor,
            snap_atol,
            stop_timeout: tolerances.stop_timeout(),
        });

        let must_reference = inner.referenced.as_ref().is_some_and(|r| {
            inner.grid.cycle.is_some() || !r.get().get(&inner.axis).copied().unwrap_or(false)
        });
        let job_inner = Arc::clone(&inner);
        let init_task = inner.executor.submit(format!("{}.init", inner.name), move |ctx| async move {
            let result = if must_reference {
                job_inner.do_reference(&ctx).await
            } else {
                job_inner.snap_to_grid(&ctx).await
            };
            if let Err(e) = &result {
                error!(actuator = %job_inner.name, error = %e, "initialisation failed");
                job_inner.state.set(ComponentState::Error(e.clone()));
                stop_with_timeout(
                    job_inner.child.as_ref(),
                    Some(job_inner.child_axes()),
                    job_inner.stop_timeout,
                )
                .await;
            }
            result
        });

        Ok(Self {
            inner,
            init_task,
            _subscriptions: subscriptions,
        })
    }

    /// The initialisation task (referencing or move to nearest position).
    pub fn init_task(&self) -> &MoveTask {
        &self.init_task
    }

    pub fn state(&self) -> ObservableView<ComponentState> {
        self.inner.state.view()
    }

    /// Label of the current position, if it has one.
    pub fn position_label(&self) -> Option<String> {
        let value = *self.inner.position.get().get(&self.inner.axis)?;
        self.inner
            .axes
            .get(&self.inner.axis)?
            .choice_list()
            .iter()
            .find(|c| c.value == value)
            .and_then(|c| c.label.clone())
    }

    pub async fn terminate(&self) {
        self.stop(None).await;
        self.inner.executor.shutdown();
    }
}

#[async_trait]
impl Actuator for FixedPositionsActuator {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn axes(&self) -> &BTreeMap<String, AxisDescriptor> {
        &self.inner.axes
    }

    fn position(&self) -> ObservableView<Position> {
        self.inner.position.view()
    }

    fn referenced(&self) -> Option<ObservableView<Referenced>> {
        self.inner.referenced.as_ref().map(Observable::view)
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
        if let Err(e) = check_move_abs(&self.inner.name, &self.inner.axes, &pos) {
            return MoveTask::failed(label, e);
        }
        let Some(target) = pos.get(&self.inner.axis).copied() else {
            return MoveTask::completed(label);
        };
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .submit(label, move |ctx| async move { inner.do_move_abs(&ctx, target).await })
    }

    fn move_rel(&self, _shift: Position) -> MoveTask {
        MoveTask::failed(
            format!("{}.move_rel", self.inner.name),
            MoveError::UnsupportedOperation {
                actuator: self.inner.name.clone(),
                details: "relative moves are not defined on fixed positions".to_string(),
            },
        )
    }

    fn reference(&self, axes: BTreeSet<String>) -> MoveTask {
        let label = format!("{}.reference", self.inner.name);
        if let Err(e) = check_axes(&self.inner.name, &self.inner.axes, &axes) {
            return MoveTask::failed(label, e);
        }
        if self.inner.referenced.is_none() {
            return MoveTask::failed(
                label,
                MoveError::UnsupportedOperation {
                    actuator: self.inner.name.clone(),
                    details: "referencing is not supported".to_string(),
                },
            );
        }
        if axes.is_empty() {
            return MoveTask::completed(label);
        }
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .submit(label, move |ctx| async move { inner.do_reference(&ctx).await })
    }

    async fn stop(&self, _axes: Option<BTreeSet<String>>) {
        self.inner.executor.cancel_all();
        stop_with_timeout(
            self.inner.child.as_ref(),
            Some(self.inner.child_axes()),
            self.inner.stop_timeout,
        )
        .await;
    }
}

impl Drop for FixedPositionsActuator {
    fn drop(&mut self) {
        self.inner.executor.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimActuator, SimCall};
    use cryomove_types::position;

    fn wheel_motor(referenceable: bool) -> Arc<SimActuator> {
        Arc::new(
            SimActuator::builder("wheel_motor")
                .axis("rz", AxisDescriptor::range(-100.0, 100.0).with_unit("rad"))
                .referenceable(referenceable)
                .build()
                .unwrap(),
        )
    }

    fn quarters() -> Vec<Choice> {
        [0.0, 0.25, 0.5, 0.75].into_iter().map(Choice::new).collect()
    }

    fn wheel(child: &Arc<SimActuator>, positions: Vec<Choice>, cycle: Option<f64>) -> FixedPositionsActuator {
        FixedPositionsActuator::new(
            "filter_wheel",
            child.clone(),
            "rz",
            "band",
            positions,
            cycle,
            &Tolerances::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn cyclic_move_takes_shortest_direction() {
        let motor = wheel_motor(false);
        let fw = wheel(&motor, quarters(), Some(1.0));
        fw.init_task().wait().await.unwrap();
        assert!(motor.calls().is_empty());

        fw.move_abs(position([("band", 0.75)])).wait().await.unwrap();

        assert_eq!(motor.calls(), vec![SimCall::MoveRel(position([("rz", -0.25)]))]);
        assert_eq!(fw.position().get(), position([("band", 0.75)]));
    }

    #[tokio::test]
    async fn full_forward_cycle_forces_rereference() {
        let motor = wheel_motor(true);
        let fw = wheel(&motor, quarters(), Some(1.0));
        fw.init_task().wait().await.unwrap();
        assert_eq!(motor.calls(), vec![SimCall::Reference(BTreeSet::from(["rz".to_string()]))]);
        motor.clear_calls();

        for target in [0.25, 0.5, 0.75] {
            fw.move_abs(position([("band", target)])).wait().await.unwrap();
        }
        assert_eq!(motor.move_count(), 3);
        motor.clear_calls();

        fw.move_abs(position([("band", 0.0)])).wait().await.unwrap();
        assert_eq!(
            motor.calls(),
            vec![
                SimCall::MoveRel(position([("rz", 0.5)])),
                SimCall::Reference(BTreeSet::from(["rz".to_string()])),
                SimCall::MoveRel(position([("rz", 0.0)])),
            ]
        );
        assert_eq!(fw.position().get(), position([("band", 0.0)]));
    }

    #[tokio::test]
    async fn relative_moves_are_unsupported() {
        let motor = wheel_motor(false);
        let fw = wheel(&motor, quarters(), Some(1.0));
        let err = fw.move_rel(position([("band", 0.25)])).wait().await.unwrap_err();
        assert!(matches!(err, MoveError::UnsupportedOperation { .. }));
    }

    #[tokio::test]
    async fn readout_snaps_to_nearest_labelled_position() {
        let motor = wheel_motor(false);
        let fw = wheel(
            &motor,
            vec![Choice::labelled(0.0, "open"), Choice::labelled(1e-3, "closed")],
            None,
        );
        fw.init_task().wait().await.unwrap();
        assert_eq!(fw.position_label().as_deref(), Some("open"));

        motor.force_position(position([("rz", 1.02e-3)]));
        assert_eq!(fw.position().get(), position([("band", 1e-3)]));
        assert_eq!(fw.position_label().as_deref(), Some("closed"));
    }

    #[tokio::test]
    async fn cyclic_readout_snaps_across_the_wrap() {
        let motor = wheel_motor(false);
        let fw = wheel(&motor, quarters(), Some(1.0));
        fw.init_task().wait().await.unwrap();

        motor.force_position(position([("rz", 0.97)]));
        assert_eq!(fw.position().get(), position([("band", 0.0)]));
    }

    #[tokio::test]
    async fn non_cyclic_move_is_direct_and_validated() {
        let motor = wheel_motor(false);
        let fw = wheel(&motor, vec![Choice::new(0.0), Choice::new(2.0)], None);
        fw.init_task().wait().await.unwrap();
        motor.clear_calls();

        fw.move_abs(position([("band", 2.0)])).wait().await.unwrap();
        assert_eq!(motor.calls(), vec![SimCall::MoveAbs(position([("rz", 2.0)]))]);

        let err = fw.move_abs(position([("band", 1.0)])).wait().await.unwrap_err();
        assert!(matches!(err, MoveError::OutOfRange { .. }));
    }

    #[tokio::test]
    async fn off_grid_start_is_corrected_at_init() {
        let motor = wheel_motor(false);
        motor.force_position(position([("rz", 0.26)]));
        let fw = wheel(&motor, quarters(), Some(1.0));
        fw.init_task().wait().await.unwrap();
        let calls = motor.calls();
        assert_eq!(calls.len(), 1);
        let SimCall::MoveRel(shift) = &calls[0] else {
            panic!("unexpected {calls:?}");
        };
        assert!((shift["rz"] + 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_init_reference_sets_error_state() {
        let motor = wheel_motor(true);
        motor.fail_with(Some(MoveError::HardwareFault {
            component: "wheel_motor".into(),
            details: "switch not found".into(),
        }));
        let fw = wheel(&motor, quarters(), Some(1.0));
        assert!(fw.init_task().wait().await.is_err());
        assert!(matches!(fw.state().get(), ComponentState::Error(_)));
    }

    #[tokio::test]
    async fn invalid_position_sets_are_rejected() {
        let motor = wheel_motor(false);
        let mk = |positions: Vec<Choice>, cycle: Option<f64>| {
            FixedPositionsActuator::new("fw", motor.clone(), "rz", "band", positions, cycle, &Tolerances::default())
        };
        assert!(mk(vec![], None).is_err());
        assert!(mk(vec![Choice::new(1.0)], Some(1.0)).is_err());
        assert!(mk(vec![Choice::new(0.5)], Some(-1.0)).is_err());
        assert!(matches!(
            FixedPositionsActuator::new("fw", motor.clone(), "q", "band", quarters(), None, &Tolerances::default()),
            Err(MoveError::InvalidConfiguration(_))
        ));
    }
}

//! In-process simulated actuator for testing without physical hardware.
//!
//! [`SimActuator`] implements the full [`Actuator`] contract in memory: range
//! checks, referencing, speed, an optional per-move delay, and a call log so
//! tests can assert exactly which commands reached the "hardware".  Moves can
//! be held back on a [`Semaphore`] gate (one permit per move) and failures can
//! be injected, which makes cancellation and timeout scenarios deterministic.
//!
//! # Example
//!
//! ```rust,no_run
//! use cryomove_hal::actuator::Actuator;
//! use cryomove_hal::sim::SimActuator;
//! use cryomove_types::{position, AxisDescriptor};
//!
//! # async fn demo() -> Result<(), cryomove_types::MoveError> {
//! let focus = SimActuator::builder("focus")
//!     .axis("z", AxisDescriptor::range(-5e-3, 5e-3).with_unit("m"))
//!     .build()?;
//!
//! focus.move_abs(position([("z", 1e-3)])).wait().await?;
//! assert_eq!(focus.position().get()["z"], 1e-3);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use cryomove_types::{AxisDescriptor, AxisKind, Metadata, MoveError, Position, Referenced, Speed};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::actuator::{Actuator, check_axes, check_move_abs, check_move_rel};
use crate::observable::{Observable, ObservableView};
use crate::task::{MoveTask, SerialExecutor};

/// One command received by a [`SimActuator`], recorded when it is accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum SimCall {
    MoveAbs(Position),
    MoveRel(Position),
    Reference(BTreeSet<String>),
    Stop(Option<BTreeSet<String>>),
}

// ────────────────────────────────────────────────────────────────────────────
// Builder
// ────────────────────────────────────────────────────────────────────────────

pub struct SimActuatorBuilder {
    name: String,
    axes: BTreeMap<String, AxisDescriptor>,
    position: Position,
    referenceable: bool,
    referenced: bool,
    metadata: Metadata,
    gate: Option<Arc<Semaphore>>,
    delay: Duration,
}

impl SimActuatorBuilder {
    pub fn axis(mut self, name: impl Into<String>, desc: AxisDescriptor) -> Self {
        self.axes.insert(name.into(), desc);
        self
    }

    /// Initial position; axes not given start at their home value.
    pub fn position(mut self, pos: Position) -> Self {
        self.position.extend(pos);
        self
    }

    /// Expose a `referenced` observable (every axis starts unreferenced).
    pub fn referenceable(mut self, yes: bool) -> Self {
        self.referenceable = yes;
        self
    }

    /// Expose a `referenced` observable with every axis already referenced.
    pub fn referenced(mut self) -> Self {
        self.referenceable = true;
        self.referenced = true;
        self
    }

    pub fn metadata(mut self, md: Metadata) -> Self {
        self.metadata = md;
        self
    }

    /// Each move waits for (and consumes) one permit of `gate`.
    pub fn gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// # Errors
    ///
    /// [`MoveError::InvalidConfiguration`] if there are no axes, if the
    /// initial position does not fit them, or if no async runtime is running.
    pub fn build(self) -> Result<SimActuator, MoveError> {
        if self.axes.is_empty() {
            return Err(MoveError::InvalidConfiguration(format!(
                "{}: a simulated actuator needs at least one axis",
                self.name
            )));
        }
        check_move_abs(&self.name, &self.axes, &self.position).map_err(|e| {
            MoveError::InvalidConfiguration(format!("{}: bad initial position: {e}", self.name))
        })?;

        let mut position: Position = self
            .axes
            .iter()
            .map(|(a, d)| (a.clone(), home_value(d)))
            .collect();
        position.extend(self.position);

        let referenced = self.referenceable.then(|| {
            Observable::new(
                self.axes
                    .keys()
                    .map(|a| (a.clone(), self.referenced))
                    .collect::<Referenced>(),
            )
        });
        let speed: Speed = self
            .axes
            .iter()
            .filter(|(_, d)| d.is_continuous())
            .map(|(a, _)| (a.clone(), 1.0))
            .collect();

        let executor = SerialExecutor::new(self.name.clone())?;
        Ok(SimActuator {
            inner: Arc::new(SimInner {
                name: self.name,
                axes: self.axes,
                position: Observable::new(position),
                referenced,
                speed: Observable::new(speed),
                metadata: RwLock::new(self.metadata),
                calls: Mutex::new(Vec::new()),
                failure: Mutex::new(None),
                gate: self.gate,
                delay: self.delay,
                executor,
            }),
        })
    }
}

/// Value an axis takes after referencing: 0 clamped into the range, or the
/// first choice of a discrete axis.
fn home_value(desc: &AxisDescriptor) -> f64 {
    match &desc.kind {
        AxisKind::Range { min, max } => 0.0_f64.clamp(*min, *max),
        AxisKind::Choices { choices } => choices.first().map(|c| c.value).unwrap_or(0.0),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimActuator
// ────────────────────────────────────────────────────────────────────────────

struct SimInner {
    name: String,
    axes: BTreeMap<String, AxisDescriptor>,
    position: Observable<Position>,
    referenced: Option<Observable<Referenced>>,
    speed: Observable<Speed>,
    metadata: RwLock<Metadata>,
    calls: Mutex<Vec<SimCall>>,
    failure: Mutex<Option<MoveError>>,
    gate: Option<Arc<Semaphore>>,
    delay: Duration,
    executor: SerialExecutor,
}

enum Target {
    Abs(Position),
    Rel(Position),
}

impl SimInner {
    fn record(&self, call: SimCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }

    fn injected_failure(&self) -> Option<MoveError> {
        self.failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn perform(&self, target: Target) -> Result<(), MoveError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| MoveError::HardwareFault {
                    component: self.name.clone(),
                    details: "motion gate closed".to_string(),
                })?
                .forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.injected_failure() {
            return Err(err);
        }

        let new_pos = match target {
            Target::Abs(pos) => pos,
            Target::Rel(shift) => {
                let current = self.position.get();
                let pos: Position = shift
                    .iter()
                    .map(|(a, d)| (a.clone(), current.get(a).copied().unwrap_or(0.0) + d))
                    .collect();
                check_move_abs(&self.name, &self.axes, &pos)?;
                pos
            }
        };
        debug!(actuator = %self.name, ?new_pos, "simulated move done");
        self.position.update(|p| p.extend(new_pos));
        Ok(())
    }

    async fn perform_reference(&self, axes: BTreeSet<String>) -> Result<(), MoveError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.injected_failure() {
            return Err(err);
        }
        let homed: Position = axes
            .iter()
            .filter_map(|a| self.axes.get(a).map(|d| (a.clone(), home_value(d))))
            .collect();
        self.position.update(|p| p.extend(homed));
        if let Some(referenced) = &self.referenced {
            referenced.update(|r| {
                for a in &axes {
                    r.insert(a.clone(), true);
                }
            });
        }
        Ok(())
    }
}

/// Simulated multi-axis actuator. See the [module docs](self).
pub struct SimActuator {
    inner: Arc<SimInner>,
}

impl SimActuator {
    pub fn builder(name: impl Into<String>) -> SimActuatorBuilder {
        SimActuatorBuilder {
            name: name.into(),
            axes: BTreeMap::new(),
            position: Position::new(),
            referenceable: false,
            referenced: false,
            metadata: Metadata::default(),
            gate: None,
            delay: Duration::ZERO,
        }
    }

    /// Every accepted command, in order.
    pub fn calls(&self) -> Vec<SimCall> {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of accepted `move_abs` / `move_rel` commands.
    pub fn move_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, SimCall::MoveAbs(_) | SimCall::MoveRel(_)))
            .count()
    }

    pub fn clear_calls(&self) {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Make every following move and reference fail with `err` (`None`
    /// restores normal operation).
    pub fn fail_with(&self, err: Option<MoveError>) {
        *self.inner.failure.lock().unwrap_or_else(|e| e.into_inner()) = err;
    }

    /// Change the position as if the hardware had been moved by hand.
    pub fn force_position(&self, pos: Position) {
        self.inner.position.update(|p| p.extend(pos));
    }
}

#[async_trait]
impl Actuator for SimActuator {
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

    fn speed(&self) -> Option<ObservableView<Speed>> {
        Some(self.inner.speed.view())
    }

    fn set_speed(&self, speed: &Speed) -> Result<(), MoveError> {
        check_axes(&self.inner.name, &self.inner.axes, speed.keys())?;
        if let Some((axis, value)) = speed.iter().find(|(_, v)| !(v.is_finite() && **v > 0.0)) {
            return Err(MoveError::OutOfRange {
                actuator: self.inner.name.clone(),
                axis: axis.clone(),
                value: *value,
            });
        }
        self.inner.speed.update(|s| s.extend(speed.clone()));
        Ok(())
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
        if let Err(e) = check_move_abs(&self.inner.name, &self.inner.axes, &pos) {
            return MoveTask::failed(label, e);
        }
        self.inner.record(SimCall::MoveAbs(pos.clone()));
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .submit(label, move |_ctx| async move { inner.perform(Target::Abs(pos)).await })
    }

    fn move_rel(&self, shift: Position) -> MoveTask {
        let label = format!("{}.move_rel", self.inner.name);
        if shift.is_empty() {
            return MoveTask::completed(label);
        }
        if let Err(e) = check_move_rel(&self.inner.name, &self.inner.axes, &shift) {
            return MoveTask::failed(label, e);
        }
        self.inner.record(SimCall::MoveRel(shift.clone()));
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .submit(label, move |_ctx| async move { inner.perform(Target::Rel(shift)).await })
    }

    fn reference(&self, axes: BTreeSet<String>) -> MoveTask {
        let label = format!("{}.reference", self.inner.name);
        if self.inner.referenced.is_none() {
            return MoveTask::failed(
                label,
                MoveError::UnsupportedOperation {
                    actuator: self.inner.name.clone(),
                    details: "referencing is not supported".to_string(),
                },
            );
        }
        if let Err(e) = check_axes(&self.inner.name, &self.inner.axes, &axes) {
            return MoveTask::failed(label, e);
        }
        if axes.is_empty() {
            return MoveTask::completed(label);
        }
        self.inner.record(SimCall::Reference(axes.clone()));
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .submit(label, move |_ctx| async move { inner.perform_reference(axes).await })
    }

    async fn stop(&self, axes: Option<BTreeSet<String>>) {
        self.inner.record(SimCall::Stop(axes));
        self.inner.executor.cancel_all();
    }
}

impl Drop for SimActuator {
    fn drop(&mut self) {
        self.inner.executor.shutdown();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

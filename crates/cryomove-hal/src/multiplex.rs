//! [`MultiplexActuator`] – several child actuators presented as one.
//!
//! Each exposed axis is delegated to one `(child, child_axis)` pair.  The
//! multiplexer mirrors the children's position, referenced and speed values
//! onto its own axes, and splits every move by owning child: one call per
//! distinct child, all dispatched before any is awaited.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use cryomove_types::{AxisDescriptor, Metadata, MoveError, Position, Referenced, Speed, Tolerances};
use futures_util::future::join_all;
use tracing::{debug, error, warn};

use crate::actuator::{
    Actuator, ComponentState, check_axes, check_move_abs, check_move_rel, stop_with_timeout,
};
use crate::observable::{Observable, ObservableView, Subscription};
use crate::task::{MoveTask, SerialExecutor, TaskContext};

/// One distinct child and the axes it serves, as `(own_axis, child_axis)`.
struct ChildGroup {
    child: Arc<dyn Actuator>,
    axes: Vec<(String, String)>,
}

impl ChildGroup {
    fn child_axis(&self, axis: &str) -> Option<&str> {
        self.axes
            .iter()
            .find(|(a, _)| a == axis)
            .map(|(_, ca)| ca.as_str())
    }
}

fn same_actuator(a: &Arc<dyn Actuator>, b: &Arc<dyn Actuator>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Copy the mapped values of `child` onto `own`.
fn project<V: Copy>(own: &mut BTreeMap<String, V>, child: &BTreeMap<String, V>, axes: &[(String, String)]) {
    for (axis, child_axis) in axes {
        if let Some(v) = child.get(child_axis) {
            own.insert(axis.clone(), *v);
        }
    }
}

#[derive(Clone, Copy)]
enum Op {
    Abs,
    Rel,
}

struct MuxInner {
    name: String,
    axes: BTreeMap<String, AxisDescriptor>,
    groups: Vec<ChildGroup>,
    position: Observable<Position>,
    referenced: Option<Observable<Referenced>>,
    speed: Option<Observable<Speed>>,
    state: Observable<ComponentState>,
    metadata: RwLock<Metadata>,
    executor: SerialExecutor,
    stop_timeout: Duration,
}

impl MuxInner {
    fn group_of(&self, axis: &str) -> Option<usize> {
        self.groups
            .iter()
            .position(|g| g.axes.iter().any(|(a, _)| a == axis))
    }

    /// Split `pos` into one child-frame position per owning child.
    fn split(&self, pos: &Position) -> Vec<(Arc<dyn Actuator>, Position)> {
        let mut parts: BTreeMap<usize, Position> = BTreeMap::new();
        for (axis, value) in pos {
            if let Some(i) = self.group_of(axis) {
                if let Some(ca) = self.groups[i].child_axis(axis) {
                    parts.entry(i).or_default().insert(ca.to_string(), *value);
                }
            }
        }
        parts
            .into_iter()
            .map(|(i, p)| (Arc::clone(&self.groups[i].child), p))
            .collect()
    }

    fn split_axes(&self, axes: &BTreeSet<String>) -> Vec<(Arc<dyn Actuator>, BTreeSet<String>)> {
        let mut parts: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
        for axis in axes {
            if let Some(i) = self.group_of(axis) {
                if let Some(ca) = self.groups[i].child_axis(axis) {
                    parts.entry(i).or_default().insert(ca.to_string());
                }
            }
        }
        parts
            .into_iter()
            .map(|(i, a)| (Arc::clone(&self.groups[i].child), a))
            .collect()
    }

    async fn do_move(&self, ctx: &TaskContext, pos: Position, op: Op) -> Result<(), MoveError> {
        fan_out(ctx, self.split(&pos), |(child, child_pos)| {
            debug!(actuator = %self.name, child = %child.name(), ?child_pos, "dispatching child move");
            match op {
                Op::Abs => child.move_abs(child_pos),
                Op::Rel => child.move_rel(child_pos),
            }
        })
        .await
    }

    async fn do_reference(&self, ctx: &TaskContext, axes: BTreeSet<String>) -> Result<(), MoveError> {
        fan_out(ctx, self.split_axes(&axes), |(child, child_axes)| {
            child.reference(child_axes)
        })
        .await
    }

    async fn stop_children(&self, axes: Option<&BTreeSet<String>>) {
        let targets: Vec<(Arc<dyn Actuator>, BTreeSet<String>)> = match axes {
            Some(axes) => self.split_axes(axes),
            None => self
                .groups
                .iter()
                .map(|g| {
                    (
                        Arc::clone(&g.child),
                        g.axes.iter().map(|(_, ca)| ca.clone()).collect(),
                    )
                })
                .collect(),
        };
        let limit = self.stop_timeout;
        join_all(
            targets
                .iter()
                .map(|(child, child_axes)| stop_with_timeout(child.as_ref(), Some(child_axes.clone()), limit)),
        )
        .await;
    }
}

/// Start one sub-task per item, then await every sub-task that was started.
///
/// If the owner is cancelled part way through, the remaining items are not
/// started and `Cancelled` is returned once the started ones have finished.
async fn fan_out<T>(
    ctx: &TaskContext,
    items: impl IntoIterator<Item = T>,
    mut start: impl FnMut(T) -> MoveTask,
) -> Result<(), MoveError> {
    let mut subs = Vec::new();
    let mut interrupted = None;
    for item in items {
        match ctx.dispatch(|| start(item)) {
            Ok(sub) => subs.push(sub),
            Err(e) => {
                interrupted = Some(e);
                break;
            }
        }
    }
    let result = await_all(ctx, &subs).await;
    interrupted.map_or(result, Err)
}

/// Await every sub-task, returning the first failure once all have finished.
async fn await_all(ctx: &TaskContext, subs: &[MoveTask]) -> Result<(), MoveError> {
    let mut first_err = None;
    for sub in subs {
        if let Err(e) = ctx.wait(sub).await {
            if first_err.is_none() {
                first_err = Some(e);
            } else {
                debug!(task = %sub.label(), error = %e, "suppressed sibling failure");
            }
        }
    }
    first_err.map_or(Ok(()), Err)
}

/// Axis multiplexer. See the [module docs](self).
pub struct MultiplexActuator {
    inner: Arc<MuxInner>,
    init_task: Option<MoveTask>,
    _subscriptions: Vec<Subscription>,
}

impl MultiplexActuator {
    /// Build a multiplexer.
    ///
    /// * `children` – own axis name → child actuator.
    /// * `axes_map` – own axis name → axis name on that child.  Must have
    ///   exactly the keys of `children`.
    /// * `ref_on_init` – axes to reference now if not already referenced.  A
    ///   failure there puts the component in [`ComponentState::Error`] and
    ///   stops the affected children; it does not fail construction.
    ///
    /// # Errors
    ///
    /// [`MoveError::InvalidConfiguration`] for an empty or inconsistent
    /// mapping, a child missing the mapped axis, or a `ref_on_init` axis that
    /// cannot be referenced.
    pub fn new(
        name: impl Into<String>,
        children: BTreeMap<String, Arc<dyn Actuator>>,
        axes_map: BTreeMap<String, String>,
        ref_on_init: BTreeSet<String>,
        tolerances: &Tolerances,
    ) -> Result<Self, MoveError> {
        let name = name.into();
        let bad = |msg: String| MoveError::InvalidConfiguration(format!("{name}: {msg}"));

        if children.is_empty() {
            return Err(bad("at least one child is required".into()));
        }
        let child_keys: BTreeSet<&String> = children.keys().collect();
        let map_keys: BTreeSet<&String> = axes_map.keys().collect();
        if child_keys != map_keys {
            return Err(bad("children and axes_map must have the same keys".into()));
        }

        let mut axes = BTreeMap::new();
        let mut groups: Vec<ChildGroup> = Vec::new();
        for (axis, child) in &children {
            let child_axis = &axes_map[axis];
            let desc = child.axes().get(child_axis).ok_or_else(|| {
                bad(format!("child {} has no axis '{child_axis}'", child.name()))
            })?;
            axes.insert(axis.clone(), desc.clone());
            match groups.iter_mut().find(|g| same_actuator(&g.child, child)) {
                Some(g) => g.axes.push((axis.clone(), child_axis.clone())),
                None => groups.push(ChildGroup {
                    child: Arc::clone(child),
                    axes: vec![(axis.clone(), child_axis.clone())],
                }),
            }
        }
        for axis in &ref_on_init {
            match children.get(axis) {
                Some(child) if child.has_referenced() => {}
                Some(_) => return Err(bad(format!("axis '{axis}' cannot be referenced"))),
                None => return Err(bad(format!("ref_on_init axis '{axis}' is unknown"))),
            }
        }

        // Initial values and child subscriptions.
        let mut position = Position::new();
        let mut referenced: Option<Referenced> = None;
        let mut speed: Option<Speed> = None;
        for g in &groups {
            project(&mut position, &g.child.position().get(), &g.axes);
            if let Some(r) = g.child.referenced() {
                project(referenced.get_or_insert_with(Referenced::new), &r.get(), &g.axes);
            }
            if let Some(s) = g.child.speed() {
                project(speed.get_or_insert_with(Speed::new), &s.get(), &g.axes);
            }
        }
        let position = Observable::new(position);
        let referenced = referenced.map(Observable::new);
        let speed = speed.map(Observable::new);

        let mut subscriptions = Vec::new();
        for g in &groups {
            let own = position.clone();
            let map = g.axes.clone();
            subscriptions.push(
                g.child
                    .position()
                    .subscribe(move |p| own.update(|v| project(v, p, &map))),
            );
            if let (Some(child_ref), Some(own)) = (g.child.referenced(), referenced.clone()) {
                let map = g.axes.clone();
                subscriptions.push(child_ref.subscribe(move |r| own.update(|v| project(v, r, &map))));
            }
            if let (Some(child_speed), Some(own)) = (g.child.speed(), speed.clone()) {
                let map = g.axes.clone();
                subscriptions.push(child_speed.subscribe(move |s| own.update(|v| project(v, s, &map))));
            }
        }

        let executor = SerialExecutor::new(name.clone())?;
        let inner = Arc::new(MuxInner {
            name,
            axes,
            groups,
            position,
            referenced,
            speed,
            state: Observable::new(ComponentState::Running),
            metadata: RwLock::new(Metadata::default()),
            executor,
            stop_timeout: tolerances.stop_timeout(),
        });

        let to_reference: BTreeSet<String> = match &inner.referenced {
            Some(r) => {
                let current = r.get();
                ref_on_init
                    .into_iter()
                    .filter(|a| !current.get(a).copied().unwrap_or(false))
                    .collect()
            }
            None => BTreeSet::new(),
        };
        let init_task = (!to_reference.is_empty()).then(|| {
            let job_inner = Arc::clone(&inner);
            inner.executor.submit(
                format!("{}.reference_on_init", inner.name),
                move |ctx| async move {
                    let result = job_inner.do_reference(&ctx, to_reference.clone()).await;
                    if let Err(e) = &result {
                        error!(actuator = %job_inner.name, error = %e, "referencing at init failed");
                        job_inner.state.set(ComponentState::Error(e.clone()));
                        job_inner.stop_children(Some(&to_reference)).await;
                    }
                    result
                },
            )
        });

        Ok(Self {
            inner,
            init_task,
            _subscriptions: subscriptions,
        })
    }

    /// The reference-on-init task, if one was started.
    pub fn init_task(&self) -> Option<&MoveTask> {
        self.init_task.as_ref()
    }

    pub fn state(&self) -> ObservableView<ComponentState> {
        self.inner.state.view()
    }

    /// Stop everything and refuse further moves.
    pub async fn terminate(&self) {
        self.stop(None).await;
        self.inner.executor.shutdown();
    }
}

#[async_trait]
impl Actuator for MultiplexActuator {
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
        self.inner.speed.as_ref().map(Observable::view)
    }

    fn set_speed(&self, speed: &Speed) -> Result<(), MoveError> {
        check_axes(&self.inner.name, &self.inner.axes, speed.keys())?;
        for (child, child_speed) in self.inner.split(speed) {
            child.set_speed(&child_speed)?;
        }
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
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .submit(label, move |ctx| async move { inner.do_move(&ctx, pos, Op::Abs).await })
    }

    fn move_rel(&self, shift: Position) -> MoveTask {
        let label = format!("{}.move_rel", self.inner.name);
        if shift.is_empty() {
            return MoveTask::completed(label);
        }
        if let Err(e) = check_move_rel(&self.inner.name, &self.inner.axes, &shift) {
            return MoveTask::failed(label, e);
        }
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .submit(label, move |ctx| async move { inner.do_move(&ctx, shift, Op::Rel).await })
    }

    fn reference(&self, axes: BTreeSet<String>) -> MoveTask {
        let label = format!("{}.reference", self.inner.name);
        if let Err(e) = check_axes(&self.inner.name, &self.inner.axes, &axes) {
            return MoveTask::failed(label, e);
        }
        if let Some(axis) = axes.iter().find(|a| {
            self.inner
                .group_of(a)
                .is_none_or(|i| !self.inner.groups[i].child.has_referenced())
        }) {
            return MoveTask::failed(
                label,
                MoveError::UnsupportedOperation {
                    actuator: self.inner.name.clone(),
                    details: format!("axis '{axis}' cannot be referenced"),
                },
            );
        }
        if axes.is_empty() {
            return MoveTask::completed(label);
        }
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .submit(label, move |ctx| async move { inner.do_reference(&ctx, axes).await })
    }

    async fn stop(&self, axes: Option<BTreeSet<String>>) {
        self.inner.executor.cancel_all();
        if let Some(axes) = &axes {
            if let Err(e) = check_axes(&self.inner.name, &self.inner.axes, axes) {
                warn!(actuator = %self.inner.name, error = %e, "stopping with unknown axes");
            }
        }
        self.inner.stop_children(axes.as_ref()).await;
    }
}

impl Drop for MultiplexActuator {
    fn drop(&mut self) {
        self.inner.executor.shutdown();
    }
}

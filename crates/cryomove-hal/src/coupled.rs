//! [`CoupledStage`] – a master stage whose every move is mirrored on a slave
//! stage through a [`ConvertStage`] built from correction metadata.
//!
//! After each master move the slave is sent to the master's *resulting*
//! position, whether the master move succeeded or not, so a partial failure
//! never leaves the two stages silently misaligned.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use cryomove_types::{
    AxisDescriptor, Metadata, MoveError, Position, Referenced, Tolerances, filter_position,
};
use futures_util::future::join;
use tracing::{debug, warn};

use crate::actuator::{Actuator, check_axes, check_move_abs, check_move_rel, stop_with_timeout};
use crate::convert::ConvertStage;
use crate::observable::{Observable, ObservableView, Subscription};
use crate::task::{MoveTask, SerialExecutor, TaskContext};

const XY: [&str; 2] = ["x", "y"];

fn build_converter(name: &str, slave: &Arc<dyn Actuator>, md: &Metadata) -> Result<ConvertStage, MoveError> {
    ConvertStage::new(
        format!("{name}.slave_conv"),
        Arc::clone(slave),
        XY,
        md.rotation_cor.unwrap_or(0.0),
        md.pixel_size_cor.unwrap_or((1.0, 1.0)),
        md.pos_cor.unwrap_or((0.0, 0.0)),
    )
}

/// `x`/`y` referenced only if every referenceable child says so.
fn combine_referenced(views: &[ObservableView<Referenced>]) -> Referenced {
    XY.iter()
        .map(|a| {
            let all = views
                .iter()
                .all(|v| v.get().get(*a).copied().unwrap_or(false));
            (a.to_string(), all)
        })
        .collect()
}

#[derive(Clone, Copy)]
enum Op {
    Abs,
    Rel,
}

struct CoupledInner {
    name: String,
    master: Arc<dyn Actuator>,
    slave: Arc<dyn Actuator>,
    axes: BTreeMap<String, AxisDescriptor>,
    position: Observable<Position>,
    referenced: Option<Observable<Referenced>>,
    converter: RwLock<Arc<ConvertStage>>,
    metadata: RwLock<Metadata>,
    executor: SerialExecutor,
    stop_timeout: Duration,
}

impl CoupledInner {
    fn converter(&self) -> Arc<ConvertStage> {
        Arc::clone(&self.converter.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Send the slave to the master's current position, then publish that
    /// position as the stage's own.
    async fn sync_slave(&self, ctx: &TaskContext) -> Result<(), MoveError> {
        let target = filter_position(&self.master.position().get(), &XY);
        debug!(stage = %self.name, ?target, "resynchronising slave");
        let sub = ctx.attach(self.converter().move_abs(target.clone()));
        let result = ctx.wait(&sub).await;
        if let Err(e) = &result {
            warn!(stage = %self.name, error = %e, "slave resynchronisation failed");
        }
        self.position.set(target);
        result
    }

    async fn do_move(&self, ctx: &TaskContext, pos: Position, op: Op) -> Result<(), MoveError> {
        let master_result = match ctx.dispatch(|| match op {
            Op::Abs => self.master.move_abs(pos),
            Op::Rel => self.master.move_rel(pos),
        }) {
            Ok(sub) => ctx.wait(&sub).await,
            Err(e) => Err(e),
        };
        let sync_result = self.sync_slave(ctx).await;
        master_result.and(sync_result)
    }

    /// Reference, on every child that supports it, the requested axes that
    /// child reports as referenceable.
    async fn do_reference(&self, ctx: &TaskContext, axes: BTreeSet<String>) -> Result<(), MoveError> {
        let mut subs = Vec::new();
        let mut ref_result = Ok(());
        for child in [&self.master, &self.slave] {
            let Some(referenced) = child.referenced() else {
                continue;
            };
            let known = referenced.get();
            let child_axes: BTreeSet<String> =
                axes.iter().filter(|a| known.contains_key(*a)).cloned().collect();
            if child_axes.is_empty() {
                continue;
            }
            match ctx.dispatch(|| child.reference(child_axes)) {
                Ok(sub) => subs.push(sub),
                Err(e) => {
                    ref_result = Err(e);
                    break;
                }
            }
        }
        for sub in &subs {
            let r = ctx.wait(sub).await;
            if ref_result.is_ok() {
                ref_result = r;
            }
        }
        let sync_result = self.sync_slave(ctx).await;
        ref_result.and(sync_result)
    }
}

/// Master/slave stage pair. See the [module docs](self).
pub struct CoupledStage {
    inner: Arc<CoupledInner>,
    _subscriptions: Vec<Subscription>,
}

impl CoupledStage {
    /// Couple `master` and `slave`.  Both must expose `x` and `y`.  The slave
    /// frame conversion uses the `pixel_size_cor`, `rotation_cor` and
    /// `pos_cor` keys of `metadata` (identity when absent).
    ///
    /// # Errors
    ///
    /// [`MoveError::InvalidConfiguration`] if a child lacks `x`/`y` or the
    /// correction parameters are invalid.
    pub fn new(
        name: impl Into<String>,
        master: Arc<dyn Actuator>,
        slave: Arc<dyn Actuator>,
        metadata: Metadata,
        tolerances: &Tolerances,
    ) -> Result<Self, MoveError> {
        let name = name.into();
        for (role, child) in [("master", &master), ("slave", &slave)] {
            if let Some(axis) = XY.iter().find(|a| !child.has_axis(a)) {
                return Err(MoveError::InvalidConfiguration(format!(
                    "{name}: {role} {} has no axis '{axis}'",
                    child.name()
                )));
            }
        }

        let axes: BTreeMap<String, AxisDescriptor> = XY
            .iter()
            .filter_map(|a| master.axes().get(*a).map(|d| (a.to_string(), d.clone())))
            .collect();
        let converter = build_converter(&name, &slave, &metadata)?;

        // Republished by `sync_slave` only, once the slave has followed.
        let position = Observable::new(filter_position(&master.position().get(), &XY));
        let mut subscriptions = Vec::new();

        let ref_views: Vec<ObservableView<Referenced>> =
            [&master, &slave].iter().filter_map(|c| c.referenced()).collect();
        let referenced = (!ref_views.is_empty()).then(|| Observable::new(combine_referenced(&ref_views)));
        if let Some(own) = &referenced {
            for view in &ref_views {
                let own = own.clone();
                let all = ref_views.clone();
                subscriptions.push(view.subscribe(move |_| own.set(combine_referenced(&all))));
            }
        }

        let executor = SerialExecutor::new(name.clone())?;
        Ok(Self {
            inner: Arc::new(CoupledInner {
                name,
                master,
                slave,
                axes,
                position,
                referenced,
                converter: RwLock::new(Arc::new(converter)),
                metadata: RwLock::new(metadata),
                executor,
                stop_timeout: tolerances.stop_timeout(),
            }),
            _subscriptions: subscriptions,
        })
    }

    /// The conversion currently used to drive the slave.
    pub fn converter(&self) -> Arc<ConvertStage> {
        self.inner.converter()
    }

    pub async fn terminate(&self) {
        self.stop(None).await;
        self.inner.executor.shutdown();
    }
}

#[async_trait]
impl Actuator for CoupledStage {
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

    /// Merge `md`; when it carries correction keys, the slave conversion is
    /// rebuilt.  Callers typically follow with an empty `move_rel` to bring
    /// the slave in line with the new conversion.
    fn update_metadata(&self, md: Metadata) -> Result<(), MoveError> {
        let rebuild = md.has_correction();
        let merged = {
            let mut current = self.inner.metadata.write().unwrap_or_else(|e| e.into_inner());
            current.merge(md);
            current.clone()
        };
        if rebuild {
            let conv = build_converter(&self.inner.name, &self.inner.slave, &merged)?;
            *self.inner.converter.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(conv);
            debug!(stage = %self.inner.name, "slave conversion rebuilt");
        }
        Ok(())
    }

    /// An empty target re-sends the master to where it is, which
    /// resynchronises the slave.
    fn move_abs(&self, pos: Position) -> MoveTask {
        let label = format!("{}.move_abs", self.inner.name);
        let pos = if pos.is_empty() {
            self.inner.position.get()
        } else {
            pos
        };
        if let Err(e) = check_move_abs(&self.inner.name, &self.inner.axes, &pos) {
            return MoveTask::failed(label, e);
        }
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .submit(label, move |ctx| async move { inner.do_move(&ctx, pos, Op::Abs).await })
    }

    /// An empty shift becomes a null move that resynchronises the slave.
    fn move_rel(&self, shift: Position) -> MoveTask {
        let label = format!("{}.move_rel", self.inner.name);
        let shift = if shift.is_empty() {
            Position::from([("x".to_string(), 0.0), ("y".to_string(), 0.0)])
        } else {
            shift
        };
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
        if axes.is_empty() {
            return MoveTask::completed(label);
        }
        if let Err(e) = check_axes(&self.inner.name, &self.inner.axes, &axes) {
            return MoveTask::failed(label, e);
        }
        if self.inner.referenced.is_none() {
            return MoveTask::failed(
                label,
                MoveError::UnsupportedOperation {
                    actuator: self.inner.name.clone(),
                    details: "no child can be referenced".to_string(),
                },
            );
        }
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .submit(label, move |ctx| async move { inner.do_reference(&ctx, axes).await })
    }

    async fn stop(&self, axes: Option<BTreeSet<String>>) {
        self.inner.executor.cancel_all();
        let limit = self.inner.stop_timeout;
        join(
            stop_with_timeout(self.inner.master.as_ref(), axes.clone(), limit),
            stop_with_timeout(self.inner.slave.as_ref(), axes, limit),
        )
        .await;
    }
}

impl Drop for CoupledStage {
    fn drop(&mut self) {
        self.inner.executor.shutdown();
    }
}

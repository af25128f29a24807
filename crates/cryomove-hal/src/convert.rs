//! [`ConvertStage`] – a 2-axis child seen through a rotated, scaled and
//! translated coordinate frame.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use cryomove_types::{AxisDescriptor, Metadata, MoveError, Position};

use crate::actuator::{Actuator, check_axes, check_move_abs, check_move_rel};
use crate::observable::{Observable, ObservableView, Subscription};
use crate::task::MoveTask;

type Matrix = [[f64; 2]; 2];

fn apply(m: &Matrix, v: [f64; 2]) -> [f64; 2] {
    [
        m[0][0] * v[0] + m[0][1] * v[1],
        m[1][0] * v[0] + m[1][1] * v[1],
    ]
}

/// Affine map between an exposed frame and a child frame.
///
/// `to_child = diag(sx, sy) · R(rotation)` and `from_child` is its exact
/// inverse `R(-rotation) · diag(1/sx, 1/sy)`.  The translation is added before
/// converting an absolute position to the child frame, and removed after
/// converting back.  Relative shifts ignore it.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform2D {
    to_child: Matrix,
    from_child: Matrix,
    offset: [f64; 2],
}

impl Transform2D {
    /// # Errors
    ///
    /// [`MoveError::InvalidConfiguration`] if a scale factor is zero or any
    /// parameter is not finite.
    pub fn new(rotation: f64, scale: (f64, f64), translation: (f64, f64)) -> Result<Self, MoveError> {
        let (sx, sy) = scale;
        let all_finite = [rotation, sx, sy, translation.0, translation.1]
            .iter()
            .all(|v| v.is_finite());
        if !all_finite || sx == 0.0 || sy == 0.0 {
            return Err(MoveError::InvalidConfiguration(format!(
                "invalid frame conversion (rotation {rotation}, scale {scale:?}, translation {translation:?})"
            )));
        }
        let (sin, cos) = rotation.sin_cos();
        let (isin, icos) = (-rotation).sin_cos();
        Ok(Self {
            to_child: [[cos * sx, -sin * sx], [sin * sy, cos * sy]],
            from_child: [[icos / sx, -isin / sy], [isin / sx, icos / sy]],
            offset: [translation.0, translation.1],
        })
    }

    pub fn identity() -> Self {
        Self {
            to_child: [[1.0, 0.0], [0.0, 1.0]],
            from_child: [[1.0, 0.0], [0.0, 1.0]],
            offset: [0.0, 0.0],
        }
    }

    pub fn to_child_abs(&self, p: [f64; 2]) -> [f64; 2] {
        apply(&self.to_child, [p[0] + self.offset[0], p[1] + self.offset[1]])
    }

    pub fn to_child_rel(&self, shift: [f64; 2]) -> [f64; 2] {
        apply(&self.to_child, shift)
    }

    pub fn from_child_abs(&self, q: [f64; 2]) -> [f64; 2] {
        let p = apply(&self.from_child, q);
        [p[0] - self.offset[0], p[1] - self.offset[1]]
    }
}

const EXPOSED: [&str; 2] = ["x", "y"];

/// Bounding box, in the exposed frame, of the child's rectangular range.
/// `None` unless both child axes have a finite continuous range.
fn exposed_bounds(t: &Transform2D, child: [&AxisDescriptor; 2]) -> Option<[(f64, f64); 2]> {
    let (x0, x1) = child[0].bounds()?;
    let (y0, y1) = child[1].bounds()?;
    if ![x0, x1, y0, y1].iter().all(|v| v.is_finite()) {
        return None;
    }
    let corners = [[x0, y0], [x0, y1], [x1, y0], [x1, y1]].map(|q| t.from_child_abs(q));
    let span = |i: usize| {
        corners
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), c| (lo.min(c[i]), hi.max(c[i])))
    };
    Some([span(0), span(1)])
}

struct ConvInner {
    name: String,
    child: Arc<dyn Actuator>,
    child_axes: [String; 2],
    axes: BTreeMap<String, AxisDescriptor>,
    transform: Transform2D,
    position: Observable<Position>,
    metadata: RwLock<Metadata>,
}

impl ConvInner {
    fn read_child(child_axes: &[String; 2], pos: &Position) -> Option<[f64; 2]> {
        Some([*pos.get(&child_axes[0])?, *pos.get(&child_axes[1])?])
    }

    fn to_child_position(&self, v: [f64; 2]) -> Position {
        Position::from([
            (self.child_axes[0].clone(), v[0]),
            (self.child_axes[1].clone(), v[1]),
        ])
    }

    fn map_axes(&self, axes: &BTreeSet<String>) -> BTreeSet<String> {
        axes.iter()
            .filter_map(|a| EXPOSED.iter().position(|e| e == a))
            .map(|i| self.child_axes[i].clone())
            .collect()
    }
}

/// Coordinate-converting wrapper around one 2-axis child.
///
/// Exposes axes `x` and `y`.  Their ranges are the bounding box of the
/// child's range seen through the conversion; with a rotation that box is
/// larger than the reachable area, and the child still checks the converted
/// target.  Moves are converted and handed straight to the child, so the
/// returned task is the child's own task.
pub struct ConvertStage {
    inner: Arc<ConvInner>,
    _subscription: Subscription,
}

impl ConvertStage {
    /// * `child_axes` – the child's axes that play the role of `x` and `y`.
    ///
    /// # Errors
    ///
    /// [`MoveError::InvalidConfiguration`] if the child lacks one of
    /// `child_axes` or the transform parameters are invalid.
    pub fn new(
        name: impl Into<String>,
        child: Arc<dyn Actuator>,
        child_axes: [&str; 2],
        rotation: f64,
        scale: (f64, f64),
        translation: (f64, f64),
    ) -> Result<Self, MoveError> {
        let name = name.into();
        let transform = Transform2D::new(rotation, scale, translation)
            .map_err(|e| MoveError::InvalidConfiguration(format!("{name}: {e}")))?;

        let mut child_descs = Vec::with_capacity(2);
        for ca in child_axes {
            child_descs.push(child.axes().get(ca).ok_or_else(|| {
                MoveError::InvalidConfiguration(format!(
                    "{name}: child {} has no axis '{ca}'",
                    child.name()
                ))
            })?);
        }
        let ranges = exposed_bounds(&transform, [child_descs[0], child_descs[1]]);
        let mut axes = BTreeMap::new();
        for (i, (exposed, desc)) in EXPOSED.iter().zip(&child_descs).enumerate() {
            let (min, max) = ranges.map_or((f64::NEG_INFINITY, f64::INFINITY), |r| r[i]);
            let mut own = AxisDescriptor::range(min, max);
            own.unit = desc.unit.clone();
            axes.insert(exposed.to_string(), own);
        }
        let child_axes = [child_axes[0].to_string(), child_axes[1].to_string()];

        let initial = ConvInner::read_child(&child_axes, &child.position().get())
            .map(|q| transform.from_child_abs(q))
            .map(|p| Position::from([("x".to_string(), p[0]), ("y".to_string(), p[1])]))
            .unwrap_or_default();
        let position = Observable::new(initial);

        let own = position.clone();
        let sub_axes = child_axes.clone();
        let sub_transform = transform.clone();
        let subscription = child.position().subscribe(move |q| {
            if let Some(q) = ConvInner::read_child(&sub_axes, q) {
                let p = sub_transform.from_child_abs(q);
                own.update(|v| {
                    v.insert("x".to_string(), p[0]);
                    v.insert("y".to_string(), p[1]);
                });
            }
        });

        Ok(Self {
            inner: Arc::new(ConvInner {
                name,
                child,
                child_axes,
                axes,
                transform,
                position,
                metadata: RwLock::new(Metadata::default()),
            }),
            _subscription: subscription,
        })
    }

    pub fn transform(&self) -> &Transform2D {
        &self.inner.transform
    }
}

#[async_trait]
impl Actuator for ConvertStage {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn axes(&self) -> &BTreeMap<String, AxisDescriptor> {
        &self.inner.axes
    }

    fn position(&self) -> ObservableView<Position> {
        self.inner.position.view()
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

    /// Axes not given keep their current value.
    fn move_abs(&self, pos: Position) -> MoveTask {
        let label = format!("{}.move_abs", self.inner.name);
        if pos.is_empty() {
            return MoveTask::completed(label);
        }
        if let Err(e) = check_move_abs(&self.inner.name, &self.inner.axes, &pos) {
            return MoveTask::failed(label, e);
        }
        let current = self.inner.position.get();
        let mut target = [0.0; 2];
        for (i, axis) in EXPOSED.iter().enumerate() {
            match pos.get(*axis).or_else(|| current.get(*axis)) {
                Some(v) => target[i] = *v,
                None => {
                    return MoveTask::failed(
                        label,
                        MoveError::HardwareFault {
                            component: self.inner.name.clone(),
                            details: format!("current '{axis}' position unknown"),
                        },
                    );
                }
            }
        }
        let q = self.inner.transform.to_child_abs(target);
        self.inner.child.move_abs(self.inner.to_child_position(q))
    }

    fn move_rel(&self, shift: Position) -> MoveTask {
        let label = format!("{}.move_rel", self.inner.name);
        if shift.is_empty() {
            return MoveTask::completed(label);
        }
        if let Err(e) = check_move_rel(&self.inner.name, &self.inner.axes, &shift) {
            return MoveTask::failed(label, e);
        }
        let v = [
            shift.get("x").copied().unwrap_or(0.0),
            shift.get("y").copied().unwrap_or(0.0),
        ];
        let q = self.inner.transform.to_child_rel(v);
        self.inner.child.move_rel(self.inner.to_child_position(q))
    }

    fn reference(&self, axes: BTreeSet<String>) -> MoveTask {
        if let Err(e) = check_axes(&self.inner.name, &self.inner.axes, &axes) {
            return MoveTask::failed(format!("{}.reference", self.inner.name), e);
        }
        self.inner.child.reference(self.inner.map_axes(&axes))
    }

    async fn stop(&self, axes: Option<BTreeSet<String>>) {
        let child_axes = axes.map(|a| self.inner.map_axes(&a));
        self.inner.child.stop(child_axes).await;
    }
}

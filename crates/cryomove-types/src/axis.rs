//! Static description of one controllable degree of freedom.

use serde::{Deserialize, Serialize};

use crate::MoveError;
use crate::util::almost_equal;

/// One allowed value of a discrete axis, optionally named (e.g. a filter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Choice {
    pub fn new(value: f64) -> Self {
        Self { value, label: None }
    }

    pub fn labelled(value: f64, label: impl Into<String>) -> Self {
        Self {
            value,
            label: Some(label.into()),
        }
    }
}

/// Either a continuous `[min, max]` range or a discrete set of choices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AxisKind {
    Range { min: f64, max: f64 },
    Choices { choices: Vec<Choice> },
}

/// Immutable metadata of an axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisDescriptor {
    #[serde(flatten)]
    pub kind: AxisKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl AxisDescriptor {
    /// A continuous axis. The bounds are normalised so that `min <= max`.
    pub fn range(min: f64, max: f64) -> Self {
        Self {
            kind: AxisKind::Range {
                min: min.min(max),
                max: min.max(max),
            },
            unit: None,
        }
    }

    /// A discrete axis accepting only `choices`.
    pub fn choices(choices: impl IntoIterator<Item = Choice>) -> Self {
        Self {
            kind: AxisKind::Choices {
                choices: choices.into_iter().collect(),
            },
            unit: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self.kind, AxisKind::Range { .. })
    }

    /// `(min, max)` for a continuous axis, `None` for a discrete one.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        match self.kind {
            AxisKind::Range { min, max } => Some((min, max)),
            AxisKind::Choices { .. } => None,
        }
    }

    /// The allowed values of a discrete axis (empty for a continuous one).
    pub fn choice_list(&self) -> &[Choice] {
        match &self.kind {
            AxisKind::Choices { choices } => choices,
            AxisKind::Range { .. } => &[],
        }
    }

    /// Validate an absolute target for this axis.
    ///
    /// # Errors
    ///
    /// [`MoveError::OutOfRange`] when a continuous value lies outside the
    /// range or a discrete value matches none of the choices.
    pub fn check_value(&self, actuator: &str, axis: &str, value: f64) -> Result<(), MoveError> {
        let ok = match &self.kind {
            AxisKind::Range { min, max } => value.is_finite() && *min <= value && value <= *max,
            AxisKind::Choices { choices } => choices
                .iter()
                .any(|c| almost_equal(value, c.value, 1e-18, 1e-7)),
        };
        if ok {
            Ok(())
        } else {
            Err(MoveError::OutOfRange {
                actuator: actuator.to_string(),
                axis: axis.to_string(),
                value,
            })
        }
    }
}

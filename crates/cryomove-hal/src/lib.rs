//! `cryomove-hal` – Actuators & Motion Tasks
//!
//! Everything that moves goes through the [`Actuator`][actuator::Actuator]
//! trait.  Leaf drivers implement it directly; the composites in this crate
//! implement it by delegating to child actuators, so they stack freely.
//!
//! # Modules
//!
//! - [`actuator`] – the [`Actuator`][actuator::Actuator] capability trait and
//!   the argument checks shared by every implementation.
//! - [`observable`] – single-writer [`Observable`][observable::Observable]
//!   values with ordered, synchronous observer delivery.
//! - [`task`] – [`MoveTask`][task::MoveTask] handles, cooperative
//!   cancellation through [`TaskContext`][task::TaskContext], and the
//!   per-actuator [`SerialExecutor`][task::SerialExecutor].
//! - [`multiplex`] – [`MultiplexActuator`][multiplex::MultiplexActuator]:
//!   axes of several children presented as one actuator.
//! - [`convert`] – [`ConvertStage`][convert::ConvertStage]: a 2-axis child in
//!   a rotated / scaled / translated frame.
//! - [`coupled`] – [`CoupledStage`][coupled::CoupledStage]: master stage with a
//!   slave stage kept in sync.
//! - [`antibacklash`] – [`AntiBacklashActuator`][antibacklash::AntiBacklashActuator]:
//!   every move ends in a fixed direction.
//! - [`fixed_positions`] – [`FixedPositionsActuator`][fixed_positions::FixedPositionsActuator]:
//!   discrete, optionally cyclic positions.
//! - [`registry`] – [`HardwareRegistry`][registry::HardwareRegistry]: role →
//!   actuator lookup.
//! - [`sim`] – [`SimActuator`][sim::SimActuator]: in-memory actuator for tests
//!   and headless runs.

pub mod actuator;
pub mod antibacklash;
pub mod convert;
pub mod coupled;
pub mod fixed_positions;
pub mod multiplex;
pub mod observable;
pub mod registry;
pub mod sim;
pub mod task;

pub use actuator::{Actuator, ComponentState};
pub use antibacklash::AntiBacklashActuator;
pub use convert::{ConvertStage, Transform2D};
pub use coupled::CoupledStage;
pub use fixed_positions::FixedPositionsActuator;
pub use multiplex::MultiplexActuator;
pub use observable::{Observable, ObservableView, Subscription};
pub use registry::HardwareRegistry;
pub use sim::{SimActuator, SimCall};
pub use task::{MoveTask, SerialExecutor, TaskContext, TaskState};

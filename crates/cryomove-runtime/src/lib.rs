//! `cryomove-runtime` – Motion Orchestration
//!
//! Where multi-step transitions are sequenced. Everything here drives
//! hardware only through the [`Actuator`][cryomove_hal::Actuator] trait and
//! consults `cryomove-kernel` before the first sub-move of a transition.
//!
//! # Modules
//!
//! - [`orchestrator`] – [`SampleMover`][orchestrator::SampleMover]:
//!   cancellable loading / imaging / tilt transitions of a cryo sample
//!   stage and its focus, one [`MoveTask`][cryomove_hal::MoveTask] each.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export
//!   to Jaeger, Grafana Tempo, or any OTLP-compatible collector.

pub mod orchestrator;
pub mod telemetry;

pub use orchestrator::{LoadTarget, SampleMover, run_sub_move};
pub use telemetry::{TracerProviderGuard, init_tracing};

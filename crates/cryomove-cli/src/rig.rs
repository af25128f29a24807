//! Builds the simulated rig described by [`RigConfig`].

use std::sync::Arc;
use std::time::Duration;

use cryomove_hal::{HardwareRegistry, SimActuator};
use cryomove_types::MoveError;
use tracing::info;

use crate::config::{ActuatorConfig, RigConfig};

fn build_actuator(cfg: &ActuatorConfig) -> Result<SimActuator, MoveError> {
    let mut builder = SimActuator::builder(cfg.name.clone())
        .position(cfg.position.clone())
        .metadata(cfg.metadata.clone())
        .delay(Duration::from_millis(cfg.move_delay_ms));
    for (axis, desc) in &cfg.axes {
        builder = builder.axis(axis.clone(), desc.clone());
    }
    builder.build()
}

/// Register a simulated `"stage"` and `"focus"` in a fresh registry.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// [`MoveError::InvalidConfiguration`] when an actuator has no axes or its
/// initial position does not fit them.
pub fn build_registry(rig: &RigConfig) -> Result<HardwareRegistry, MoveError> {
    let mut registry = HardwareRegistry::new();
    registry.register("stage", Arc::new(build_actuator(&rig.stage)?));
    registry.register("focus", Arc::new(build_actuator(&rig.focus)?));
    info!(roles = ?registry.roles(), "simulated rig ready");
    Ok(registry)
}

//! [`HardwareRegistry`] – role-keyed actuator registry.
//!
//! The registry maps a role (`"stage"`, `"focus"`, `"filter"`, …) to the
//! actuator that plays it, so higher layers resolve hardware by what it does
//! rather than by concrete driver type.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cryomove_types::MoveError;
use futures_util::future::join_all;
use tracing::info;

use crate::actuator::{Actuator, stop_with_timeout};

/// Central actuator registry.
///
/// Construct with [`HardwareRegistry::new`], register actuators under their
/// role, then resolve them with [`HardwareRegistry::get`] or
/// [`HardwareRegistry::require`].
#[derive(Default)]
pub struct HardwareRegistry {
    actuators: HashMap<String, Arc<dyn Actuator>>,
}

impl HardwareRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `actuator` for `role`.  Returns the actuator previously
    /// registered for that role, if any.
    pub fn register(
        &mut self,
        role: impl Into<String>,
        actuator: Arc<dyn Actuator>,
    ) -> Option<Arc<dyn Actuator>> {
        self.actuators.insert(role.into(), actuator)
    }

    pub fn get(&self, role: &str) -> Option<Arc<dyn Actuator>> {
        self.actuators.get(role).cloned()
    }

    /// Like [`HardwareRegistry::get`], for callers that cannot work without
    /// the role.
    ///
    /// # Errors
    ///
    /// Returns [`MoveError::InvalidConfiguration`] when no actuator plays
    /// `role`.
    pub fn require(&self, role: &str) -> Result<Arc<dyn Actuator>, MoveError> {
        self.get(role).ok_or_else(|| {
            MoveError::InvalidConfiguration(format!("no actuator registered for role '{role}'"))
        })
    }

    /// Registered roles, sorted.
    pub fn roles(&self) -> Vec<&str> {
        let mut roles: Vec<&str> = self.actuators.keys().map(String::as_str).collect();
        roles.sort_unstable();
        roles
    }

    pub fn len(&self) -> usize {
        self.actuators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actuators.is_empty()
    }

    /// Emergency stop: halt every registered actuator concurrently, waiting at
    /// most `limit` for each.
    pub async fn stop_all(&self, limit: Duration) {
        info!(count = self.actuators.len(), "stopping all actuators");
        join_all(
            self.actuators
                .values()
                .map(|a| stop_with_timeout(a.as_ref(), None, limit)),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimActuator, SimCall};
    use cryomove_types::AxisDescriptor;

    fn sim(name: &str) -> Arc<SimActuator> {
        Arc::new(
            SimActuator::builder(name)
                .axis("z", AxisDescriptor::range(-1.0, 1.0))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn register_and_resolve_by_role() {
        let mut registry = HardwareRegistry::new();
        assert!(registry.is_empty());
        registry.register("focus", sim("focus_drive"));
        registry.register("stage", sim("stage_drive"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.roles(), vec!["focus", "stage"]);
        assert_eq!(registry.require("focus").unwrap().name(), "focus_drive");
        assert!(registry.get("filter").is_none());
    }

    #[tokio::test]
    async fn require_missing_role_is_configuration_error() {
        let registry = HardwareRegistry::new();
        assert!(matches!(
            registry.require("stage"),
            Err(MoveError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn re_registering_role_replaces_actuator() {
        let mut registry = HardwareRegistry::new();
        assert!(registry.register("focus", sim("old")).is_none());
        let previous = registry.register("focus", sim("new")).unwrap();
        assert_eq!(previous.name(), "old");
        assert_eq!(registry.require("focus").unwrap().name(), "new");
    }

    #[tokio::test]
    async fn stop_all_reaches_every_actuator() {
        let a = sim("a");
        let b = sim("b");
        let mut registry = HardwareRegistry::new();
        registry.register("stage", a.clone());
        registry.register("focus", b.clone());

        registry.stop_all(Duration::from_secs(1)).await;

        assert_eq!(a.calls(), vec![SimCall::Stop(None)]);
        assert_eq!(b.calls(), vec![SimCall::Stop(None)]);
    }
}

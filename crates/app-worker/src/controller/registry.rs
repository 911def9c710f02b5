//! Controller and receiver lookup by identifier and API level.

use crate::controller::{Controller, ControllerConfig};
use crate::errors::WorkerError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// A controller with its settings.
pub struct RegisteredController {
    pub config: ControllerConfig,
    pub controller: Arc<dyn Controller>,
}

impl fmt::Debug for RegisteredController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

type Versions = BTreeMap<u32, Arc<RegisteredController>>;

/// Immutable lookup table built at startup.
#[derive(Debug, Default)]
pub struct ControllerRegistry {
    controllers: HashMap<String, Versions>,
    receivers: HashMap<String, Versions>,
}

impl ControllerRegistry {
    #[must_use]
    pub fn builder() -> ControllerRegistryBuilder {
        ControllerRegistryBuilder::default()
    }

    /// Controller registered for `id` with the highest minimum API level not
    /// above `api_level`.
    ///
    /// # Errors
    ///
    /// - `ControllerNotFound` - nothing is registered for `id`
    /// - `ApiLevelIncompatible` - every registration needs a higher level
    pub fn get(&self, id: &str, api_level: u32) -> Result<Arc<RegisteredController>, WorkerError> {
        let versions = self
            .controllers
            .get(id)
            .ok_or_else(|| WorkerError::ControllerNotFound(id.to_string()))?;
        pick(versions, api_level)
    }

    /// Receiver lookup; same rules as [`Self::get`].
    ///
    /// # Errors
    ///
    /// - `ReceiverNotFound` - nothing is registered for `id`
    /// - `ApiLevelIncompatible` - every registration needs a higher level
    pub fn get_receiver(
        &self,
        id: &str,
        api_level: u32,
    ) -> Result<Arc<RegisteredController>, WorkerError> {
        let versions = self
            .receivers
            .get(id)
            .ok_or_else(|| WorkerError::ReceiverNotFound(id.to_string()))?;
        pick(versions, api_level)
    }

    #[must_use]
    pub fn controller_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.controllers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

fn pick(versions: &Versions, api_level: u32) -> Result<Arc<RegisteredController>, WorkerError> {
    versions
        .range(..=api_level)
        .next_back()
        .map(|(_, registered)| Arc::clone(registered))
        .ok_or(WorkerError::ApiLevelIncompatible { api_level })
}

/// Startup registration of controllers and receivers.
#[derive(Debug, Default)]
pub struct ControllerRegistryBuilder {
    registry: ControllerRegistry,
}

impl ControllerRegistryBuilder {
    /// Register a controller for every API level.
    #[must_use]
    pub fn controller(
        self,
        id: impl Into<String>,
        config: ControllerConfig,
        controller: Arc<dyn Controller>,
    ) -> Self {
        self.controller_from_level(id, 0, config, controller)
    }

    /// Register a controller for API levels `min_api_level` and up. A later
    /// registration with the same id and level replaces the earlier one.
    #[must_use]
    pub fn controller_from_level(
        mut self,
        id: impl Into<String>,
        min_api_level: u32,
        config: ControllerConfig,
        controller: Arc<dyn Controller>,
    ) -> Self {
        self.registry
            .controllers
            .entry(id.into())
            .or_default()
            .insert(min_api_level, Arc::new(RegisteredController { config, controller }));
        self
    }

    #[must_use]
    pub fn receiver(
        self,
        id: impl Into<String>,
        config: ControllerConfig,
        receiver: Arc<dyn Controller>,
    ) -> Self {
        self.receiver_from_level(id, 0, config, receiver)
    }

    #[must_use]
    pub fn receiver_from_level(
        mut self,
        id: impl Into<String>,
        min_api_level: u32,
        config: ControllerConfig,
        receiver: Arc<dyn Controller>,
    ) -> Self {
        self.registry
            .receivers
            .entry(id.into())
            .or_default()
            .insert(
                min_api_level,
                Arc::new(RegisteredController {
                    config,
                    controller: receiver,
                }),
            );
        self
    }

    #[must_use]
    pub fn build(self) -> ControllerRegistry {
        self.registry
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::{AccessConfig, AccessValue};
    use crate::controller::RequestContext;
    use crate::errors::HandlerError;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Fixed(Value);

    #[async_trait]
    impl Controller for Fixed {
        async fn handle(&self, _ctx: &RequestContext, _input: Value) -> Result<Value, HandlerError> {
            Ok(self.0.clone())
        }
    }

    fn level_config(level: &str) -> ControllerConfig {
        ControllerConfig::default().with_access(AccessConfig::access(AccessValue::Group(
            level.to_string(),
        )))
    }

    #[test]
    fn test_highest_compatible_level_wins() {
        let registry = ControllerRegistry::builder()
            .controller_from_level("profile", 1, level_config("one"), Arc::new(Fixed(json!(1))))
            .controller_from_level("profile", 3, level_config("three"), Arc::new(Fixed(json!(3))))
            .build();

        let at = |level| registry.get("profile", level).unwrap().config.access.clone();
        assert_eq!(at(1), AccessConfig::access(AccessValue::Group("one".to_string())));
        assert_eq!(at(2), AccessConfig::access(AccessValue::Group("one".to_string())));
        assert_eq!(at(7), AccessConfig::access(AccessValue::Group("three".to_string())));
        assert_eq!(
            registry.get("profile", 0).unwrap_err(),
            WorkerError::ApiLevelIncompatible { api_level: 0 }
        );
    }

    #[test]
    fn test_unknown_ids() {
        let registry = ControllerRegistry::builder()
            .receiver("typing", ControllerConfig::default(), Arc::new(Fixed(Value::Null)))
            .build();

        assert_eq!(
            registry.get("typing", 1).unwrap_err(),
            WorkerError::ControllerNotFound("typing".to_string())
        );
        assert!(registry.get_receiver("typing", 1).is_ok());
        assert_eq!(
            registry.get_receiver("missing", 1).unwrap_err(),
            WorkerError::ReceiverNotFound("missing".to_string())
        );
    }
}

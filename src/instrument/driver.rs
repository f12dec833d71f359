//! Instrument driver trait and the driver registry.
//!
//! A driver is the instrument-specific seam of the engine: it knows how to
//! translate a generic [`Command`] into one or more bus transactions (or one
//! atomic sequence) for its model, and how to turn the bus's bytes back into
//! snapshots. Everything else — queueing, FIFO ordering, the synchronous
//! bridge, snapshot publication — is generic and lives in
//! [`crate::instrument::Instrument`].
//!
//! The [`DriverRegistry`] maps model identifiers to driver factories. It is a
//! plain value constructed at startup and passed where needed; there is no
//! process-wide device-type table.

use crate::bus::BusDevice;
use crate::command::{Command, CommandReply};
use crate::error::{DaqError, DaqResult};
use async_trait::async_trait;
use std::collections::HashMap;

/// Instrument-specific command translation and execution.
#[async_trait]
pub trait InstrumentDriver: Send {
    /// Model identifier this driver implements (e.g. `mock_dmm`).
    fn model(&self) -> &'static str;

    /// Validate a command before any bus traffic.
    ///
    /// Rejections here fail the command immediately without touching the bus:
    /// [`DaqError::Validation`] for malformed arguments,
    /// [`DaqError::Unsupported`] for kinds this model does not implement.
    fn validate(&self, command: &Command) -> DaqResult<()> {
        let _ = command;
        Ok(())
    }

    /// Execute one validated command against the bus.
    ///
    /// Runs on the instrument's worker; `&mut self` state is private to that
    /// worker. An error returned after bus traffic has already been sent must
    /// still be surfaced — callers may not assume no-op semantics on failure.
    async fn execute(&mut self, bus: &BusDevice, command: &Command) -> DaqResult<CommandReply>;
}

impl std::fmt::Debug for dyn InstrumentDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InstrumentDriver({})", self.model())
    }
}

/// Factory closure producing a driver from its instrument-specific
/// configuration table.
pub type DriverFactory = Box<dyn Fn(&toml::Table) -> DaqResult<Box<dyn InstrumentDriver>> + Send + Sync>;

/// Registry of available instrument models.
///
/// Built once at startup and passed explicitly (dependency injection); maps
/// device-type identifiers to driver constructors.
#[derive(Default)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver factory for a model identifier.
    pub fn register<F>(&mut self, model: &str, factory: F)
    where
        F: Fn(&toml::Table) -> DaqResult<Box<dyn InstrumentDriver>> + Send + Sync + 'static,
    {
        self.factories.insert(model.to_string(), Box::new(factory));
    }

    /// Instantiate a driver for `model` from its configuration table.
    pub fn create(
        &self,
        model: &str,
        config: &toml::Table,
    ) -> DaqResult<Box<dyn InstrumentDriver>> {
        let factory = self.factories.get(model).ok_or_else(|| {
            DaqError::Configuration(format!("no driver registered for model '{model}'"))
        })?;
        factory(config)
    }

    /// Registered model identifiers.
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDriver;

    #[async_trait]
    impl InstrumentDriver for NullDriver {
        fn model(&self) -> &'static str {
            "null"
        }

        async fn execute(
            &mut self,
            _bus: &BusDevice,
            _command: &Command,
        ) -> DaqResult<CommandReply> {
            Ok(CommandReply::Done)
        }
    }

    #[test]
    fn registry_creates_registered_models() {
        let mut registry = DriverRegistry::new();
        registry.register("null", |_config| Ok(Box::new(NullDriver)));

        let driver = registry.create("null", &toml::Table::new()).unwrap();
        assert_eq!(driver.model(), "null");
        assert_eq!(registry.models().count(), 1);
    }

    #[test]
    fn unknown_model_is_a_configuration_error() {
        let registry = DriverRegistry::new();
        let err = registry.create("ghost", &toml::Table::new()).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }
}

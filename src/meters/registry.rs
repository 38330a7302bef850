//! Meter type registry.

use std::collections::BTreeMap;

use super::rs485::{AbbProducer, Producer, SdmProducer};
use crate::error::{Error, Result};

/// Constructor for a register-map producer.
pub type ProducerFactory = fn() -> Box<dyn Producer>;

/// Maps meter type names to producer constructors.
///
/// Built once at startup and passed to whatever creates devices. Type names
/// are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    producers: BTreeMap<String, ProducerFactory>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in producers.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for factory in [sdm as ProducerFactory, abb] {
            // Built-in type names are distinct
            let _ = registry.register(factory);
        }
        registry
    }

    /// Registers a producer under its type name.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the type is already registered.
    pub fn register(&mut self, factory: ProducerFactory) -> Result<()> {
        let name = factory().type_name().to_ascii_uppercase();
        if self.producers.contains_key(&name) {
            return Err(Error::config(format!("duplicate meter type {name}")));
        }
        self.producers.insert(name, factory);
        Ok(())
    }

    /// Creates a producer for `meter_type`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown type.
    pub fn create(&self, meter_type: &str) -> Result<Box<dyn Producer>> {
        self.producers
            .get(&meter_type.to_ascii_uppercase())
            .map(|factory| factory())
            .ok_or_else(|| Error::config(format!("unknown meter type {meter_type}")))
    }

    /// Returns true if `meter_type` is registered.
    #[must_use]
    pub fn contains(&self, meter_type: &str) -> bool {
        self.producers.contains_key(&meter_type.to_ascii_uppercase())
    }

    /// Iterates registered type names in sorted order.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.producers.keys().map(String::as_str)
    }
}

fn sdm() -> Box<dyn Producer> {
    Box::new(SdmProducer::new())
}

fn abb() -> Box<dyn Producer> {
    Box::new(AbbProducer::new())
}

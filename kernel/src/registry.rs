//! Actor class registry.
//!
//! Classes register a constructor under a string id; `create_actor`
//! resolves the id and builds the instance. Message dispatch itself is the
//! class's business — handlers switch on whatever tag convention their
//! payloads carry — so the registry stays a plain factory table.

use crate::actor::Actor;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use xosc_protocol::{ActorError, ErrorKind};

/// Constructor arguments, as decoded by the pool's codec.
pub type InitArgs = serde_json::Value;

/// Builds one actor instance from init args.
pub type ActorFactory =
    Arc<dyn Fn(InitArgs) -> Result<Box<dyn Actor>, ActorError> + Send + Sync>;

/// `class_id → constructor` table.
#[derive(Default)]
pub struct ClassRegistry {
    classes: RwLock<HashMap<String, ActorFactory>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class. Re-registering an id replaces the constructor.
    pub fn register<F>(&self, class_id: impl Into<String>, factory: F)
    where
        F: Fn(InitArgs) -> Result<Box<dyn Actor>, ActorError> + Send + Sync + 'static,
    {
        self.classes
            .write()
            .insert(class_id.into(), Arc::new(factory));
    }

    /// Build an instance of `class_id`.
    pub fn construct(
        &self,
        class_id: &str,
        init_args: InitArgs,
    ) -> Result<Box<dyn Actor>, ActorError> {
        let factory = self
            .classes
            .read()
            .get(class_id)
            .cloned()
            .ok_or_else(|| {
                ActorError::new(
                    ErrorKind::ActorNotFound,
                    format!("actor class {class_id:?} is not registered"),
                )
            })?;
        factory(init_args)
    }

    /// Registered class ids, for diagnostics.
    pub fn class_ids(&self) -> Vec<String> {
        self.classes.read().keys().cloned().collect()
    }
}

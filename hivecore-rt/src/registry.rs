//! Process-wide registry of actor systems.
//!
//! The registry is created once by the host's `bootstrap()` and torn down
//! by its `shutdown()`; there is no lazy global. Systems register under
//! their name; the cluster transport and the gateway address them through
//! the JSON-typed [`SystemHandle`] so the registry stays object-safe over
//! heterogeneous state types.

// Layer 1: Standard library
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::info;

// Layer 3: Internal
use crate::error::ActorError;
use crate::system::ActorSystem;

/// Object-safe view of one actor system.
#[async_trait]
pub trait SystemHandle: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn tell_json(&self, actor_id: &str, message_type: &str, payload: Value) -> bool;

    async fn ask_json(
        &self,
        actor_id: &str,
        message_type: &str,
        payload: Value,
        wait: Duration,
    ) -> Result<Value, ActorError>;

    fn has_actor(&self, actor_id: &str) -> bool;

    fn actor_ids(&self) -> Vec<String>;

    fn actor_count(&self) -> usize;

    async fn stop_actor(&self, actor_id: &str) -> bool;

    async fn shutdown(&self);
}

#[async_trait]
impl<S: Send + 'static> SystemHandle for ActorSystem<S> {
    fn name(&self) -> &str {
        ActorSystem::name(self)
    }

    async fn tell_json(&self, actor_id: &str, message_type: &str, payload: Value) -> bool {
        self.tell(actor_id, message_type, payload).await
    }

    async fn ask_json(
        &self,
        actor_id: &str,
        message_type: &str,
        payload: Value,
        wait: Duration,
    ) -> Result<Value, ActorError> {
        self.ask(actor_id, message_type, payload, wait).await
    }

    fn has_actor(&self, actor_id: &str) -> bool {
        ActorSystem::has_actor(self, actor_id)
    }

    fn actor_ids(&self) -> Vec<String> {
        ActorSystem::actor_ids(self)
    }

    fn actor_count(&self) -> usize {
        ActorSystem::actor_count(self)
    }

    async fn stop_actor(&self, actor_id: &str) -> bool {
        ActorSystem::stop_actor(self, actor_id).await
    }

    async fn shutdown(&self) {
        ActorSystem::shutdown(self).await
    }
}

/// All actor systems hosted by this node.
#[derive(Default)]
pub struct ActorSystemRegistry {
    systems: DashMap<String, Arc<dyn SystemHandle>>,
}

impl ActorSystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a system under its own name; replaces any previous
    /// registration of that name.
    pub fn register(&self, system: Arc<dyn SystemHandle>) {
        info!(system = system.name(), "actor system registered");
        self.systems.insert(system.name().to_string(), system);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SystemHandle>> {
        self.systems.get(name).map(|s| Arc::clone(s.value()))
    }

    pub fn names(&self) -> Vec<String> {
        self.systems.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    /// Shut down every system and clear the registry.
    pub async fn shutdown_all(&self) {
        let systems: Vec<Arc<dyn SystemHandle>> = self
            .systems
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for system in systems {
            system.shutdown().await;
        }
        self.systems.clear();
    }
}

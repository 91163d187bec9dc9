//! Adapter wiring the actor runtime's state contract onto the document
//! store contract.

// Layer 1: Standard library
use std::marker::PhantomData;
use std::sync::Arc;

// Layer 2: Third-party
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

// Layer 3: Internal
use hivecore_rt::state::{StateStore, StateStoreError};
use hivecore_store::EntityStore;

/// Persists one actor system's state as JSON documents keyed by
/// `(system, actor_id)`.
pub struct EntityStateStore<S> {
    entities: Arc<dyn EntityStore>,
    system: String,
    _state: PhantomData<fn() -> S>,
}

impl<S> EntityStateStore<S> {
    pub fn new(entities: Arc<dyn EntityStore>, system: impl Into<String>) -> Self {
        Self {
            entities,
            system: system.into(),
            _state: PhantomData,
        }
    }
}

#[async_trait]
impl<S> StateStore<S> for EntityStateStore<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn load(&self, actor_id: &str) -> Result<Option<S>, StateStoreError> {
        let document = self
            .entities
            .load(&self.system, actor_id)
            .await
            .map_err(|err| StateStoreError::new(err.to_string()))?;
        match document {
            Some(document) => serde_json::from_value(document)
                .map(Some)
                .map_err(|err| StateStoreError::new(err.to_string())),
            None => Ok(None),
        }
    }

    async fn save(&self, actor_id: &str, state: &S) -> Result<(), StateStoreError> {
        let document = serde_json::to_value(state)
            .map_err(|err| StateStoreError::new(err.to_string()))?;
        self.entities
            .save(&self.system, actor_id, &document)
            .await
            .map_err(|err| StateStoreError::new(err.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests are allowed to use unwrap for simplicity
mod tests {
    use super::*;
    use hivecore_store::MemoryEntityStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct GuildState {
        level: u32,
        funds: i64,
    }

    #[tokio::test]
    async fn test_round_trip_through_documents() {
        let entities = Arc::new(MemoryEntityStore::new());
        let store: EntityStateStore<GuildState> =
            EntityStateStore::new(Arc::clone(&entities) as Arc<dyn EntityStore>, "guild");

        assert!(store.load("g-1").await.unwrap().is_none());

        let state = GuildState {
            level: 3,
            funds: 9000,
        };
        store.save("g-1", &state).await.unwrap();
        assert_eq!(store.load("g-1").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_systems_do_not_collide() {
        let entities = Arc::new(MemoryEntityStore::new());
        let guilds: EntityStateStore<GuildState> =
            EntityStateStore::new(Arc::clone(&entities) as Arc<dyn EntityStore>, "guild");
        let rooms: EntityStateStore<GuildState> =
            EntityStateStore::new(entities as Arc<dyn EntityStore>, "room");

        guilds
            .save("1", &GuildState { level: 1, funds: 0 })
            .await
            .unwrap();
        assert!(rooms.load("1").await.unwrap().is_none());
    }
}

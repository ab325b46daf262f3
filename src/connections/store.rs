//! Connection persistence seam

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::error::ConnectionError;
use super::model::{ConnectionKey, ServiceConnection};

/// Edit applied under the store's lock. Nothing is written when it fails.
pub type ConnectionMutation<'a> =
    &'a (dyn Fn(&mut ServiceConnection) -> Result<(), ConnectionError> + Send + Sync);

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get(&self, key: ConnectionKey) -> Result<Option<ServiceConnection>, ConnectionError>;

    async fn put(&self, connection: ServiceConnection) -> Result<(), ConnectionError>;

    /// Apply `mutate` atomically to a stored connection, returning the result.
    /// `None` when nothing is stored under `key`.
    async fn modify(
        &self,
        key: ConnectionKey,
        mutate: ConnectionMutation<'_>,
    ) -> Result<Option<ServiceConnection>, ConnectionError>;

    async fn delete(&self, key: ConnectionKey) -> Result<(), ConnectionError>;

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<ServiceConnection>, ConnectionError>;

    async fn list_all(&self) -> Result<Vec<ServiceConnection>, ConnectionError>;
}

/// In-memory connection store (for testing/local development)
#[derive(Default)]
pub struct InMemoryConnectionStore {
    connections: DashMap<ConnectionKey, ServiceConnection>,
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn get(&self, key: ConnectionKey) -> Result<Option<ServiceConnection>, ConnectionError> {
        Ok(self.connections.get(&key).map(|c| c.clone()))
    }

    async fn put(&self, connection: ServiceConnection) -> Result<(), ConnectionError> {
        self.connections.insert(connection.key(), connection);
        Ok(())
    }

    async fn modify(
        &self,
        key: ConnectionKey,
        mutate: ConnectionMutation<'_>,
    ) -> Result<Option<ServiceConnection>, ConnectionError> {
        let Some(mut entry) = self.connections.get_mut(&key) else {
            return Ok(None);
        };
        let mut updated = entry.value().clone();
        mutate(&mut updated)?;
        *entry.value_mut() = updated.clone();
        Ok(Some(updated))
    }

    async fn delete(&self, key: ConnectionKey) -> Result<(), ConnectionError> {
        self.connections.remove(&key);
        Ok(())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<ServiceConnection>, ConnectionError> {
        Ok(self
            .connections
            .iter()
            .filter(|entry| entry.key().user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<ServiceConnection>, ConnectionError> {
        Ok(self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}

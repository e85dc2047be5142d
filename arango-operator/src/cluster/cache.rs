use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::cluster::{ClientFactory, ClientKey, ClusterClient};
use arango_core::crd::ServerGroup;
use arango_core::{AppError, AppResult};

/// A cache of validated clients, owned by one deployment.
///
/// Lookups happen at reconciliation cadence only, so a single lock serializes all cache
/// mutations. The lock is never held while a client is in use.
pub struct ConnectionCache {
    factory: Arc<dyn ClientFactory>,
    clients: Mutex<HashMap<ClientKey, Arc<dyn ClusterClient>>>,
}

impl ConnectionCache {
    /// Create a new instance.
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Get a client of the deployment as a whole.
    pub async fn get_database(&self) -> AppResult<Arc<dyn ClusterClient>> {
        self.get(&ClientKey::Database).await
    }

    /// Get a client of the agency.
    pub async fn get_agency(&self) -> AppResult<Arc<dyn ClusterClient>> {
        self.get(&ClientKey::Agency).await
    }

    /// Get a client of the given member.
    pub async fn get_member(&self, group: ServerGroup, id: &str) -> AppResult<Arc<dyn ClusterClient>> {
        self.get(&ClientKey::Member(group, id.into())).await
    }

    /// Get the client for the given key, creating it as needed.
    ///
    /// The version of a cached client is checked first. If its credentials are rejected it is evicted and
    /// recreated exactly once. Any other failure of the check returns the cached client, leaving retries
    /// to the caller's own schedule.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get(&self, key: &ClientKey) -> AppResult<Arc<dyn ClusterClient>> {
        let cached = self.clients.lock().await.get(key).cloned();
        let client = match cached {
            Some(client) => client,
            None => return self.create(key).await,
        };

        match client.version().await {
            Ok(_) => Ok(client),
            Err(AppError::Unauthorized) => {
                tracing::debug!(%key, "cached client was rejected by the server, recreating");
                self.invalidate(key).await;
                self.create(key).await
            }
            Err(err) => {
                tracing::debug!(error = ?err, %key, "cached client failed its version check, keeping it");
                Ok(client)
            }
        }
    }

    /// Drop the cached client of the given key.
    pub async fn invalidate(&self, key: &ClientKey) {
        self.clients.lock().await.remove(key);
    }

    async fn create(&self, key: &ClientKey) -> AppResult<Arc<dyn ClusterClient>> {
        let client = self.factory.create(key).await?;
        self.clients.lock().await.insert(key.clone(), client.clone());
        Ok(client)
    }
}

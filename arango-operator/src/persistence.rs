//! Optimistic concurrency persistence of deployment records.
//!
//! All writes of a deployment record go through `update_with_retry`, so that conflict
//! classification and the attempt bound are applied the same way everywhere.

use async_trait::async_trait;
use serde_json::Value;

use arango_core::{AppError, AppResult};

/// The maximum number of write attempts made by `update_with_retry`.
pub const MAX_UPDATE_ATTEMPTS: usize = 10;

/// The sub-document of a record targeted by a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteTarget {
    /// The spec and metadata of the record.
    Spec,
    /// The status sub-document of the record.
    Status,
}

/// A durable, versioned record store.
#[async_trait]
pub trait RecordStore<K>: Send + Sync {
    /// Fetch the latest version of the named record.
    async fn get(&self, name: &str) -> AppResult<K>;

    /// Write the given record, failing with `AppError::Conflict` if its version is stale.
    async fn update(&self, target: WriteTarget, record: &K) -> AppResult<K>;

    /// Apply a JSON merge patch to the named record.
    async fn patch(&self, name: &str, patch: Value) -> AppResult<K>;
}

/// Apply `modify` to `current` and write the result, retrying on version conflicts.
///
/// On conflict the latest record is reloaded and `modify` is applied again, up to
/// `MAX_UPDATE_ATTEMPTS` writes in total. Any other error aborts right away. Unless `force` is
/// given, no write happens when `modify` leaves the record unchanged.
pub async fn update_with_retry<K, S, F>(store: &S, name: &str, target: WriteTarget, mut current: K, force: bool, mut modify: F) -> AppResult<K>
where
    K: Clone + PartialEq + Send + Sync,
    S: RecordStore<K> + ?Sized,
    F: FnMut(&mut K) + Send,
{
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let mut next = current.clone();
        modify(&mut next);
        if !force && next == current {
            return Ok(current);
        }

        match store.update(target, &next).await {
            Ok(updated) => return Ok(updated),
            Err(AppError::Conflict) if attempt < MAX_UPDATE_ATTEMPTS => {
                tracing::debug!(name, attempt, ?target, "conflict while updating record, reloading");
                current = store.get(name).await?;
            }
            Err(AppError::Conflict) => break,
            Err(err) => return Err(err),
        }
    }
    Err(AppError::RetriesExhausted(MAX_UPDATE_ATTEMPTS))
}

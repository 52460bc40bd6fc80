use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use super::{EntityKey, EntityValue};
use crate::error::FetchError;

/// Storage and network collaborators of an `EntitySource`.
#[async_trait]
pub trait EntityAdapter<ID: EntityKey, T: EntityValue>: Send + Sync + 'static {
    /// Read from persistent storage. Must not touch the network.
    async fn fetch_from_local(&self, id: &ID) -> Result<Option<T>>;

    /// Fetch from the remote provider. Never returns partial data.
    async fn fetch_from_remote(&self, id: &ID) -> std::result::Result<T, FetchError>;

    /// Idempotent upsert into persistent storage.
    async fn save_to_local(&self, id: &ID, value: &T) -> Result<()>;

    /// Ids of nested entities referenced by `value`.
    fn linked_entity_ids(&self, _value: &T) -> HashSet<String> {
        HashSet::new()
    }
}

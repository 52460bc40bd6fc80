//! Wiring of the generic machinery to the sync backend and local storage.
//!
//! `HttpEntityAdapter` serves one entity kind: it downloads by alias through
//! the `ApiClient`, keeps entities and their alias table in a
//! `JsonEntityStore`, and looks up school credentials per download.
//! `Services` is the composition root holding one resolver per kind.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::alias::{Alias, LocalId};
use crate::api::ApiClient;
use crate::auth::{CredentialSource, SchoolCredentials};
use crate::config::Config;
use crate::error::FetchError;
use crate::models::{credential_scope, Group, RemoteEntity, School, SubjectInstance};
use crate::resolution::{AliasAdapter, AliasResolver, Downloaded};
use crate::source::{EntityAdapter, EntitySource, SourceConfig};
use crate::store::JsonEntityStore;

pub type SchoolResolver = AliasResolver<HttpEntityAdapter<School>, School>;
pub type GroupResolver = AliasResolver<HttpEntityAdapter<Group>, Group>;
pub type SubjectInstanceResolver = AliasResolver<HttpEntityAdapter<SubjectInstance>, SubjectInstance>;

pub struct HttpEntityAdapter<T: RemoteEntity> {
    client: ApiClient,
    store: JsonEntityStore<T>,
    credentials: Arc<dyn CredentialSource>,
}

impl<T: RemoteEntity> HttpEntityAdapter<T> {
    pub fn new(
        client: ApiClient,
        store: JsonEntityStore<T>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            client,
            store,
            credentials,
        }
    }

    pub fn store(&self) -> &JsonEntityStore<T> {
        &self.store
    }

    fn credentials_for(&self, alias: &Alias) -> std::result::Result<SchoolCredentials, FetchError> {
        let scope = credential_scope(alias);
        self.credentials
            .credentials(scope)
            .map_err(|e| FetchError::Storage(format!("Credential lookup failed: {:#}", e)))?
            .ok_or_else(|| FetchError::NotFound(format!("credentials for school {}", scope)))
    }
}

#[async_trait]
impl<T: RemoteEntity> EntityAdapter<LocalId, T> for HttpEntityAdapter<T> {
    async fn fetch_from_local(&self, id: &LocalId) -> Result<Option<T>> {
        Ok(self.store.load(*id).await?.map(|entry| entry.value))
    }

    async fn fetch_from_remote(&self, id: &LocalId) -> std::result::Result<T, FetchError> {
        // Any alias of the entity addresses it remotely
        let alias = self
            .store
            .aliases_of(*id)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::NotFound(format!("no alias known for {} {}", T::KIND, id)))?;

        let credentials = self.credentials_for(&alias).map_err(|e| match e {
            FetchError::NotFound(_) => FetchError::Unauthorized,
            other => other,
        })?;

        let entity: T = self.client.fetch_by_alias(&alias, &credentials).await?;
        let mut aliases = self.store.aliases_of(*id).await;
        aliases.extend(entity.aliases());
        Ok(entity
            .with_aliases(aliases.into_iter().collect())
            .with_local_id(*id))
    }

    async fn save_to_local(&self, id: &LocalId, value: &T) -> Result<()> {
        let aliases = value.aliases();
        if !aliases.is_empty() {
            let registered = self.store.register_aliases(aliases).await?;
            if registered != *id {
                return Err(FetchError::Defect(format!(
                    "{} {} carries aliases of entity {}",
                    T::KIND,
                    id,
                    registered
                ))
                .into());
            }
        }
        self.store.save(*id, value).await
    }

    fn linked_entity_ids(&self, value: &T) -> HashSet<String> {
        value.linked_ids()
    }
}

#[async_trait]
impl<T: RemoteEntity> AliasAdapter for HttpEntityAdapter<T> {
    type Dto = T;
    type Credentials = SchoolCredentials;

    async fn resolve_alias_to_local_id(&self, alias: &Alias) -> Result<Option<LocalId>> {
        Ok(self.store.resolve(alias).await)
    }

    async fn prerequisite(&self, alias: &Alias) -> std::result::Result<SchoolCredentials, FetchError> {
        self.credentials_for(alias)
    }

    async fn download_by_alias(
        &self,
        alias: &Alias,
        credentials: &SchoolCredentials,
    ) -> std::result::Result<Downloaded<T>, FetchError> {
        let entity: T = self.client.fetch_by_alias(alias, credentials).await?;
        let aliases = entity.aliases();
        Ok(Downloaded { entity, aliases })
    }

    async fn persist_downloaded_entity(&self, downloaded: Downloaded<T>) -> Result<LocalId> {
        let id = self.store.register_aliases(downloaded.aliases).await?;
        // Stored aliases are the union the table now holds, not just this download's
        let aliases = self.store.aliases_of(id).await.into_iter().collect();
        let entity = downloaded.entity.with_aliases(aliases).with_local_id(id);
        self.store.save(id, &entity).await?;
        debug!(kind = T::KIND, local_id = %id, "Persisted downloaded entity");
        Ok(id)
    }

    async fn aliases_of(&self, id: LocalId) -> Result<BTreeSet<Alias>> {
        Ok(self.store.aliases_of(id).await)
    }
}

async fn resolver<T: RemoteEntity>(
    client: &ApiClient,
    cache_dir: &Path,
    credentials: &Arc<dyn CredentialSource>,
    config: SourceConfig,
) -> Result<AliasResolver<HttpEntityAdapter<T>, T>> {
    let store = JsonEntityStore::open(cache_dir, T::KIND).await?;
    let adapter = Arc::new(HttpEntityAdapter::new(
        client.clone(),
        store,
        Arc::clone(credentials),
    ));
    let entity_adapter: Arc<dyn EntityAdapter<LocalId, T>> = adapter.clone();
    let source = EntitySource::new(entity_adapter, config);
    Ok(AliasResolver::new(adapter, source))
}

/// One resolver per entity kind, sharing the HTTP client and credentials.
pub struct Services {
    pub schools: SchoolResolver,
    pub groups: GroupResolver,
    pub subject_instances: SubjectInstanceResolver,
}

impl Services {
    pub async fn open(config: &Config, credentials: Arc<dyn CredentialSource>) -> Result<Self> {
        let cache_dir = config.cache_dir()?;
        Self::open_at(config, &cache_dir, credentials).await
    }

    /// Like `open`, storing entities under `cache_dir`.
    pub async fn open_at(
        config: &Config,
        cache_dir: &Path,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self> {
        let client = ApiClient::new(&config.api_base_url())?;
        let source_config = config.source_config();
        info!(api = %client.base_url(), cache_dir = %cache_dir.display(), "Opening services");

        Ok(Self {
            schools: resolver(&client, cache_dir, &credentials, source_config).await?,
            groups: resolver(&client, cache_dir, &credentials, source_config).await?,
            subject_instances: resolver(&client, cache_dir, &credentials, source_config).await?,
        })
    }

    /// Drop every cached and persisted entity of every kind.
    pub async fn clear_cache(&self) -> Result<()> {
        self.schools.source().invalidate_all();
        self.groups.source().invalidate_all();
        self.subject_instances.source().invalidate_all();

        self.schools.adapter().store().clear().await?;
        self.groups.adapter().store().clear().await?;
        self.subject_instances.adapter().store().clear().await?;
        info!("Cleared entity cache");
        Ok(())
    }

    /// Let downloads and refreshes that already started finish persisting.
    pub async fn shutdown(&self) {
        tokio::join!(
            self.schools.shutdown(),
            self.groups.shutdown(),
            self.subject_instances.shutdown(),
        );
        debug!("Services drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::ProviderId;
    use crate::auth::MemoryCredentials;
    use crate::resolution::AliasState;
    use crate::source::RefreshPolicy;
    use std::path::PathBuf;

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("schoolcache-test-{}-{}", name, uuid::Uuid::new_v4()))
    }

    fn school_alias() -> Alias {
        Alias::new(ProviderId::Sp24, "12345", 1)
    }

    fn group_alias() -> Alias {
        Alias::new(ProviderId::Sp24, "12345/9c", 1)
    }

    fn group() -> Group {
        Group {
            id: None,
            name: "9c".to_string(),
            school: school_alias(),
            aliases: vec![group_alias(), Alias::new(ProviderId::Vpp, "77", 1)],
        }
    }

    async fn adapter(dir: &Path, credentials: Arc<MemoryCredentials>) -> HttpEntityAdapter<Group> {
        // Unroutable: tests never reach the network
        let client = ApiClient::new("http://127.0.0.1:9/api").expect("client");
        let store = JsonEntityStore::open(dir, Group::KIND).await.expect("open store");
        HttpEntityAdapter::new(client, store, credentials)
    }

    #[tokio::test]
    async fn test_persist_download_attaches_all_aliases() {
        let dir = scratch_dir("persist");
        let adapter = adapter(&dir, Arc::new(MemoryCredentials::default())).await;

        let entity = group();
        let aliases = entity.aliases();
        let id = adapter
            .persist_downloaded_entity(Downloaded { entity, aliases })
            .await
            .expect("persist");

        assert_eq!(adapter.resolve_alias_to_local_id(&group_alias()).await.expect("resolve"), Some(id));
        assert_eq!(AliasAdapter::aliases_of(&adapter, id).await.expect("aliases").len(), 2);

        let stored = adapter.fetch_from_local(&id).await.expect("load").expect("stored");
        assert_eq!(stored.id, Some(id));
        assert!(adapter.linked_entity_ids(&stored).contains(&school_alias().to_string()));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_stored_entity_carries_unioned_aliases() {
        let dir = scratch_dir("union");
        let adapter = adapter(&dir, Arc::new(MemoryCredentials::default())).await;

        let entity = group();
        let aliases = entity.aliases();
        let id = adapter
            .persist_downloaded_entity(Downloaded { entity, aliases })
            .await
            .expect("persist");

        // Another provider reports the group under a known and a new alias
        let schulverwalter = Alias::new(ProviderId::Schulverwalter, "sv-9c", 1);
        let entity = Group {
            aliases: vec![Alias::new(ProviderId::Vpp, "77", 1), schulverwalter.clone()],
            ..group()
        };
        let aliases = entity.aliases();
        let again = adapter
            .persist_downloaded_entity(Downloaded { entity, aliases })
            .await
            .expect("persist");
        assert_eq!(again, id);

        let stored = adapter.fetch_from_local(&id).await.expect("load").expect("stored");
        let table: Vec<Alias> = AliasAdapter::aliases_of(&adapter, id)
            .await
            .expect("aliases")
            .into_iter()
            .collect();
        assert_eq!(stored.aliases, table);
        assert_eq!(stored.aliases.len(), 3);
        assert!(stored.aliases.contains(&group_alias()));
        assert!(stored.aliases.contains(&schulverwalter));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_prerequisite_needs_school_credentials() {
        let dir = scratch_dir("prerequisite");
        let credentials = Arc::new(MemoryCredentials::default());
        let adapter = adapter(&dir, Arc::clone(&credentials)).await;

        assert!(matches!(
            adapter.prerequisite(&group_alias()).await,
            Err(FetchError::NotFound(_))
        ));

        credentials.insert(
            "12345",
            SchoolCredentials {
                username: "schueler".to_string(),
                password: "secret".to_string(),
            },
        );
        let found = adapter.prerequisite(&group_alias()).await.expect("credentials");
        assert_eq!(found.username, "schueler");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_remote_fetch_without_alias_is_not_found() {
        let dir = scratch_dir("no-alias");
        let adapter = adapter(&dir, Arc::new(MemoryCredentials::default())).await;

        assert!(matches!(
            adapter.fetch_from_remote(&LocalId::new()).await,
            Err(FetchError::NotFound(_))
        ));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_save_rejects_aliases_of_another_entity() {
        let dir = scratch_dir("foreign");
        let adapter = adapter(&dir, Arc::new(MemoryCredentials::default())).await;

        let entity = group();
        let aliases = entity.aliases();
        adapter
            .persist_downloaded_entity(Downloaded { entity, aliases })
            .await
            .expect("persist");

        let err = adapter
            .save_to_local(&LocalId::new(), &group())
            .await
            .expect_err("foreign aliases");
        assert!(matches!(err.downcast_ref::<FetchError>(), Some(FetchError::Defect(_))));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_known_alias_resolves_offline() {
        let dir = scratch_dir("offline");
        let config = Config {
            api_base_url: Some("http://127.0.0.1:9/api".to_string()),
            ..Config::default()
        };
        let services = Services::open_at(&config, &dir, Arc::new(MemoryCredentials::default()))
            .await
            .expect("open services");

        let entity = group();
        let aliases = entity.aliases();
        let id = services
            .groups
            .adapter()
            .persist_downloaded_entity(Downloaded { entity, aliases })
            .await
            .expect("persist");

        let mut states = services
            .groups
            .resolve_with(group_alias(), RefreshPolicy::CacheOnly);
        match states.settled().await {
            Some(AliasState::Done(group)) => {
                assert_eq!(group.id, Some(id));
                assert_eq!(group.name, "9c");
            }
            other => panic!("unexpected state: {:?}", other),
        }

        services.shutdown().await;
        services.clear_cache().await.expect("clear");
        assert_eq!(
            services
                .groups
                .adapter()
                .resolve_alias_to_local_id(&group_alias())
                .await
                .expect("resolve"),
            None
        );

        let _ = std::fs::remove_dir_all(dir);
    }
}

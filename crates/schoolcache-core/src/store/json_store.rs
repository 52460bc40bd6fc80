use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::alias::{Alias, AliasTable, LocalId};
use crate::cache::CacheEntry;

/// Alias table file name inside a kind directory
const ALIAS_FILE: &str = "aliases.json";

/// File-backed store for one entity kind.
pub struct JsonEntityStore<T> {
    dir: PathBuf,
    aliases: Mutex<AliasTable>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonEntityStore<T> {
    /// Open (creating if needed) the store for `kind` under `cache_dir`.
    pub async fn open(cache_dir: &Path, kind: &str) -> Result<Self> {
        let dir = cache_dir.join(kind);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create store directory: {}", dir.display()))?;

        let alias_path = dir.join(ALIAS_FILE);
        let aliases = match tokio::fs::read_to_string(&alias_path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse alias table: {}", kind))?,
            Err(e) if e.kind() == ErrorKind::NotFound => AliasTable::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read alias table: {}", kind))
            }
        };
        debug!(kind, entities = aliases.len(), "Opened entity store");

        Ok(Self {
            dir,
            aliases: Mutex::new(aliases),
            _entity: PhantomData,
        })
    }

    fn entity_path(&self, id: LocalId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub async fn load(&self, id: LocalId) -> Result<Option<CacheEntry<T>>> {
        let path = self.entity_path(id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read entity file: {}", id)),
        };

        let entry: CacheEntry<T> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse entity file: {}", id))?;
        Ok(Some(entry))
    }

    pub async fn save(&self, id: LocalId, value: &T) -> Result<()> {
        let contents = serde_json::to_string_pretty(&CacheEntry::new(value))?;
        write_atomic(&self.entity_path(id), contents).await
    }

    pub async fn resolve(&self, alias: &Alias) -> Option<LocalId> {
        self.aliases.lock().await.resolve(alias)
    }

    pub async fn aliases_of(&self, id: LocalId) -> BTreeSet<Alias> {
        self.aliases
            .lock()
            .await
            .aliases_of(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Attach `aliases` to their entity (minting one if none is known) and
    /// persist the alias table.
    pub async fn register_aliases(&self, aliases: Vec<Alias>) -> Result<LocalId> {
        let mut table = self.aliases.lock().await;
        let id = table.register(aliases)?;
        let contents = serde_json::to_string_pretty(&*table)?;
        write_atomic(&self.dir.join(ALIAS_FILE), contents).await?;
        Ok(id)
    }

    /// Remove every entity and alias of this kind.
    pub async fn clear(&self) -> Result<()> {
        let mut table = self.aliases.lock().await;
        *table = AliasTable::new();
        tokio::fs::remove_dir_all(&self.dir)
            .await
            .or_else(|e| if e.kind() == ErrorKind::NotFound { Ok(()) } else { Err(e) })
            .with_context(|| format!("Failed to clear store: {}", self.dir.display()))?;
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }
}

/// Write through a temp file so readers never see a half-written file.
async fn write_atomic(path: &Path, contents: String) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::ProviderId;
    use crate::error::FetchError;

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("schoolcache-test-{}-{}", name, uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = scratch_dir("save");
        let store: JsonEntityStore<Vec<String>> =
            JsonEntityStore::open(&dir, "groups").await.expect("open");
        let id = LocalId::new();

        assert!(store.load(id).await.expect("load").is_none());
        store.save(id, &vec!["9c".to_string()]).await.expect("save");
        let entry = store.load(id).await.expect("load").expect("present");
        assert_eq!(entry.value, vec!["9c".to_string()]);
        assert_eq!(entry.age_display(), "just now");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_alias_table_survives_reopen() {
        let dir = scratch_dir("aliases");
        let alias = Alias::new(ProviderId::Sp24, "12345/9c", 1);

        let store: JsonEntityStore<String> =
            JsonEntityStore::open(&dir, "groups").await.expect("open");
        let id = store.register_aliases(vec![alias.clone()]).await.expect("register");
        drop(store);

        let reopened: JsonEntityStore<String> =
            JsonEntityStore::open(&dir, "groups").await.expect("reopen");
        assert_eq!(reopened.resolve(&alias).await, Some(id));
        assert!(reopened.aliases_of(id).await.contains(&alias));

        reopened.clear().await.expect("clear");
        assert_eq!(reopened.resolve(&alias).await, None);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_conflicting_registration_surfaces_defect() {
        let dir = scratch_dir("conflict");
        let store: JsonEntityStore<String> =
            JsonEntityStore::open(&dir, "schools").await.expect("open");
        let a = Alias::new(ProviderId::Sp24, "1", 1);
        let b = Alias::new(ProviderId::Sp24, "2", 1);
        store.register_aliases(vec![a.clone()]).await.expect("register");
        store.register_aliases(vec![b.clone()]).await.expect("register");

        let err = store.register_aliases(vec![a, b]).await.expect_err("conflict");
        assert!(matches!(err.downcast_ref::<FetchError>(), Some(FetchError::Defect(_))));

        let _ = std::fs::remove_dir_all(dir);
    }
}

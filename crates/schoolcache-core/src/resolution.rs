//! Alias resolution: turn an external identifier into a locally stable
//! entity, downloading and persisting it on first sight.
//!
//! The same protocol serves schools, groups, subject instances and any other
//! entity type that a provider hands out aliases for:
//!
//! 1. Look the alias up locally. If known, stream the entity from the
//!    `EntitySource` keyed by its `LocalId`.
//! 2. Otherwise resolve the credentials needed for the download, download by
//!    alias, persist with every alias the remote returned, verify that the
//!    requested alias is now attached, then stream as in step 1.
//!
//! Downloads are coordinated per alias, so concurrent resolutions of an
//! unknown alias trigger exactly one download.

use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::alias::{Alias, LocalId};
use crate::coordinator::FetchCoordinator;
use crate::error::FetchError;
use crate::source::{EntitySource, EntityValue, RefreshPolicy, SourceState};

/// Buffer size for per-resolution state channels.
/// States are tiny and conflated upstream, a handful is plenty.
const STATE_CHANNEL_BUFFER: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum AliasState<T> {
    Loading,
    Done(T),
    /// The remote confirmed that nothing exists under this alias.
    NotExisting,
    Error(FetchError),
}

impl<T> AliasState<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AliasState::Loading)
    }

    pub fn into_result(self) -> std::result::Result<Option<T>, FetchError> {
        match self {
            AliasState::Done(data) => Ok(Some(data)),
            AliasState::NotExisting => Ok(None),
            AliasState::Error(e) => Err(e),
            AliasState::Loading => Err(FetchError::Defect(
                "resolution has not finished yet".to_string(),
            )),
        }
    }

    fn from_source(state: SourceState<T>) -> Self {
        match state {
            SourceState::Loading { .. } => AliasState::Loading,
            SourceState::Success { data, .. } => AliasState::Done(data),
            SourceState::NotFound { .. } => AliasState::NotExisting,
            SourceState::Error { cause, .. } => AliasState::Error(cause),
        }
    }
}

/// A remote entity as downloaded, with every alias the remote knows it by.
#[derive(Debug, Clone)]
pub struct Downloaded<D> {
    pub entity: D,
    pub aliases: Vec<Alias>,
}

/// Alias-table and download surface for one entity type.
#[async_trait]
pub trait AliasAdapter: Send + Sync + 'static {
    type Dto: Send + Sync + 'static;
    /// Identity needed to authenticate a download, e.g. school credentials.
    type Credentials: Send + Sync + 'static;

    async fn resolve_alias_to_local_id(&self, alias: &Alias) -> Result<Option<LocalId>>;

    async fn prerequisite(&self, alias: &Alias) -> std::result::Result<Self::Credentials, FetchError>;

    async fn download_by_alias(
        &self,
        alias: &Alias,
        credentials: &Self::Credentials,
    ) -> std::result::Result<Downloaded<Self::Dto>, FetchError>;

    /// Persist a download, attaching its aliases to an existing entity if any
    /// of them is already known. Aliases are only ever added.
    async fn persist_downloaded_entity(&self, downloaded: Downloaded<Self::Dto>) -> Result<LocalId>;

    async fn aliases_of(&self, id: LocalId) -> Result<BTreeSet<Alias>>;
}

/// Resolves aliases of one entity type into streams of that entity.
pub struct AliasResolver<A: AliasAdapter, T: EntityValue> {
    adapter: Arc<A>,
    source: EntitySource<LocalId, T>,
    downloads: Arc<FetchCoordinator<Alias, LocalId>>,
}

impl<A: AliasAdapter, T: EntityValue> Clone for AliasResolver<A, T> {
    fn clone(&self) -> Self {
        Self {
            adapter: Arc::clone(&self.adapter),
            source: self.source.clone(),
            downloads: Arc::clone(&self.downloads),
        }
    }
}

fn storage_error(e: anyhow::Error) -> FetchError {
    match e.downcast::<FetchError>() {
        Ok(fetch_error) => fetch_error,
        Err(e) => FetchError::Storage(format!("{:#}", e)),
    }
}

impl<A: AliasAdapter, T: EntityValue> AliasResolver<A, T> {
    pub fn new(adapter: Arc<A>, source: EntitySource<LocalId, T>) -> Self {
        Self {
            adapter,
            source,
            downloads: Arc::new(FetchCoordinator::new()),
        }
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    pub fn source(&self) -> &EntitySource<LocalId, T> {
        &self.source
    }

    pub fn resolve(&self, alias: Alias) -> AliasStream<T> {
        self.resolve_with(alias, RefreshPolicy::default())
    }

    /// Like `resolve`, streaming the resolved entity under `policy`.
    pub fn resolve_with(&self, alias: Alias, policy: RefreshPolicy) -> AliasStream<T> {
        let (tx, rx) = mpsc::channel(STATE_CHANNEL_BUFFER);
        let resolver = self.clone();
        tokio::spawn(async move {
            resolver.run(alias, policy, tx).await;
        });
        AliasStream {
            states: ReceiverStream::new(rx),
        }
    }

    /// Local id for `alias`, downloading the entity if it is not known yet.
    pub async fn resolve_local_id(&self, alias: &Alias) -> std::result::Result<LocalId, FetchError> {
        match self
            .adapter
            .resolve_alias_to_local_id(alias)
            .await
            .map_err(storage_error)?
        {
            Some(id) => Ok(id),
            None => self.download(alias.clone()).await,
        }
    }

    async fn run(self, alias: Alias, policy: RefreshPolicy, tx: mpsc::Sender<AliasState<T>>) {
        let known = match self.adapter.resolve_alias_to_local_id(&alias).await {
            Ok(known) => known,
            Err(e) => {
                let _ = tx.send(AliasState::Error(storage_error(e))).await;
                return;
            }
        };

        let id = match known {
            Some(id) => id,
            None => {
                if tx.send(AliasState::Loading).await.is_err() {
                    return;
                }
                match self.download(alias.clone()).await {
                    Ok(id) => id,
                    Err(FetchError::NotFound(_)) => {
                        let _ = tx.send(AliasState::NotExisting).await;
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(AliasState::Error(e)).await;
                        return;
                    }
                }
            }
        };

        debug!(alias = %alias, local_id = %id, "Streaming resolved entity");
        let mut states = self.source.get(id, policy, false);
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                next = states.next() => match next {
                    Some(state) => {
                        if tx.send(AliasState::from_source(state)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    /// Coordinated download of an unknown alias.
    async fn download(&self, alias: Alias) -> std::result::Result<LocalId, FetchError> {
        let adapter = Arc::clone(&self.adapter);
        let requested = alias.clone();
        let id = self
            .downloads
            .coordinate_refresh(alias, move || async move {
                // Persisted by someone else since the caller looked
                if let Some(id) = adapter
                    .resolve_alias_to_local_id(&requested)
                    .await
                    .map_err(storage_error)?
                {
                    return Ok(id);
                }

                let credentials = adapter.prerequisite(&requested).await.map_err(|e| match e {
                    FetchError::NotFound(what) => {
                        debug!(alias = %requested, missing = %what, "Download prerequisite missing");
                        FetchError::Unauthorized
                    }
                    other => other,
                })?;

                let downloaded = adapter.download_by_alias(&requested, &credentials).await?;
                let alias_count = downloaded.aliases.len();
                let id = adapter
                    .persist_downloaded_entity(downloaded)
                    .await
                    .map_err(storage_error)?;

                let aliases = adapter.aliases_of(id).await.map_err(storage_error)?;
                if !aliases.contains(&requested) {
                    error!(
                        alias = %requested,
                        local_id = %id,
                        "Requested alias missing from persisted entity"
                    );
                    return Err(FetchError::Defect(format!(
                        "alias {} not attached to entity {} after download",
                        requested, id
                    )));
                }

                info!(alias = %requested, local_id = %id, alias_count, "Downloaded and persisted entity");
                Ok(id)
            })
            .await?;

        // The download may have replaced what is stored for an existing entity
        if let Err(e) = self.source.reload(&id).await {
            warn!(local_id = %id, error = %e, "Failed to reload downloaded entity");
            self.source.cache().invalidate(&id);
        }
        Ok(id)
    }

    /// Stop streaming and wait for running downloads and refreshes to
    /// finish persisting.
    pub async fn shutdown(&self) {
        self.downloads.drain().await;
        self.source.close();
        self.source.drain().await;
    }
}

/// Stream of resolution states for one alias.
pub struct AliasStream<T> {
    states: ReceiverStream<AliasState<T>>,
}

impl<T> AliasStream<T> {
    /// Wait for the first terminal state.
    pub async fn settled(&mut self) -> Option<AliasState<T>> {
        while let Some(state) = self.states.next().await {
            if state.is_terminal() {
                return Some(state);
            }
        }
        None
    }
}

impl<T> Stream for AliasStream<T> {
    type Item = AliasState<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.states).poll_next(cx)
    }
}

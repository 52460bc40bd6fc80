//! schoolcache core - offline-first access to school entities.
//!
//! Entities (schools, groups, subject instances) are addressed by provider
//! aliases, persisted locally under stable `LocalId`s, and served through
//! policy-driven streams that combine an in-memory cache, local storage and
//! the sync backend. Concurrent fetches of the same key are coordinated so
//! the remote is asked once.

pub mod alias;
pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod models;
pub mod resolution;
pub mod services;
pub mod source;
pub mod store;

pub use alias::{Alias, AliasTable, LocalId, ProviderId};
pub use cache::{CacheConfig, CacheEntry, EntityCache};
pub use config::Config;
pub use coordinator::FetchCoordinator;
pub use error::FetchError;
pub use resolution::{AliasAdapter, AliasResolver, AliasState, AliasStream, Downloaded};
pub use services::Services;
pub use source::{EntityAdapter, EntitySource, RefreshPolicy, SourceConfig, SourceState, SourceStream};

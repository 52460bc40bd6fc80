//! Data models for resolvable school entities.
//!
//! This module contains the entity types mirrored from the sync backend:
//!
//! - `School`: a school and its provider identities
//! - `Group`: a class or course group, linked to its school
//! - `SubjectInstance`: a subject taught to a group, linked to that group
//!
//! Every model carries the aliases the remote knows it by and is addressed
//! locally by the `LocalId` assigned when it was first persisted.

pub mod group;
pub mod school;
pub mod subject;

use std::collections::HashSet;

use serde::{de::DeserializeOwned, Serialize};

use crate::alias::{Alias, LocalId};

pub use group::Group;
pub use school::School;
pub use subject::SubjectInstance;

/// An entity type that can be downloaded by alias and stored locally.
pub trait RemoteEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Path segment on the sync backend and directory name in local storage.
    const KIND: &'static str;

    /// Every alias the remote reports for this entity.
    fn aliases(&self) -> Vec<Alias>;

    fn local_id(&self) -> Option<LocalId>;

    fn with_local_id(self, id: LocalId) -> Self;

    /// Replace the alias set, e.g. with the union known locally.
    fn with_aliases(self, aliases: Vec<Alias>) -> Self;

    /// Human-readable label for listings.
    fn display_name(&self) -> String;

    /// Nested entities whose loading state consumers may track.
    fn linked_ids(&self) -> HashSet<String> {
        HashSet::new()
    }
}

/// Scope of the credentials that authenticate downloads for `alias`.
///
/// Aliases are rooted at a school number (`12345` for the school itself,
/// `12345/9c` for a group of it), and credentials are stored per school.
pub fn credential_scope(alias: &Alias) -> &str {
    alias.value.split('/').next().unwrap_or(&alias.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::ProviderId;

    #[test]
    fn test_credential_scope() {
        assert_eq!(credential_scope(&Alias::new(ProviderId::Sp24, "12345", 1)), "12345");
        assert_eq!(credential_scope(&Alias::new(ProviderId::Sp24, "12345/9c", 1)), "12345");
        assert_eq!(
            credential_scope(&Alias::new(ProviderId::Sp24, "12345/9c/MA", 1)),
            "12345"
        );
    }
}

//! External identities and their mapping onto local entity ids.
//!
//! An [`Alias`] is an identifier issued by a remote provider. Any number of
//! aliases, even from different providers, can point at the same local
//! entity. The [`AliasTable`] owns that mapping and only ever grows an
//! entity's alias set, except through an explicit [`AliasTable::merge`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::FetchError;

/// Remote system that issued an alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    /// Stundenplan24 timetable exports
    Sp24,
    /// The first-party sync backend
    Vpp,
    /// Schulverwalter grade/homework platform
    Schulverwalter,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Sp24 => "sp24",
            ProviderId::Vpp => "vpp",
            ProviderId::Schulverwalter => "schulverwalter",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sp24" => Ok(ProviderId::Sp24),
            "vpp" => Ok(ProviderId::Vpp),
            "schulverwalter" => Ok(ProviderId::Schulverwalter),
            other => Err(anyhow::anyhow!("Unknown provider: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Alias {
    pub provider: ProviderId,
    pub value: String,
    pub version: i32,
}

impl Alias {
    pub fn new(provider: ProviderId, value: impl Into<String>, version: i32) -> Self {
        Self {
            provider,
            value: value.into(),
            version,
        }
    }
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@v{}", self.provider, self.value, self.version)
    }
}

/// Process-stable identifier of a locally persisted entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Mint a fresh id. Ids are random, so they are never reused.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for LocalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Bidirectional alias <-> local id table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "AliasTableRecord", into = "AliasTableRecord")]
pub struct AliasTable {
    entities: BTreeMap<LocalId, BTreeSet<Alias>>,
    index: HashMap<Alias, LocalId>,
}

/// On-disk shape: the reverse index is rebuilt on load.
#[derive(Serialize, Deserialize)]
struct AliasTableRecord {
    entities: BTreeMap<LocalId, BTreeSet<Alias>>,
}

impl From<AliasTableRecord> for AliasTable {
    fn from(record: AliasTableRecord) -> Self {
        let index = record
            .entities
            .iter()
            .flat_map(|(id, aliases)| aliases.iter().map(move |alias| (alias.clone(), *id)))
            .collect();
        Self {
            entities: record.entities,
            index,
        }
    }
}

impl From<AliasTable> for AliasTableRecord {
    fn from(table: AliasTable) -> Self {
        Self {
            entities: table.entities,
        }
    }
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, alias: &Alias) -> Option<LocalId> {
        self.index.get(alias).copied()
    }

    pub fn aliases_of(&self, id: LocalId) -> Option<&BTreeSet<Alias>> {
        self.entities.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Attach `aliases` to the entity they identify, minting a new id if none
    /// of them is known yet. The resulting alias set is the union of the old
    /// and the new aliases.
    ///
    /// Aliases that already point at two different entities are a conflict
    /// which only [`AliasTable::merge`] may resolve.
    pub fn register<I>(&mut self, aliases: I) -> Result<LocalId, FetchError>
    where
        I: IntoIterator<Item = Alias>,
    {
        let aliases: BTreeSet<Alias> = aliases.into_iter().collect();
        if aliases.is_empty() {
            return Err(FetchError::Defect(
                "cannot register an entity without aliases".to_string(),
            ));
        }

        let known: BTreeSet<LocalId> = aliases
            .iter()
            .filter_map(|alias| self.index.get(alias).copied())
            .collect();

        let id = match known.len() {
            0 => LocalId::new(),
            1 => known.into_iter().next().unwrap_or_default(),
            _ => {
                error!(
                    aliases = ?aliases,
                    entities = ?known,
                    "Aliases point at more than one local entity"
                );
                return Err(FetchError::Defect(format!(
                    "aliases span {} local entities",
                    known.len()
                )));
            }
        };

        let entry = self.entities.entry(id).or_default();
        for alias in aliases {
            self.index.insert(alias.clone(), id);
            entry.insert(alias);
        }
        debug!(local_id = %id, alias_count = entry.len(), "Registered aliases");
        Ok(id)
    }

    /// Fold `absorb` into `keep`; every alias of `absorb` now resolves to `keep`.
    pub fn merge(&mut self, keep: LocalId, absorb: LocalId) -> Result<(), FetchError> {
        if keep == absorb {
            return Ok(());
        }
        if !self.entities.contains_key(&keep) {
            return Err(FetchError::Defect(format!("unknown merge target {}", keep)));
        }
        let absorbed = self
            .entities
            .remove(&absorb)
            .ok_or_else(|| FetchError::Defect(format!("unknown merge source {}", absorb)))?;

        let entry = self.entities.entry(keep).or_default();
        for alias in absorbed {
            self.index.insert(alias.clone(), keep);
            entry.insert(alias);
        }
        Ok(())
    }
}

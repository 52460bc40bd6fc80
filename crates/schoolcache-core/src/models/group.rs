use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::RemoteEntity;
use crate::alias::{Alias, LocalId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<LocalId>,
    pub name: String,
    /// Alias of the owning school
    pub school: Alias,
    #[serde(default)]
    pub aliases: Vec<Alias>,
}

impl RemoteEntity for Group {
    const KIND: &'static str = "groups";

    fn aliases(&self) -> Vec<Alias> {
        self.aliases.clone()
    }

    fn local_id(&self) -> Option<LocalId> {
        self.id
    }

    fn with_local_id(mut self, id: LocalId) -> Self {
        self.id = Some(id);
        self
    }

    fn with_aliases(mut self, aliases: Vec<Alias>) -> Self {
        self.aliases = aliases;
        self
    }

    fn display_name(&self) -> String {
        self.name.clone()
    }

    fn linked_ids(&self) -> HashSet<String> {
        HashSet::from([self.school.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::ProviderId;

    #[test]
    fn test_parse_group() {
        let json = r#"{
            "name": "9c",
            "school": {"provider": "sp24", "value": "12345", "version": 1},
            "aliases": [
                {"provider": "sp24", "value": "12345/9c", "version": 1},
                {"provider": "vpp", "value": "77", "version": 1}
            ]
        }"#;

        let group: Group = serde_json::from_str(json).expect("Failed to parse group test JSON");
        assert_eq!(group.name, "9c");
        assert!(group.id.is_none());
        assert_eq!(group.aliases.len(), 2);
        assert_eq!(group.aliases[1].provider, ProviderId::Vpp);
        assert!(group.linked_ids().contains("sp24:12345@v1"));
    }
}

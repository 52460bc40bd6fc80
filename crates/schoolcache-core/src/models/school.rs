use serde::{Deserialize, Serialize};

use super::RemoteEntity;
use crate::alias::{Alias, LocalId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct School {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<LocalId>,
    pub name: String,
    #[serde(rename = "schoolNumber")]
    pub school_number: String,
    #[serde(default)]
    pub aliases: Vec<Alias>,
}

impl RemoteEntity for School {
    const KIND: &'static str = "schools";

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
        format!("{} ({})", self.name, self.school_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::ProviderId;

    #[test]
    fn test_parse_school() {
        let json = r#"{
            "name": "Gymnasium am Markt",
            "schoolNumber": "12345",
            "aliases": [{"provider": "sp24", "value": "12345", "version": 1}]
        }"#;

        let school: School = serde_json::from_str(json).expect("Failed to parse school test JSON");
        assert_eq!(school.display_name(), "Gymnasium am Markt (12345)");
        assert_eq!(school.aliases()[0].provider, ProviderId::Sp24);
    }
}

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::RemoteEntity;
use crate::alias::{Alias, LocalId};

/// A subject as taught to one group, e.g. maths in 9c by a given teacher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectInstance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<LocalId>,
    pub subject: String,
    #[serde(default)]
    pub teacher: Option<String>,
    #[serde(default)]
    pub course: Option<String>,
    /// Alias of the group this subject is taught to
    pub group: Alias,
    #[serde(default)]
    pub aliases: Vec<Alias>,
}

impl RemoteEntity for SubjectInstance {
    const KIND: &'static str = "subject-instances";

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
        match &self.teacher {
            Some(teacher) if !teacher.is_empty() => format!("{} ({})", self.subject, teacher),
            _ => self.subject.clone(),
        }
    }

    fn linked_ids(&self) -> HashSet<String> {
        HashSet::from([self.group.to_string()])
    }
}

//! Secrets and variables exposed to tasks.

use serde::{Deserialize, Serialize};

use crate::{OwnerId, RepoId};

/// Where a secret or variable is defined. Repository entries shadow owner
/// entries of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Owner(OwnerId),
    Repository(RepoId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub level: Level,
    pub name: String,
    #[serde(skip_serializing)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub level: Level,
    pub name: String,
    pub value: String,
}

/// Merge owner and repository entries into one map; repository entries win.
pub fn merge_scoped<I>(entries: I) -> std::collections::BTreeMap<String, String>
where
    I: IntoIterator<Item = (Level, String, String)>,
{
    let mut entries: Vec<_> = entries.into_iter().collect();
    entries.sort_by_key(|(level, _, _)| matches!(level, Level::Repository(_)));
    entries
        .into_iter()
        .map(|(_, name, value)| (name, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_entries_shadow_owner_entries() {
        let merged = merge_scoped([
            (Level::Repository(RepoId::new(1)), "TOKEN".to_string(), "repo".to_string()),
            (Level::Owner(OwnerId::new(1)), "TOKEN".to_string(), "org".to_string()),
            (Level::Owner(OwnerId::new(1)), "REGION".to_string(), "eu".to_string()),
        ]);
        assert_eq!(merged["TOKEN"], "repo");
        assert_eq!(merged["REGION"], "eu");
    }
}

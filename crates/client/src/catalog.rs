//! Character catalog: maps a character id to its display metadata and the
//! server-side model/tool configuration.

use serde::{Deserialize, Serialize};

/// A configured AI persona
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Tools the server lets this character call. Empty means unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CharacterProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            model: None,
            tools: Vec::new(),
            avatar: None,
            description: None,
        }
    }

    pub fn allows_tool(&self, tool_name: &str) -> bool {
        self.tools.is_empty() || self.tools.iter().any(|t| t == tool_name)
    }

    /// Placeholder used when the catalog has no entry for an id.
    pub fn unknown(id: &str) -> Self {
        Self::new(id, id)
    }
}

pub trait CharacterCatalog: Send + Sync {
    fn get(&self, character_id: &str) -> Option<CharacterProfile>;

    /// All characters in catalog order.
    fn list(&self) -> Vec<CharacterProfile>;
}

/// Catalog backed by a fixed list (usually the `[[characters]]` config table).
#[derive(Debug, Clone, Default)]
pub struct StaticCharacterCatalog {
    characters: Vec<CharacterProfile>,
}

impl StaticCharacterCatalog {
    pub fn new(characters: Vec<CharacterProfile>) -> Self {
        Self { characters }
    }
}

impl CharacterCatalog for StaticCharacterCatalog {
    fn get(&self, character_id: &str) -> Option<CharacterProfile> {
        self.characters
            .iter()
            .find(|c| c.id == character_id)
            .cloned()
    }

    fn list(&self) -> Vec<CharacterProfile> {
        self.characters.clone()
    }
}

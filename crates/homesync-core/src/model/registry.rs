// ── Registry records ──
//
// Plain value types. Relationships are foreign-key ids only; joined views
// ("entities in area X") are answered by the registry cache's indices.

use serde::{Deserialize, Serialize};

use super::entity_id::EntityId;

/// Entity registry entry: hub-side metadata about one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRegistration {
    pub entity_id: EntityId,
    pub name: Option<String>,
    pub original_name: Option<String>,
    pub platform: Option<String>,
    pub icon: Option<String>,
    pub device_id: Option<String>,
    pub area_id: Option<String>,
    pub label_ids: Vec<String>,
    pub disabled: bool,
    pub hidden: bool,
}

impl EntityRegistration {
    /// User-set name, falling back to the integration-provided one.
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().or(self.original_name.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: Option<String>,
    pub name_by_user: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub sw_version: Option<String>,
    pub hw_version: Option<String>,
    pub serial_number: Option<String>,
    pub configuration_url: Option<String>,
    pub via_device_id: Option<String>,
    pub area_id: Option<String>,
    pub label_ids: Vec<String>,
}

impl Device {
    pub fn display_name(&self) -> Option<&str> {
        self.name_by_user.as_deref().or(self.name.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    pub id: String,
    pub name: String,
    pub floor_id: Option<String>,
    pub label_ids: Vec<String>,
    pub icon: Option<String>,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Floor {
    pub id: String,
    pub name: String,
    pub level: Option<i32>,
    pub icon: Option<String>,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
    pub color: Option<String>,
    pub icon: Option<String>,
    pub description: Option<String>,
}

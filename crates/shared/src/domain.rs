use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Route parameter value that marks an entity which has not been persisted yet.
pub const NEW_ENTITY_SENTINEL: &str = "new";

/// Key under which a [`DependencyRef`] is serialized inside action payloads.
pub const DEPENDS_ON_KEY: &str = "$dependsOn";

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(CategoryId);
id_newtype!(CategoryUserId);
id_newtype!(PlaylistId);
id_newtype!(MediaEntryId);

/// Identity of the entity an editor is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityId {
    New,
    Existing(i64),
}

impl EntityId {
    pub fn is_new(&self) -> bool {
        matches!(self, EntityId::New)
    }

    pub fn existing(&self) -> Option<i64> {
        match self {
            EntityId::New => None,
            EntityId::Existing(id) => Some(*id),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::New => f.write_str(NEW_ENTITY_SENTINEL),
            EntityId::Existing(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid entity id '{0}'")]
pub struct InvalidEntityId(pub String);

impl FromStr for EntityId {
    type Err = InvalidEntityId;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case(NEW_ENTITY_SENTINEL) {
            return Ok(EntityId::New);
        }
        raw.parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .map(EntityId::Existing)
            .ok_or_else(|| InvalidEntityId(raw.to_string()))
    }
}

/// "Use `field` of the result produced by batch entry `request`."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRef {
    #[serde(rename = "$dependsOn")]
    target: DependencyTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DependencyTarget {
    request: usize,
    field: String,
}

impl DependencyRef {
    pub fn new(request: usize, field: impl Into<String>) -> Self {
        Self {
            target: DependencyTarget {
                request,
                field: field.into(),
            },
        }
    }

    pub fn request(&self) -> usize {
        self.target.request
    }

    pub fn field(&self) -> &str {
        &self.target.field
    }
}

/// A reference to another entity: either a known id or a same-batch forward reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityRef {
    Id(i64),
    Dependency(DependencyRef),
}

impl EntityRef {
    pub fn id(&self) -> Option<i64> {
        match self {
            EntityRef::Id(id) => Some(*id),
            EntityRef::Dependency(_) => None,
        }
    }
}

impl From<i64> for EntityRef {
    fn from(value: i64) -> Self {
        EntityRef::Id(value)
    }
}

impl From<DependencyRef> for EntityRef {
    fn from(value: DependencyRef) -> Self {
        EntityRef::Dependency(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Category,
    CategoryUser,
    Playlist,
    MediaEntry,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Category => "category",
            EntityKind::CategoryUser => "category_user",
            EntityKind::Playlist => "playlist",
            EntityKind::MediaEntry => "media_entry",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Manager,
    Moderator,
    Contributor,
    #[default]
    Member,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Category {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CategoryId>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy_context: Option<String>,
    #[serde(default = "default_true")]
    pub appear_in_list: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CategoryUserId>,
    pub category_id: EntityRef,
    pub user_id: String,
    #[serde(default)]
    pub permission_level: PermissionLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Playlist {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PlaylistId>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub entry_ids: Vec<MediaEntryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEntry {
    pub id: MediaEntryId,
    pub name: String,
    #[serde(default)]
    pub duration_secs: u32,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_parses_sentinel_and_numeric_ids() {
        assert_eq!("new".parse::<EntityId>(), Ok(EntityId::New));
        assert_eq!(" 42 ".parse::<EntityId>(), Ok(EntityId::Existing(42)));
        assert!("0".parse::<EntityId>().is_err());
        assert!("abc".parse::<EntityId>().is_err());
        assert_eq!(EntityId::New.to_string(), "new");
    }

    #[test]
    fn entity_ref_serializes_dependency_marker() {
        let dependency = EntityRef::from(DependencyRef::new(0, "id"));
        let json = serde_json::to_value(&dependency).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({ "$dependsOn": { "request": 0, "field": "id" } })
        );

        let parsed: EntityRef = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, dependency);
        let plain: EntityRef = serde_json::from_value(serde_json::json!(7)).expect("id");
        assert_eq!(plain.id(), Some(7));
    }
}

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::{
    domain::{Category, EntityId, EntityKind, EntityRef, Playlist},
    protocol::ServiceAction,
};

/// A remote record type that can be bound to an editor.
pub trait EditableRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;
    /// Route of the list view that owns this record type.
    const LIST_PATH: &'static str;

    fn record_id(&self) -> Option<i64>;

    fn title(&self) -> &str;

    /// Payload sent with add/update actions. Server-managed fields are left to the server.
    fn save_value(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)
            .with_context(|| format!("failed to encode {} draft", Self::KIND))?;
        if let Value::Object(fields) = &mut value {
            fields.remove("id");
            fields.remove("updated_at");
        }
        Ok(value)
    }

    fn edit_path(id: i64) -> String {
        format!("{}/{id}", Self::LIST_PATH)
    }
}

impl EditableRecord for Category {
    const KIND: EntityKind = EntityKind::Category;
    const LIST_PATH: &'static str = "/content/categories";

    fn record_id(&self) -> Option<i64> {
        self.id.map(|id| id.0)
    }

    fn title(&self) -> &str {
        &self.name
    }
}

impl EditableRecord for Playlist {
    const KIND: EntityKind = EntityKind::Playlist;
    const LIST_PATH: &'static str = "/content/playlists";

    fn record_id(&self) -> Option<i64> {
        self.id.map(|id| id.0)
    }

    fn title(&self) -> &str {
        &self.name
    }
}

/// The entity an editor currently holds. `value` is replaced wholesale, never mutated.
#[derive(Debug)]
pub struct EditableEntity<T> {
    pub id: EntityId,
    pub value: Option<Arc<T>>,
    pub is_new_data: bool,
}

impl<T> Clone for EditableEntity<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            value: self.value.clone(),
            is_new_data: self.is_new_data,
        }
    }
}

impl<T: EditableRecord> EditableEntity<T> {
    pub fn empty(id: EntityId) -> Self {
        Self {
            id,
            value: None,
            is_new_data: id.is_new(),
        }
    }

    pub fn loaded(id: EntityId, value: Arc<T>, is_new_data: bool) -> Self {
        Self {
            id,
            value: Some(value),
            is_new_data,
        }
    }

    pub fn get_action(id: i64) -> ServiceAction {
        ServiceAction::Get {
            kind: T::KIND,
            id: EntityRef::Id(id),
        }
    }

    /// The top-level action a save batch starts with: add for new data, update otherwise.
    pub fn save_action(&self, draft: &T) -> Result<ServiceAction> {
        let value = draft.save_value()?;
        Ok(match self.id {
            EntityId::New => ServiceAction::Add {
                kind: T::KIND,
                value,
            },
            EntityId::Existing(id) => ServiceAction::Update {
                kind: T::KIND,
                id: EntityRef::Id(id),
                value,
            },
        })
    }
}

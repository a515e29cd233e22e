use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{EntityKind, EntityRef},
    error::ApiError,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<i64>,
}

impl ListFilter {
    pub fn by_parent(parent_id: i64) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..Self::default()
        }
    }

    pub fn by_category(category_id: i64) -> Self {
        Self {
            category_id: Some(category_id),
            ..Self::default()
        }
    }

    pub fn by_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            ..Self::default()
        }
    }
}

/// One remote operation. Payload values are opaque JSON records of the named kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServiceAction {
    Get {
        kind: EntityKind,
        id: EntityRef,
    },
    List {
        kind: EntityKind,
        #[serde(default)]
        filter: ListFilter,
    },
    Add {
        kind: EntityKind,
        value: Value,
    },
    Update {
        kind: EntityKind,
        id: EntityRef,
        value: Value,
    },
    Delete {
        kind: EntityKind,
        id: EntityRef,
    },
}

impl ServiceAction {
    pub fn kind(&self) -> EntityKind {
        match self {
            ServiceAction::Get { kind, .. }
            | ServiceAction::List { kind, .. }
            | ServiceAction::Add { kind, .. }
            | ServiceAction::Update { kind, .. }
            | ServiceAction::Delete { kind, .. } => *kind,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServiceAction::Get { .. } => "get",
            ServiceAction::List { .. } => "list",
            ServiceAction::Add { .. } => "add",
            ServiceAction::Update { .. } => "update",
            ServiceAction::Delete { .. } => "delete",
        }
    }
}

/// Ordered actions evaluated together as one transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionBatch {
    pub actions: Vec<ServiceAction>,
}

impl ActionBatch {
    pub fn new(actions: Vec<ServiceAction>) -> Self {
        Self { actions }
    }

    pub fn single(action: ServiceAction) -> Self {
        Self {
            actions: vec![action],
        }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl ActionResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: ApiError) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, ApiError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiResponse {
    pub responses: Vec<ActionResponse>,
}

impl MultiResponse {
    pub fn has_errors(&self) -> bool {
        self.responses.iter().any(|response| response.error.is_some())
    }

    pub fn first_error(&self) -> Option<&ApiError> {
        self.responses
            .iter()
            .find_map(|response| response.error.as_ref())
    }

    /// `(batch index, error)` for every failed action, in batch order.
    pub fn errors(&self) -> Vec<(usize, ApiError)> {
        self.responses
            .iter()
            .enumerate()
            .filter_map(|(index, response)| response.error.clone().map(|error| (index, error)))
            .collect()
    }
}

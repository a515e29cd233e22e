use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use shared::{
    domain::{
        Category, CategoryId, CategoryUser, CategoryUserId, DependencyRef, EntityKind, EntityRef,
        MediaEntry, MediaEntryId, Playlist, PlaylistId, DEPENDS_ON_KEY,
    },
    error::{ApiError, ErrorCode},
    protocol::{ActionBatch, ActionResponse, ListFilter, MultiResponse, ServiceAction},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// In-memory catalogue that evaluates action batches as all-or-nothing transactions.
#[derive(Clone, Default)]
pub struct CatalogService {
    catalog: Arc<Mutex<Catalog>>,
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    last_id: i64,
    categories: BTreeMap<i64, Category>,
    category_users: BTreeMap<i64, CategoryUser>,
    playlists: BTreeMap<i64, Playlist>,
    media_entries: BTreeMap<i64, MediaEntry>,
}

impl CatalogService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every action in order against a working copy and commits it only if
    /// all of them succeeded.
    pub async fn execute(&self, batch: &ActionBatch) -> MultiResponse {
        let mut catalog = self.catalog.lock().await;
        let mut working = catalog.clone();
        let mut results: Vec<Result<Value, ApiError>> = Vec::with_capacity(batch.len());

        for (index, action) in batch.actions.iter().enumerate() {
            let outcome = resolve_dependencies(index, action, &results)
                .and_then(|resolved| working.apply(resolved));
            if let Err(error) = &outcome {
                debug!(index, action = action.name(), kind = %action.kind(), %error, "action failed");
            }
            results.push(outcome);
        }

        let committed = results.iter().all(Result::is_ok);
        if committed {
            *catalog = working;
            info!(actions = batch.len(), "batch committed");
        } else {
            warn!(actions = batch.len(), "batch rejected; catalogue left unchanged");
        }

        MultiResponse {
            responses: results
                .into_iter()
                .map(|outcome| match outcome {
                    Ok(value) => ActionResponse::ok(value),
                    Err(error) => ActionResponse::failed(error),
                })
                .collect(),
        }
    }

    /// Fills an empty catalogue with a small category tree, media entries and one playlist.
    pub async fn seed_demo_data(&self) -> Result<(), ApiError> {
        let batch = ActionBatch::new(vec![
            add(EntityKind::Category, serde_json::json!({ "name": "Sports", "tags": ["live"] })),
            add(
                EntityKind::Category,
                serde_json::json!({ "name": "Football", "parent_id": dependency(0) }),
            ),
            add(
                EntityKind::Category,
                serde_json::json!({ "name": "Tennis", "parent_id": dependency(0) }),
            ),
            add(
                EntityKind::CategoryUser,
                serde_json::json!({ "category_id": dependency(0), "user_id": "editor@example.com", "permission_level": "manager" }),
            ),
            add(EntityKind::MediaEntry, serde_json::json!({ "name": "Opening match", "duration_secs": 5400 })),
            add(EntityKind::MediaEntry, serde_json::json!({ "name": "Highlights", "duration_secs": 600 })),
            add(EntityKind::MediaEntry, serde_json::json!({ "name": "Interviews", "duration_secs": 900 })),
            add(
                EntityKind::Playlist,
                serde_json::json!({ "name": "Weekend", "entry_ids": [dependency(4), dependency(5)] }),
            ),
        ]);
        match self.execute(&batch).await.first_error() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

fn add(kind: EntityKind, value: Value) -> ServiceAction {
    ServiceAction::Add { kind, value }
}

fn dependency(request: usize) -> Value {
    serde_json::to_value(DependencyRef::new(request, "id")).unwrap_or(Value::Null)
}

/// Replaces every dependency marker in `action` with the referenced field of an
/// earlier, successful result.
fn resolve_dependencies(
    index: usize,
    action: &ServiceAction,
    results: &[Result<Value, ApiError>],
) -> Result<ServiceAction, ApiError> {
    let mut raw = serde_json::to_value(action).map_err(internal)?;
    resolve_value(index, &mut raw, results)?;
    serde_json::from_value(raw).map_err(|err| {
        ApiError::new(
            ErrorCode::Validation,
            format!("action {index} is malformed after dependency resolution: {err}"),
        )
    })
}

fn resolve_value(
    index: usize,
    value: &mut Value,
    results: &[Result<Value, ApiError>],
) -> Result<(), ApiError> {
    match value {
        Value::Object(map) if map.len() == 1 && map.contains_key(DEPENDS_ON_KEY) => {
            let reference: DependencyRef =
                serde_json::from_value(Value::Object(map.clone())).map_err(|err| {
                    ApiError::new(
                        ErrorCode::Validation,
                        format!("malformed dependency in action {index}: {err}"),
                    )
                })?;
            *value = lookup_dependency(index, &reference, results)?;
            Ok(())
        }
        Value::Object(map) => map
            .values_mut()
            .try_for_each(|nested| resolve_value(index, nested, results)),
        Value::Array(items) => items
            .iter_mut()
            .try_for_each(|nested| resolve_value(index, nested, results)),
        _ => Ok(()),
    }
}

fn lookup_dependency(
    index: usize,
    reference: &DependencyRef,
    results: &[Result<Value, ApiError>],
) -> Result<Value, ApiError> {
    if reference.request() >= index {
        return Err(ApiError::new(
            ErrorCode::DependencyFailed,
            format!(
                "action {index} references batch entry {} which has not run yet",
                reference.request()
            ),
        ));
    }
    let produced = results[reference.request()].as_ref().map_err(|_| {
        ApiError::new(
            ErrorCode::DependencyFailed,
            format!(
                "action {index} depends on failed batch entry {}",
                reference.request()
            ),
        )
    })?;
    produced
        .get(reference.field())
        .filter(|field| !field.is_null())
        .cloned()
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::DependencyFailed,
                format!(
                    "batch entry {} produced no field '{}'",
                    reference.request(),
                    reference.field()
                ),
            )
        })
}

impl Catalog {
    fn apply(&mut self, action: ServiceAction) -> Result<Value, ApiError> {
        match action {
            ServiceAction::Get { kind, id } => {
                let id = concrete_id(&id)?;
                match kind {
                    EntityKind::Category => fetch(&self.categories, kind, id),
                    EntityKind::CategoryUser => fetch(&self.category_users, kind, id),
                    EntityKind::Playlist => fetch(&self.playlists, kind, id),
                    EntityKind::MediaEntry => fetch(&self.media_entries, kind, id),
                }
            }
            ServiceAction::List { kind, filter } => self.list(kind, &filter),
            ServiceAction::Add { kind, value } => self.add(kind, value),
            ServiceAction::Update { kind, id, value } => {
                let id = concrete_id(&id)?;
                self.update(kind, id, value)
            }
            ServiceAction::Delete { kind, id } => {
                let id = concrete_id(&id)?;
                self.delete(kind, id)?;
                Ok(Value::Null)
            }
        }
    }

    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn list(&self, kind: EntityKind, filter: &ListFilter) -> Result<Value, ApiError> {
        let matches_ids = |id: i64| filter.ids.is_empty() || filter.ids.contains(&id);
        match kind {
            EntityKind::Category => encode_all(self.categories.iter().filter(|(id, category)| {
                matches_ids(**id)
                    && filter.parent_id.map_or(true, |parent| {
                        category.parent_id.as_ref().and_then(EntityRef::id) == Some(parent)
                    })
            })),
            EntityKind::CategoryUser => {
                encode_all(self.category_users.iter().filter(|(id, user)| {
                    matches_ids(**id)
                        && filter
                            .category_id
                            .map_or(true, |category| user.category_id.id() == Some(category))
                }))
            }
            EntityKind::Playlist => {
                encode_all(self.playlists.iter().filter(|(id, _)| matches_ids(**id)))
            }
            EntityKind::MediaEntry => {
                // keep the caller's order so playlists can list their content as stored
                if filter.ids.is_empty() {
                    encode_all(self.media_entries.iter())
                } else {
                    let ordered: Vec<&MediaEntry> = filter
                        .ids
                        .iter()
                        .filter_map(|id| self.media_entries.get(id))
                        .collect();
                    serde_json::to_value(ordered).map_err(internal)
                }
            }
        }
    }

    fn add(&mut self, kind: EntityKind, value: Value) -> Result<Value, ApiError> {
        let id = self.next_id();
        match kind {
            EntityKind::Category => {
                let mut record: Category = decode(kind, value)?;
                record.id = Some(CategoryId(id));
                record.updated_at = Some(Utc::now());
                self.validate_category(id, &record)?;
                store(&mut self.categories, id, record)
            }
            EntityKind::CategoryUser => {
                let mut record: CategoryUser = decode(kind, value)?;
                record.id = Some(CategoryUserId(id));
                self.validate_category_user(id, &record)?;
                store(&mut self.category_users, id, record)
            }
            EntityKind::Playlist => {
                let mut record: Playlist = decode(kind, value)?;
                record.id = Some(PlaylistId(id));
                record.updated_at = Some(Utc::now());
                self.validate_playlist(&record)?;
                store(&mut self.playlists, id, record)
            }
            EntityKind::MediaEntry => {
                let mut object = into_object(kind, value)?;
                object.insert("id".into(), Value::from(id));
                let record: MediaEntry = decode(kind, Value::Object(object))?;
                require_name(kind, &record.name)?;
                store(&mut self.media_entries, id, record)
            }
        }
    }

    fn update(&mut self, kind: EntityKind, id: i64, value: Value) -> Result<Value, ApiError> {
        match kind {
            EntityKind::Category => {
                let mut record: Category = merge(&self.categories, kind, id, value)?;
                record.updated_at = Some(Utc::now());
                self.validate_category(id, &record)?;
                store(&mut self.categories, id, record)
            }
            EntityKind::CategoryUser => {
                let record: CategoryUser = merge(&self.category_users, kind, id, value)?;
                self.validate_category_user(id, &record)?;
                store(&mut self.category_users, id, record)
            }
            EntityKind::Playlist => {
                let mut record: Playlist = merge(&self.playlists, kind, id, value)?;
                record.updated_at = Some(Utc::now());
                self.validate_playlist(&record)?;
                store(&mut self.playlists, id, record)
            }
            EntityKind::MediaEntry => {
                let record: MediaEntry = merge(&self.media_entries, kind, id, value)?;
                require_name(kind, &record.name)?;
                store(&mut self.media_entries, id, record)
            }
        }
    }

    fn delete(&mut self, kind: EntityKind, id: i64) -> Result<(), ApiError> {
        let removed = match kind {
            EntityKind::Category => {
                let removed = self.categories.remove(&id).is_some();
                if removed {
                    self.category_users
                        .retain(|_, user| user.category_id.id() != Some(id));
                    let children: Vec<i64> = self
                        .categories
                        .iter()
                        .filter(|(_, child)| {
                            child.parent_id.as_ref().and_then(EntityRef::id) == Some(id)
                        })
                        .map(|(child_id, _)| *child_id)
                        .collect();
                    for child_id in children {
                        self.delete(kind, child_id)?;
                    }
                }
                removed
            }
            EntityKind::CategoryUser => self.category_users.remove(&id).is_some(),
            EntityKind::Playlist => self.playlists.remove(&id).is_some(),
            EntityKind::MediaEntry => {
                let removed = self.media_entries.remove(&id).is_some();
                for playlist in self.playlists.values_mut() {
                    playlist.entry_ids.retain(|entry| entry.0 != id);
                }
                removed
            }
        };
        if removed {
            Ok(())
        } else {
            Err(not_found(kind, id))
        }
    }

    fn validate_category(&self, id: i64, record: &Category) -> Result<(), ApiError> {
        require_name(EntityKind::Category, &record.name)?;
        match record.parent_id.as_ref() {
            Some(EntityRef::Id(parent)) if *parent == id => Err(ApiError::new(
                ErrorCode::Validation,
                "category cannot be its own parent",
            )),
            Some(EntityRef::Id(parent)) if !self.categories.contains_key(parent) => {
                Err(not_found(EntityKind::Category, *parent))
            }
            Some(EntityRef::Dependency(_)) => Err(ApiError::new(
                ErrorCode::DependencyFailed,
                "unresolved parent reference",
            )),
            _ => Ok(()),
        }
    }

    fn validate_category_user(&self, id: i64, record: &CategoryUser) -> Result<(), ApiError> {
        if record.user_id.trim().is_empty() {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "category user requires a user id",
            ));
        }
        let category_id = concrete_id(&record.category_id)?;
        if !self.categories.contains_key(&category_id) {
            return Err(not_found(EntityKind::Category, category_id));
        }
        let duplicate = self.category_users.iter().any(|(other_id, other)| {
            *other_id != id
                && other.category_id.id() == Some(category_id)
                && other.user_id == record.user_id
        });
        if duplicate {
            return Err(ApiError::new(
                ErrorCode::Conflict,
                format!(
                    "user '{}' is already assigned to category {category_id}",
                    record.user_id
                ),
            ));
        }
        Ok(())
    }

    fn validate_playlist(&self, record: &Playlist) -> Result<(), ApiError> {
        require_name(EntityKind::Playlist, &record.name)?;
        match record
            .entry_ids
            .iter()
            .find(|entry| !self.media_entries.contains_key(&entry.0))
        {
            Some(MediaEntryId(missing)) => Err(not_found(EntityKind::MediaEntry, *missing)),
            None => Ok(()),
        }
    }
}

fn concrete_id(reference: &EntityRef) -> Result<i64, ApiError> {
    reference.id().ok_or_else(|| {
        ApiError::new(
            ErrorCode::DependencyFailed,
            "unresolved same-batch dependency reference",
        )
    })
}

fn require_name(kind: EntityKind, name: &str) -> Result<(), ApiError> {
    if name.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("{kind} name cannot be empty"),
        ));
    }
    Ok(())
}

fn fetch<R: Serialize>(
    table: &BTreeMap<i64, R>,
    kind: EntityKind,
    id: i64,
) -> Result<Value, ApiError> {
    let record = table.get(&id).ok_or_else(|| not_found(kind, id))?;
    serde_json::to_value(record).map_err(internal)
}

fn encode_all<'a, R: Serialize + 'a>(
    records: impl Iterator<Item = (&'a i64, &'a R)>,
) -> Result<Value, ApiError> {
    let records: Vec<&R> = records.map(|(_, record)| record).collect();
    serde_json::to_value(records).map_err(internal)
}

fn store<R: Serialize>(
    table: &mut BTreeMap<i64, R>,
    id: i64,
    record: R,
) -> Result<Value, ApiError> {
    let encoded = serde_json::to_value(&record).map_err(internal)?;
    table.insert(id, record);
    Ok(encoded)
}

fn decode<R: DeserializeOwned>(kind: EntityKind, value: Value) -> Result<R, ApiError> {
    serde_json::from_value(value)
        .map_err(|err| ApiError::new(ErrorCode::Validation, format!("invalid {kind}: {err}")))
}

fn into_object(kind: EntityKind, value: Value) -> Result<Map<String, Value>, ApiError> {
    match value {
        Value::Object(object) => Ok(object),
        _ => Err(ApiError::new(
            ErrorCode::Validation,
            format!("{kind} payload must be an object"),
        )),
    }
}

/// Shallow merge of the provided fields over the stored record; `id` is immutable.
fn merge<R: Serialize + DeserializeOwned>(
    table: &BTreeMap<i64, R>,
    kind: EntityKind,
    id: i64,
    value: Value,
) -> Result<R, ApiError> {
    let existing = table.get(&id).ok_or_else(|| not_found(kind, id))?;
    let mut current = into_object(kind, serde_json::to_value(existing).map_err(internal)?)?;
    for (field, update) in into_object(kind, value)? {
        if field != "id" {
            current.insert(field, update);
        }
    }
    decode(kind, Value::Object(current))
}

fn not_found(kind: EntityKind, id: i64) -> ApiError {
    ApiError::new(ErrorCode::NotFound, format!("{kind} {id} not found"))
}

fn internal(err: impl std::fmt::Display) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

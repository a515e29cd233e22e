use std::sync::{Arc, Mutex, Weak};

use shared::domain::EntityId;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    collaborators::{ConfirmRequest, EditorCollaborators, NavigationGuardToken},
    entity::{EditableEntity, EditableRecord},
    error::{EditorError, WidgetFailure},
    lock,
    transport::Transport,
    widgets_manager::{SaveReadiness, WidgetsManager, WidgetsState},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorState {
    Loading,
    Loaded,
    LoadingFailed { error: EditorError },
    Saving,
    SavingFailed { error: EditorError },
    DataIsInvalid { error: EditorError },
    ActiveSectionBusy { error: EditorError },
    PrepareSavingFailed { error: EditorError },
}

impl EditorState {
    pub fn error(&self) -> Option<&EditorError> {
        match self {
            EditorState::Loading | EditorState::Loaded | EditorState::Saving => None,
            EditorState::LoadingFailed { error }
            | EditorState::SavingFailed { error }
            | EditorState::DataIsInvalid { error }
            | EditorState::ActiveSectionBusy { error }
            | EditorState::PrepareSavingFailed { error } => Some(error),
        }
    }

    /// States reached from a save attempt that leave the entity loaded and editable.
    pub fn is_save_error(&self) -> bool {
        matches!(
            self,
            EditorState::SavingFailed { .. }
                | EditorState::DataIsInvalid { .. }
                | EditorState::ActiveSectionBusy { .. }
                | EditorState::PrepareSavingFailed { .. }
        )
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, EditorState::Loading | EditorState::Saving)
    }

    pub fn name(&self) -> &'static str {
        match self {
            EditorState::Loading => "loading",
            EditorState::Loaded => "loaded",
            EditorState::LoadingFailed { .. } => "loading_failed",
            EditorState::Saving => "saving",
            EditorState::SavingFailed { .. } => "saving_failed",
            EditorState::DataIsInvalid { .. } => "data_is_invalid",
            EditorState::ActiveSectionBusy { .. } => "active_section_busy",
            EditorState::PrepareSavingFailed { .. } => "prepare_saving_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorStatus {
    pub state: EditorState,
    pub entity_id: Option<EntityId>,
    pub is_dirty: bool,
}

impl Default for EditorStatus {
    fn default() -> Self {
        Self {
            state: EditorState::Loading,
            entity_id: None,
            is_dirty: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    Failed,
    /// A later load or a destroy took over before this one finished.
    Superseded,
    /// "new" was requested without a pending record; the list view was opened instead.
    RedirectedToList,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    Blocked,
    Failed,
    NotLoaded,
    /// A load or another save is in progress.
    Ignored,
    /// A load or a destroy took over before the batch was submitted.
    Cancelled,
}

struct Inner {
    generation: u64,
    cancel: CancellationToken,
    guard: Option<NavigationGuardToken>,
    destroyed: bool,
}

/// State machine of one entity editor. Owns the entity for its lifetime and
/// mediates between the widgets, the transport and the navigation collaborators.
pub struct EditorStore<T: EditableRecord> {
    transport: Arc<dyn Transport>,
    widgets: Arc<WidgetsManager<T>>,
    collaborators: EditorCollaborators<T>,
    inner: Mutex<Inner>,
    load_lock: tokio::sync::Mutex<()>,
    status_tx: Mutex<Option<watch::Sender<EditorStatus>>>,
    status_rx: watch::Receiver<EditorStatus>,
    entity_tx: Mutex<Option<watch::Sender<EditableEntity<T>>>>,
    entity_rx: watch::Receiver<EditableEntity<T>>,
    dirty_tracker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: EditableRecord> EditorStore<T> {
    /// Must be called within a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        widgets: Arc<WidgetsManager<T>>,
        collaborators: EditorCollaborators<T>,
    ) -> Arc<Self> {
        let (status_tx, status_rx) = watch::channel(EditorStatus::default());
        let (entity_tx, entity_rx) = watch::channel(EditableEntity::empty(EntityId::New));
        let store = Arc::new(Self {
            transport,
            widgets,
            collaborators,
            inner: Mutex::new(Inner {
                generation: 0,
                cancel: CancellationToken::new(),
                guard: None,
                destroyed: false,
            }),
            load_lock: tokio::sync::Mutex::new(()),
            status_tx: Mutex::new(Some(status_tx)),
            status_rx,
            entity_tx: Mutex::new(Some(entity_tx)),
            entity_rx,
            dirty_tracker: Mutex::new(None),
        });

        let tracker = tokio::spawn(track_dirty(
            Arc::downgrade(&store),
            store.widgets.subscribe(),
        ));
        *lock(&store.dirty_tracker) = Some(tracker);
        store
    }

    pub fn status(&self) -> EditorStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EditorStatus> {
        self.status_rx.clone()
    }

    pub fn entity(&self) -> EditableEntity<T> {
        self.entity_rx.borrow().clone()
    }

    pub fn subscribe_entity(&self) -> watch::Receiver<EditableEntity<T>> {
        self.entity_rx.clone()
    }

    pub fn widgets(&self) -> &Arc<WidgetsManager<T>> {
        &self.widgets
    }

    pub fn collaborators(&self) -> &EditorCollaborators<T> {
        &self.collaborators
    }

    /// Unloads the current entity and loads `id`. A load started later cancels this
    /// one; nothing it produced is published after that point.
    pub async fn load(&self, id: EntityId) -> LoadOutcome {
        let (generation, cancel) = {
            let mut inner = lock(&self.inner);
            if inner.destroyed {
                return LoadOutcome::Destroyed;
            }
            inner.cancel.cancel();
            inner.generation += 1;
            inner.cancel = CancellationToken::new();
            (inner.generation, inner.cancel.clone())
        };

        let _serial = tokio::select! {
            guard = self.load_lock.lock() => guard,
            _ = cancel.cancelled() => return LoadOutcome::Superseded,
        };
        info!(entity = %T::KIND, entity_id = %id, generation, "loading entity");

        self.widgets.notify_data_loading(id);
        let started = self.publish_if_current(generation, |inner, status, entity| {
            self.release_guard(inner);
            *status = EditorStatus {
                state: EditorState::Loading,
                entity_id: Some(id),
                is_dirty: false,
            };
            *entity = Some(EditableEntity::empty(id));
        });
        if !started {
            return LoadOutcome::Superseded;
        }

        let fetched = match id {
            EntityId::New => match self.collaborators.creation.take_pending() {
                Some(value) => Ok((Arc::new(value), true)),
                None => {
                    info!(entity = %T::KIND, "no pending record for new entity, returning to list");
                    self.collaborators.navigator.navigate_to(T::LIST_PATH, &[]);
                    return LoadOutcome::RedirectedToList;
                }
            },
            EntityId::Existing(raw) => {
                let response = tokio::select! {
                    response = self.transport.request(EditableEntity::<T>::get_action(raw)) => response,
                    _ = cancel.cancelled() => return LoadOutcome::Superseded,
                };
                response
                    .map_err(|error| error.to_string())
                    .and_then(|value| {
                        serde_json::from_value::<T>(value)
                            .map_err(|error| format!("malformed {} record: {error}", T::KIND))
                    })
                    .map(|value| (Arc::new(value), false))
            }
        };

        let (data, is_new_data) = match fetched {
            Ok(fetched) => fetched,
            Err(message) => {
                warn!(entity = %T::KIND, entity_id = %id, error = %message, "failed to load entity");
                return self.finish_load(
                    generation,
                    EditorState::LoadingFailed {
                        error: EditorError::Load { message },
                    },
                );
            }
        };

        let published = self.publish_if_current(generation, |_, _, entity| {
            *entity = Some(EditableEntity::loaded(id, Arc::clone(&data), is_new_data));
        });
        if !published {
            return LoadOutcome::Superseded;
        }

        let outcome = tokio::select! {
            outcome = self.widgets.notify_data_loaded(data, is_new_data) => outcome,
            _ = cancel.cancelled() => return LoadOutcome::Superseded,
        };
        if outcome.has_errors() {
            return self.finish_load(
                generation,
                EditorState::LoadingFailed {
                    error: EditorError::WidgetActivation {
                        failures: outcome.errors,
                    },
                },
            );
        }
        self.finish_load(generation, EditorState::Loaded)
    }

    fn finish_load(&self, generation: u64, state: EditorState) -> LoadOutcome {
        let outcome = match state {
            EditorState::Loaded => LoadOutcome::Loaded,
            _ => LoadOutcome::Failed,
        };
        let name = state.name();
        if self.publish_if_current(generation, |_, status, _| status.state = state) {
            info!(entity = %T::KIND, state = name, "load finished");
            outcome
        } else {
            LoadOutcome::Superseded
        }
    }

    /// Retries the activation of a section that failed to load. The editor leaves
    /// `LoadingFailed` once no section is left in a failed state.
    pub async fn retry_section(&self, key: &str) -> Result<bool, WidgetFailure> {
        let generation = lock(&self.inner).generation;
        let retried = self.widgets.retry_activation(key).await;
        let failed = self.widgets.failed_keys();
        self.publish_if_current(generation, |_, status, _| {
            let EditorState::LoadingFailed {
                error: EditorError::WidgetActivation { failures },
            } = &mut status.state
            else {
                return;
            };
            failures.retain(|failure| failed.contains(&failure.key));
            if let Err(failure) = &retried {
                if let Some(existing) = failures.iter_mut().find(|f| f.key == failure.key) {
                    existing.message = failure.message.clone();
                }
            }
            if failures.is_empty() {
                status.state = EditorState::Loaded;
            }
        });
        retried
    }

    /// Runs the save pipeline. Blocked and failed saves leave the entity as it was;
    /// a successful save reloads the entity from the server.
    pub async fn save(&self) -> SaveOutcome {
        let mut snapshot = None;
        let mut refusal = SaveOutcome::Ignored;
        self.publish_unless_destroyed(|inner, status, entity_rx| {
            if status.state.is_in_progress() {
                return;
            }
            if !matches!(status.state, EditorState::Loaded) && !status.state.is_save_error() {
                refusal = SaveOutcome::NotLoaded;
                return;
            }
            let entity = entity_rx.borrow().clone();
            let Some(value) = entity.value.clone() else {
                refusal = SaveOutcome::NotLoaded;
                return;
            };
            status.state = EditorState::Saving;
            snapshot = Some((inner.generation, inner.cancel.clone(), entity, value));
        });
        let Some((generation, cancel, entity, value)) = snapshot else {
            debug!(entity = %T::KIND, outcome = ?refusal, "save not started");
            return refusal;
        };

        let transaction = tokio::select! {
            transaction = self.widgets.notify_data_saving((*value).clone(), &entity) => transaction,
            _ = cancel.cancelled() => return self.save_cancelled(),
        };
        let blocked = match transaction.readiness {
            SaveReadiness::Ready => None,
            SaveReadiness::BlockedByValidation { keys } => Some(EditorState::DataIsInvalid {
                error: EditorError::Validation { keys },
            }),
            SaveReadiness::BlockedByBusyWidget { keys } => Some(EditorState::ActiveSectionBusy {
                error: EditorError::Busy { keys },
            }),
            SaveReadiness::BlockedByBuildFailure { message } => {
                Some(EditorState::PrepareSavingFailed {
                    error: EditorError::SavePrepare { message },
                })
            }
        };
        if let Some(state) = blocked {
            info!(entity = %T::KIND, state = state.name(), "save blocked");
            self.publish_if_current(generation, |_, status, _| status.state = state);
            return SaveOutcome::Blocked;
        }

        if !self.is_current(generation) {
            return self.save_cancelled();
        }
        let actions = transaction.batch.len();
        info!(entity = %T::KIND, entity_id = %entity.id, actions, "submitting save");
        let submitted = tokio::select! {
            submitted = self.transport.multi_request(transaction.batch) => submitted,
            _ = cancel.cancelled() => return self.save_cancelled(),
        };
        let failures = match submitted {
            Err(error) => Err(vec![error.to_string()]),
            Ok(response) if response.has_errors() => Err(response
                .errors()
                .into_iter()
                .map(|(index, error)| format!("action {index}: {error}"))
                .collect()),
            Ok(response) => Ok(response),
        };
        let response = match failures {
            Ok(response) => response,
            Err(failures) => {
                warn!(entity = %T::KIND, failures = ?failures, "save rejected");
                self.publish_if_current(generation, |_, status, _| {
                    status.state = EditorState::SavingFailed {
                        error: EditorError::SaveTransaction { failures },
                    }
                });
                return SaveOutcome::Failed;
            }
        };

        let saved_id = match entity.id {
            EntityId::Existing(id) => Some(id),
            EntityId::New => response
                .responses
                .first()
                .and_then(|primary| primary.result.as_ref())
                .and_then(|result| result.get("id"))
                .and_then(|id| id.as_i64()),
        };
        let Some(saved_id) = saved_id else {
            warn!(entity = %T::KIND, "server did not return the id of the created record");
            self.publish_if_current(generation, |_, status, _| {
                status.state = EditorState::SavingFailed {
                    error: EditorError::SaveTransaction {
                        failures: vec!["created record has no id".into()],
                    },
                }
            });
            return SaveOutcome::Failed;
        };

        let current = self.publish_if_current(generation, |inner, status, _| {
            self.release_guard(inner);
            status.is_dirty = false;
        });
        if !current {
            return SaveOutcome::Saved;
        }
        info!(entity = %T::KIND, entity_id = saved_id, "entity saved");
        if entity.id.is_new() {
            self.collaborators
                .navigator
                .navigate_to(&T::edit_path(saved_id), &[]);
        }
        self.load(EntityId::Existing(saved_id)).await;
        SaveOutcome::Saved
    }

    /// Leaves the save error state and returns to the editable entity.
    pub fn dismiss_error(&self) -> bool {
        let mut dismissed = false;
        self.publish_unless_destroyed(|_, status, _| {
            if status.state.is_save_error() {
                status.state = EditorState::Loaded;
                dismissed = true;
            }
        });
        dismissed
    }

    /// Asks before discarding unsaved changes. Resolves immediately when nothing is dirty.
    pub async fn can_leave_without_saving(&self) -> bool {
        let is_dirty = self.status_rx.borrow().is_dirty || self.widgets.current_state().is_dirty;
        if !is_dirty {
            return true;
        }
        let accepted = self
            .collaborators
            .dialogs
            .confirm(ConfirmRequest::discard_changes())
            .await;
        if accepted {
            debug!(entity = %T::KIND, "unsaved changes discarded");
            self.publish_unless_destroyed(|inner, status, _| {
                self.release_guard(inner);
                status.is_dirty = false;
            });
        }
        accepted
    }

    /// Cancels outstanding work, releases the page exit guard and completes every stream.
    pub fn destroy(&self) {
        {
            let mut inner = lock(&self.inner);
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            inner.cancel.cancel();
            inner.generation += 1;
            self.release_guard(&mut inner);
        }
        if let Some(tracker) = lock(&self.dirty_tracker).take() {
            tracker.abort();
        }
        self.widgets.destroy();
        lock(&self.status_tx).take();
        lock(&self.entity_tx).take();
        debug!(entity = %T::KIND, "editor destroyed");
    }

    fn is_current(&self, generation: u64) -> bool {
        let inner = lock(&self.inner);
        !inner.destroyed && !inner.cancel.is_cancelled() && inner.generation == generation
    }

    fn save_cancelled(&self) -> SaveOutcome {
        debug!(entity = %T::KIND, "save abandoned, editor moved on");
        SaveOutcome::Cancelled
    }

    fn release_guard(&self, inner: &mut Inner) {
        if let Some(token) = inner.guard.take() {
            self.collaborators.exit_guard.remove(token);
        }
    }

    fn apply_dirty(&self, is_dirty: bool) {
        self.publish_unless_destroyed(|inner, status, _| {
            if status.state == EditorState::Loading {
                return;
            }
            if is_dirty && inner.guard.is_none() {
                inner.guard = Some(self.collaborators.exit_guard.add());
            } else if !is_dirty {
                self.release_guard(inner);
            }
            status.is_dirty = is_dirty;
        });
    }

    /// Applies `change` when `generation` is still the latest load and the store is alive.
    fn publish_if_current(
        &self,
        generation: u64,
        change: impl FnOnce(&mut Inner, &mut EditorStatus, &mut Option<EditableEntity<T>>),
    ) -> bool {
        let mut inner = lock(&self.inner);
        if inner.destroyed || inner.generation != generation {
            return false;
        }
        let mut status = self.status_rx.borrow().clone();
        let mut entity = None;
        change(&mut inner, &mut status, &mut entity);
        self.send(status, entity);
        true
    }

    fn publish_unless_destroyed(
        &self,
        change: impl FnOnce(&mut Inner, &mut EditorStatus, &watch::Receiver<EditableEntity<T>>),
    ) {
        let mut inner = lock(&self.inner);
        if inner.destroyed {
            return;
        }
        let mut status = self.status_rx.borrow().clone();
        change(&mut inner, &mut status, &self.entity_rx);
        self.send(status, None);
    }

    fn send(&self, status: EditorStatus, entity: Option<EditableEntity<T>>) {
        if let Some(entity) = entity {
            if let Some(tx) = lock(&self.entity_tx).as_ref() {
                tx.send_replace(entity);
            }
        }
        if let Some(tx) = lock(&self.status_tx).as_ref() {
            tx.send_if_modified(|current| {
                if *current == status {
                    return false;
                }
                *current = status;
                true
            });
        }
    }
}

impl<T: EditableRecord> Drop for EditorStore<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn track_dirty<T: EditableRecord>(
    store: Weak<EditorStore<T>>,
    mut widgets: watch::Receiver<WidgetsState>,
) {
    while widgets.changed().await.is_ok() {
        let is_dirty = widgets.borrow_and_update().is_dirty;
        let Some(store) = store.upgrade() else {
            break;
        };
        store.apply_dirty(is_dirty);
    }
}

#[cfg(test)]
#[path = "tests/editor_store_tests.rs"]
mod tests;

use std::sync::Arc;

use shared::domain::EntityId;
use tokio_stream::{wrappers::WatchStream, Stream, StreamExt};
use tracing::{debug, info};

use crate::{
    collaborators::PreferenceStore,
    editor_store::{EditorState, EditorStore, LoadOutcome, SaveOutcome},
    entity::EditableRecord,
    error::EditorError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionBadge {
    pub key: &'static str,
    pub is_active: bool,
    pub is_dirty: bool,
    pub is_valid: bool,
    pub is_busy: bool,
    pub failed: bool,
}

/// Dismissible notice shown above the editor after a save attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Banner {
    Invalid { sections: Vec<&'static str> },
    Busy { sections: Vec<&'static str> },
    PrepareFailed { message: String },
    SaveFailed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditView {
    Loading,
    LoadFailed {
        message: String,
        can_retry: bool,
        back_to_list: String,
        failed_sections: Vec<&'static str>,
    },
    Editor {
        title: String,
        is_new: bool,
        sections: Vec<SectionBadge>,
        is_dirty: bool,
        is_saving: bool,
        banner: Option<Banner>,
    },
}

const WAIT_FOR_OPERATION: &str = "Please wait for the current operation to complete.";

/// Presentation adapter over an [`EditorStore`]. Holds no state of its own apart
/// from the remembered section choice.
pub struct EditViewController<T: EditableRecord> {
    store: Arc<EditorStore<T>>,
    preferences: Arc<dyn PreferenceStore>,
}

impl<T: EditableRecord> EditViewController<T> {
    pub fn new(store: Arc<EditorStore<T>>, preferences: Arc<dyn PreferenceStore>) -> Self {
        Self { store, preferences }
    }

    pub fn store(&self) -> &Arc<EditorStore<T>> {
        &self.store
    }

    fn section_preference_key() -> String {
        format!("{}.lastSection", T::LIST_PATH)
    }

    pub async fn open(&self, id: EntityId) -> LoadOutcome {
        let outcome = self.store.load(id).await;
        if outcome == LoadOutcome::Loaded {
            self.restore_section();
        }
        outcome
    }

    /// Opens the entity named by the `id` route parameter. A missing or malformed
    /// parameter sends the user back to the list.
    pub async fn open_from_route(&self) -> LoadOutcome {
        let navigator = &self.store.collaborators().navigator;
        let parsed = navigator
            .route_param("id")
            .and_then(|raw| raw.parse::<EntityId>().ok());
        match parsed {
            Some(id) => self.open(id).await,
            None => {
                info!(entity = %T::KIND, "edit route without a valid id");
                navigator.navigate_to(T::LIST_PATH, &[]);
                LoadOutcome::RedirectedToList
            }
        }
    }

    pub fn view(&self) -> EditView {
        render(&self.store)
    }

    /// Emits the current view, then a new one on every status or section change.
    /// Completes once the store is destroyed.
    pub fn views(&self) -> impl Stream<Item = EditView> + Send + 'static {
        let store = Arc::clone(&self.store);
        let status = WatchStream::new(self.store.subscribe_status()).map(|_| ());
        let sections = WatchStream::new(self.store.widgets().subscribe()).map(|_| ());
        status.merge(sections).map(move |()| render(&store))
    }

    /// Presents section `key` and remembers it for the next editor of this type.
    pub fn select_section(&self, key: &str) -> bool {
        if !self.store.widgets().set_active_section(key) {
            return false;
        }
        self.preferences
            .set(&Self::section_preference_key(), key.to_string());
        true
    }

    /// Activates the remembered section, or the first attached one.
    pub fn restore_section(&self) -> Option<&'static str> {
        let widgets = self.store.widgets();
        let sections = widgets.current_state().sections;
        let remembered = self.preferences.get(&Self::section_preference_key());
        let key = sections
            .iter()
            .filter(|section| section.is_attached)
            .find(|section| remembered.as_deref() == Some(section.key))
            .or_else(|| sections.iter().find(|section| section.is_attached))
            .map(|section| section.key)?;
        widgets.set_active_section(key);
        debug!(entity = %T::KIND, section = key, "section restored");
        Some(key)
    }

    pub async fn save(&self) -> SaveOutcome {
        let outcome = self.store.save().await;
        if outcome == SaveOutcome::Ignored {
            self.store
                .collaborators()
                .dialogs
                .alert(WAIT_FOR_OPERATION)
                .await;
        }
        outcome
    }

    pub fn dismiss_banner(&self) -> bool {
        self.store.dismiss_error()
    }

    /// Repeats whatever made loading fail: the fetch, or the failed sections.
    pub async fn retry(&self) -> LoadOutcome {
        let status = self.store.status();
        match status.state {
            EditorState::LoadingFailed {
                error: EditorError::WidgetActivation { failures },
            } => {
                for failure in failures {
                    if self.store.retry_section(failure.key).await.is_err() {
                        return LoadOutcome::Failed;
                    }
                }
                if self.store.status().state == EditorState::Loaded {
                    self.restore_section();
                    LoadOutcome::Loaded
                } else {
                    LoadOutcome::Failed
                }
            }
            EditorState::LoadingFailed { .. } => match status.entity_id {
                Some(id) => self.open(id).await,
                None => LoadOutcome::Failed,
            },
            _ => LoadOutcome::Loaded,
        }
    }

    /// Navigates back to the list unless the user keeps unsaved changes.
    pub async fn close(&self) -> bool {
        if !self.store.can_leave_without_saving().await {
            return false;
        }
        self.store
            .collaborators()
            .navigator
            .navigate_to(T::LIST_PATH, &[]);
        true
    }
}

fn render<T: EditableRecord>(store: &EditorStore<T>) -> EditView {
    let status = store.status();
    let banner = match &status.state {
        EditorState::Loading => return EditView::Loading,
        EditorState::LoadingFailed { error } => {
            let failed_sections = match error {
                EditorError::WidgetActivation { failures } => {
                    failures.iter().map(|failure| failure.key).collect()
                }
                _ => Vec::new(),
            };
            return EditView::LoadFailed {
                message: error.to_string(),
                can_retry: error.is_retryable(),
                back_to_list: T::LIST_PATH.to_string(),
                failed_sections,
            };
        }
        EditorState::Loaded | EditorState::Saving => None,
        EditorState::DataIsInvalid { error } | EditorState::ActiveSectionBusy { error } => {
            match error {
                EditorError::Validation { keys } => Some(Banner::Invalid {
                    sections: keys.clone(),
                }),
                EditorError::Busy { keys } => Some(Banner::Busy {
                    sections: keys.clone(),
                }),
                other => Some(Banner::SaveFailed {
                    message: other.to_string(),
                }),
            }
        }
        EditorState::PrepareSavingFailed { error } => Some(Banner::PrepareFailed {
            message: error.to_string(),
        }),
        EditorState::SavingFailed { error } => Some(Banner::SaveFailed {
            message: error.to_string(),
        }),
    };

    let entity = store.entity();
    let sections = store
        .widgets()
        .current_state()
        .sections
        .into_iter()
        .map(|section| SectionBadge {
            key: section.key,
            is_active: section.is_active,
            is_dirty: section.is_dirty,
            is_valid: section.is_valid,
            is_busy: section.is_busy,
            failed: section.activation_failed,
        })
        .collect();

    EditView::Editor {
        title: entity
            .value
            .as_ref()
            .map(|value| value.title().to_string())
            .unwrap_or_default(),
        is_new: entity.is_new_data,
        sections,
        is_dirty: status.is_dirty,
        is_saving: status.state == EditorState::Saving,
        banner,
    }
}

#[cfg(test)]
#[path = "tests/view_tests.rs"]
mod tests;

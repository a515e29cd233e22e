//! Orchestration of multi-section entity editors: widgets own slices of an
//! entity's form, [`WidgetsManager`] merges their state and assembles save
//! batches, and [`EditorStore`] drives load/save against a [`Transport`].

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod collaborators;
pub mod config;
pub mod editor_store;
pub mod entity;
pub mod error;
pub mod sections;
pub mod transport;
pub mod view;
pub mod widget;
pub mod widgets_manager;

pub use collaborators::{
    ConfirmRequest, CreationHandoff, Dialogs, EditorCollaborators, MemoryPreferences,
    NavigationGuardToken, Navigator, PageExitGuard, PageExitVerification, PendingCreation,
    PreferenceStore,
};
pub use config::{load_settings, EditorSettings};
pub use editor_store::{EditorState, EditorStatus, EditorStore, LoadOutcome, SaveOutcome};
pub use entity::{EditableEntity, EditableRecord};
pub use error::{EditorError, WidgetFailure};
pub use transport::{HttpTransport, Transport, TransportError};
pub use view::{Banner, EditView, EditViewController, SectionBadge};
pub use widget::{
    SaveBatch, Widget, WidgetActivation, WidgetDescriptor, WidgetRegistry, WidgetRuntimeState,
    WidgetSession,
};
pub use widgets_manager::{
    DataLoadedOutcome, SaveReadiness, SaveTransaction, WidgetsManager, WidgetsState,
};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

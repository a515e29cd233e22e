use thiserror::Error;

/// Failure of one widget to attach to the loaded entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetFailure {
    pub key: &'static str,
    pub message: String,
}

/// Every way an edit session can fail. EditorStore folds each of these into a
/// state instead of returning it to the view.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditorError {
    #[error("failed to load entity: {message}")]
    Load { message: String },
    #[error("sections failed to initialize: {}", describe_failures(.failures))]
    WidgetActivation { failures: Vec<WidgetFailure> },
    #[error("sections have invalid data: {}", .keys.join(", "))]
    Validation { keys: Vec<&'static str> },
    #[error("sections are still busy: {}", .keys.join(", "))]
    Busy { keys: Vec<&'static str> },
    #[error("failed to prepare save request: {message}")]
    SavePrepare { message: String },
    #[error("server rejected the save: {}", .failures.join("; "))]
    SaveTransaction { failures: Vec<String> },
}

impl EditorError {
    /// Whether repeating the same operation may succeed without user edits.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EditorError::Load { .. }
                | EditorError::WidgetActivation { .. }
                | EditorError::SaveTransaction { .. }
        )
    }
}

fn describe_failures(failures: &[WidgetFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{} ({})", failure.key, failure.message))
        .collect::<Vec<_>>()
        .join(", ")
}

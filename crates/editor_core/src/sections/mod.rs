//! Concrete form sections for the catalogue editors.

use std::sync::Mutex;

use crate::{lock, widget::WidgetSession};

pub mod category;
pub mod metadata;
pub mod playlist;

pub use category::{EntitlementsSection, SubCategoriesSection};
pub use metadata::{DescribedRecord, MetadataSection};
pub use playlist::{PlaylistContentSection, PlaylistMetadataSection};

/// Local edit state of one section.
pub trait SectionForm: Send {
    fn is_dirty(&self) -> bool;

    fn is_valid(&self) -> bool {
        true
    }

    fn is_busy(&self) -> bool {
        false
    }
}

struct Bound<F> {
    form: F,
    session: WidgetSession,
}

/// A section's form bound to the session of the entity it was built from.
/// Every edit republishes the section's flags through that session.
pub(crate) struct SectionState<F> {
    bound: Mutex<Option<Bound<F>>>,
}

impl<F> Default for SectionState<F> {
    fn default() -> Self {
        Self {
            bound: Mutex::new(None),
        }
    }
}

impl<F: SectionForm> SectionState<F> {
    pub(crate) fn attach(&self, form: F, session: WidgetSession) {
        publish(&form, &session);
        *lock(&self.bound) = Some(Bound { form, session });
    }

    pub(crate) fn detach(&self) {
        lock(&self.bound).take();
    }

    pub(crate) fn read<R>(&self, read: impl FnOnce(&F) -> R) -> Option<R> {
        lock(&self.bound).as_ref().map(|bound| read(&bound.form))
    }

    /// Edits the bound form. `None` when nothing is bound.
    pub(crate) fn edit<R>(&self, edit: impl FnOnce(&mut F) -> R) -> Option<R> {
        let mut bound = lock(&self.bound);
        let bound = bound.as_mut()?;
        let result = edit(&mut bound.form);
        publish(&bound.form, &bound.session);
        Some(result)
    }

    /// Edits the form only while `session` is still the one it was bound with.
    pub(crate) fn edit_for<R>(
        &self,
        session: &WidgetSession,
        edit: impl FnOnce(&mut F) -> R,
    ) -> Option<R> {
        let mut bound = lock(&self.bound);
        let bound = bound
            .as_mut()
            .filter(|bound| bound.session.same_attachment(session))?;
        if session.cancellation().is_cancelled() {
            return None;
        }
        let result = edit(&mut bound.form);
        publish(&bound.form, &bound.session);
        Some(result)
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.read(F::is_valid).unwrap_or(true)
    }
}

fn publish<F: SectionForm>(form: &F, session: &WidgetSession) {
    session.set_status(form.is_dirty(), form.is_valid(), form.is_busy());
}

/// Trims and drops empty or repeated tags, keeping first occurrences.
pub(crate) fn normalize_tags(tags: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !normalized.iter().any(|seen| seen == tag) {
            normalized.push(tag.to_string());
        }
    }
    normalized
}

#[cfg(test)]
#[path = "../tests/section_state_tests.rs"]
mod tests;

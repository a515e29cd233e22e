use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{
    domain::{EntityKind, MediaEntry, MediaEntryId, Playlist},
    protocol::{ListFilter, ServiceAction},
};

use super::{MetadataSection, SectionForm, SectionState};
use crate::{
    transport::Transport,
    widget::{SaveBatch, Widget, WidgetActivation, WidgetDescriptor},
};

pub type PlaylistMetadataSection = MetadataSection<Playlist>;

#[derive(Default)]
struct ContentForm {
    original: Vec<MediaEntryId>,
    entries: Vec<MediaEntry>,
    loading: bool,
}

impl ContentForm {
    fn ids(&self) -> Vec<MediaEntryId> {
        self.entries.iter().map(|entry| entry.id).collect()
    }

    fn position(&self, id: i64) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id.0 == id)
    }
}

impl SectionForm for ContentForm {
    fn is_dirty(&self) -> bool {
        self.ids() != self.original
    }

    fn is_valid(&self) -> bool {
        self.loading || !self.entries.is_empty()
    }

    fn is_busy(&self) -> bool {
        self.loading
    }
}

/// Ordered media entries of a playlist. A playlist needs at least one entry.
pub struct PlaylistContentSection {
    transport: Arc<dyn Transport>,
    state: SectionState<ContentForm>,
}

impl PlaylistContentSection {
    pub const KEY: &'static str = "content";

    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: SectionState::default(),
        }
    }

    pub fn entries(&self) -> Vec<MediaEntry> {
        self.state
            .read(|form| form.entries.clone())
            .unwrap_or_default()
    }

    pub fn total_duration_secs(&self) -> u64 {
        self.state
            .read(|form| {
                form.entries
                    .iter()
                    .map(|entry| u64::from(entry.duration_secs))
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Appends `entry` unless it is already part of the playlist.
    pub fn add_entry(&self, entry: MediaEntry) -> bool {
        self.state
            .edit(|form| {
                if form.position(entry.id.0).is_some() {
                    return false;
                }
                form.entries.push(entry);
                true
            })
            .unwrap_or(false)
    }

    pub fn remove_entry(&self, id: i64) -> bool {
        self.state
            .edit(|form| match form.position(id) {
                Some(position) => {
                    form.entries.remove(position);
                    true
                }
                None => false,
            })
            .unwrap_or(false)
    }

    pub fn move_up(&self, id: i64) -> bool {
        self.state
            .edit(|form| match form.position(id) {
                Some(position) if position > 0 => {
                    form.entries.swap(position, position - 1);
                    true
                }
                _ => false,
            })
            .unwrap_or(false)
    }

    pub fn move_down(&self, id: i64) -> bool {
        self.state
            .edit(|form| match form.position(id) {
                Some(position) if position + 1 < form.entries.len() => {
                    form.entries.swap(position, position + 1);
                    true
                }
                _ => false,
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl Widget<Playlist> for PlaylistContentSection {
    fn descriptor(&self) -> WidgetDescriptor {
        WidgetDescriptor::new(Self::KEY).saving().validating()
    }

    async fn on_activate(&self, activation: WidgetActivation<Playlist>) -> Result<()> {
        let session = activation.session;
        let original = activation.data.entry_ids.clone();
        if original.is_empty() {
            self.state.attach(ContentForm::default(), session);
            return Ok(());
        }

        self.state.attach(
            ContentForm {
                original: original.clone(),
                loading: true,
                ..ContentForm::default()
            },
            session.clone(),
        );
        let action = ServiceAction::List {
            kind: EntityKind::MediaEntry,
            filter: ListFilter::by_ids(original.iter().map(|id| id.0)),
        };
        let fetched = tokio::select! {
            fetched = self.transport.request(action) => fetched,
            _ = session.cancellation().cancelled() => return Ok(()),
        };
        let entries: Vec<MediaEntry> = serde_json::from_value(
            fetched.context("failed to load playlist entries")?,
        )
        .context("malformed media entry list")?;
        self.state.edit_for(&session, |form| {
            form.entries = entries;
            form.loading = false;
        });
        Ok(())
    }

    fn on_reset(&self) {
        self.state.detach();
    }

    async fn on_validate(&self, _was_ever_activated: bool) -> bool {
        self.state.is_valid()
    }

    fn on_data_saving(&self, draft: &mut Playlist, _batch: &mut SaveBatch) -> Result<()> {
        if let Some(ids) = self.state.read(ContentForm::ids) {
            draft.entry_ids = ids;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "../tests/playlist_sections_tests.rs"]
mod tests;

use std::marker::PhantomData;

use anyhow::Result;
use async_trait::async_trait;
use shared::domain::{Category, Playlist};

use super::{normalize_tags, SectionForm, SectionState};
use crate::{
    entity::EditableRecord,
    widget::{SaveBatch, Widget, WidgetActivation, WidgetDescriptor},
};

/// Records with the common name/description/tags block.
pub trait DescribedRecord: EditableRecord {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn tags(&self) -> &[String];
    fn set_details(&mut self, name: String, description: String, tags: Vec<String>);
}

impl DescribedRecord for Category {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    fn set_details(&mut self, name: String, description: String, tags: Vec<String>) {
        self.name = name;
        self.description = description;
        self.tags = tags;
    }
}

impl DescribedRecord for Playlist {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    fn set_details(&mut self, name: String, description: String, tags: Vec<String>) {
        self.name = name;
        self.description = description;
        self.tags = tags;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Details {
    name: String,
    description: String,
    tags: Vec<String>,
}

struct MetadataForm {
    original: Details,
    current: Details,
}

impl SectionForm for MetadataForm {
    fn is_dirty(&self) -> bool {
        self.current != self.original
    }

    fn is_valid(&self) -> bool {
        !self.current.name.trim().is_empty()
    }
}

/// Name, description and tags of a record. The name is required.
pub struct MetadataSection<T> {
    state: SectionState<MetadataForm>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Default for MetadataSection<T> {
    fn default() -> Self {
        Self {
            state: SectionState::default(),
            _record: PhantomData,
        }
    }
}

impl<T: DescribedRecord> MetadataSection<T> {
    pub const KEY: &'static str = "metadata";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self) -> Option<String> {
        self.state.read(|form| form.current.name.clone())
    }

    pub fn tags(&self) -> Option<Vec<String>> {
        self.state.read(|form| form.current.tags.clone())
    }

    /// Returns false when no entity is bound.
    pub fn set_name(&self, name: impl Into<String>) -> bool {
        let name = name.into();
        self.state.edit(|form| form.current.name = name).is_some()
    }

    pub fn set_description(&self, description: impl Into<String>) -> bool {
        let description = description.into();
        self.state
            .edit(|form| form.current.description = description)
            .is_some()
    }

    pub fn set_tags(&self, tags: impl IntoIterator<Item = String>) -> bool {
        let tags = normalize_tags(tags);
        self.state.edit(|form| form.current.tags = tags).is_some()
    }
}

#[async_trait]
impl<T: DescribedRecord> Widget<T> for MetadataSection<T> {
    fn descriptor(&self) -> WidgetDescriptor {
        WidgetDescriptor::new(Self::KEY).saving().validating()
    }

    async fn on_activate(&self, activation: WidgetActivation<T>) -> Result<()> {
        let details = Details {
            name: activation.data.name().to_string(),
            description: activation.data.description().to_string(),
            tags: activation.data.tags().to_vec(),
        };
        self.state.attach(
            MetadataForm {
                original: details.clone(),
                current: details,
            },
            activation.session,
        );
        Ok(())
    }

    fn on_reset(&self) {
        self.state.detach();
    }

    async fn on_validate(&self, _was_ever_activated: bool) -> bool {
        self.state.is_valid()
    }

    fn on_data_saving(&self, draft: &mut T, _batch: &mut SaveBatch) -> Result<()> {
        if let Some(details) = self.state.read(|form| form.current.clone()) {
            draft.set_details(
                details.name.trim().to_string(),
                details.description,
                details.tags,
            );
        }
        Ok(())
    }
}

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::{Category, CategoryUser, EntityKind, EntityRef, PermissionLevel},
    protocol::{ListFilter, ServiceAction},
};
use tracing::{debug, warn};

use super::{SectionForm, SectionState};
use crate::{
    transport::Transport,
    widget::{SaveBatch, Widget, WidgetActivation, WidgetDescriptor, WidgetSession},
};

async fn list<R: serde::de::DeserializeOwned>(
    transport: &dyn Transport,
    kind: EntityKind,
    filter: ListFilter,
) -> Result<Vec<R>> {
    let value: Value = transport
        .request(ServiceAction::List { kind, filter })
        .await?;
    serde_json::from_value(value).with_context(|| format!("malformed {kind} list"))
}

#[derive(Default)]
struct SubCategoriesForm {
    children: Vec<Category>,
    removed: Vec<Category>,
    loading: bool,
}

impl SectionForm for SubCategoriesForm {
    fn is_dirty(&self) -> bool {
        !self.removed.is_empty()
    }

    fn is_busy(&self) -> bool {
        self.loading
    }
}

/// Direct children of a category. Removing a child deletes it on save.
pub struct SubCategoriesSection {
    transport: Arc<dyn Transport>,
    state: SectionState<SubCategoriesForm>,
}

impl SubCategoriesSection {
    pub const KEY: &'static str = "subcategories";

    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: SectionState::default(),
        }
    }

    pub fn children(&self) -> Vec<Category> {
        self.state
            .read(|form| form.children.clone())
            .unwrap_or_default()
    }

    /// Marks child `id` for deletion. Returns false if it is not listed.
    pub fn remove_child(&self, id: i64) -> bool {
        self.state
            .edit(|form| {
                let Some(position) = form
                    .children
                    .iter()
                    .position(|child| child.id.map(|id| id.0) == Some(id))
                else {
                    return false;
                };
                let child = form.children.remove(position);
                form.removed.push(child);
                true
            })
            .unwrap_or(false)
    }

    pub fn undo_removals(&self) -> bool {
        self.state
            .edit(|form| {
                let restored = !form.removed.is_empty();
                form.children.append(&mut form.removed);
                restored
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl Widget<Category> for SubCategoriesSection {
    fn descriptor(&self) -> WidgetDescriptor {
        WidgetDescriptor::new(Self::KEY).saving()
    }

    async fn on_activate(&self, activation: WidgetActivation<Category>) -> Result<()> {
        let session = activation.session;
        let parent = activation.data.id.filter(|_| !activation.is_new_data);
        let Some(parent) = parent else {
            self.state.attach(SubCategoriesForm::default(), session);
            return Ok(());
        };

        self.state.attach(
            SubCategoriesForm {
                loading: true,
                ..SubCategoriesForm::default()
            },
            session.clone(),
        );
        let fetched = tokio::select! {
            fetched = list::<Category>(
                self.transport.as_ref(),
                EntityKind::Category,
                ListFilter::by_parent(parent.0),
            ) => fetched,
            _ = session.cancellation().cancelled() => return Ok(()),
        };
        let children = fetched.context("failed to load sub-categories")?;
        debug!(parent = parent.0, count = children.len(), "sub-categories loaded");
        self.state.edit_for(&session, |form| {
            form.children = children;
            form.loading = false;
        });
        Ok(())
    }

    fn on_reset(&self) {
        self.state.detach();
    }

    fn on_data_saving(&self, _draft: &mut Category, batch: &mut SaveBatch) -> Result<()> {
        let removed = self
            .state
            .read(|form| form.removed.clone())
            .unwrap_or_default();
        for child in removed {
            let Some(id) = child.id else {
                bail!("sub-category '{}' has no id", child.name);
            };
            batch.push(ServiceAction::Delete {
                kind: EntityKind::Category,
                id: EntityRef::Id(id.0),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingUser {
    user_id: String,
    permission_level: PermissionLevel,
}

#[derive(Default)]
struct EntitlementsForm {
    original_privacy: Option<String>,
    privacy_context: Option<String>,
    users: Vec<CategoryUser>,
    added: Vec<PendingUser>,
    removed: Vec<CategoryUser>,
    loading: bool,
    load_failed: bool,
}

impl EntitlementsForm {
    fn has_user(&self, user_id: &str) -> bool {
        self.users.iter().any(|user| user.user_id == user_id)
            || self.added.iter().any(|user| user.user_id == user_id)
    }
}

impl SectionForm for EntitlementsForm {
    fn is_dirty(&self) -> bool {
        self.privacy_context != self.original_privacy
            || !self.added.is_empty()
            || !self.removed.is_empty()
    }

    fn is_valid(&self) -> bool {
        !self.load_failed
    }

    fn is_busy(&self) -> bool {
        self.loading
    }
}

/// Privacy context and the users entitled to a category. The user list loads in
/// the background after activation; the section stays busy until it arrives.
pub struct EntitlementsSection {
    transport: Arc<dyn Transport>,
    state: Arc<SectionState<EntitlementsForm>>,
}

impl EntitlementsSection {
    pub const KEY: &'static str = "entitlements";

    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: Arc::new(SectionState::default()),
        }
    }

    pub fn users(&self) -> Vec<String> {
        self.state
            .read(|form| {
                form.users
                    .iter()
                    .map(|user| user.user_id.clone())
                    .chain(form.added.iter().map(|user| user.user_id.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_privacy_context(&self, privacy_context: Option<String>) -> bool {
        let privacy_context = privacy_context
            .map(|context| context.trim().to_string())
            .filter(|context| !context.is_empty());
        self.state
            .edit(|form| form.privacy_context = privacy_context)
            .is_some()
    }

    pub fn add_user(&self, user_id: &str, permission_level: PermissionLevel) -> Result<()> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            bail!("user id is required");
        }
        let added = self.state.edit(|form| {
            if form.has_user(user_id) {
                return false;
            }
            form.added.push(PendingUser {
                user_id: user_id.to_string(),
                permission_level,
            });
            true
        });
        match added {
            Some(true) => Ok(()),
            Some(false) => bail!("user '{user_id}' is already entitled"),
            None => bail!("no category is loaded"),
        }
    }

    /// Returns false if the user is not listed.
    pub fn remove_user(&self, user_id: &str) -> bool {
        self.state
            .edit(|form| {
                if let Some(position) = form.added.iter().position(|user| user.user_id == user_id) {
                    form.added.remove(position);
                    return true;
                }
                match form.users.iter().position(|user| user.user_id == user_id) {
                    Some(position) => {
                        let user = form.users.remove(position);
                        form.removed.push(user);
                        true
                    }
                    None => false,
                }
            })
            .unwrap_or(false)
    }

    fn spawn_user_fetch(&self, category_id: i64, session: WidgetSession) {
        let transport = Arc::clone(&self.transport);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let fetched = tokio::select! {
                fetched = list::<CategoryUser>(
                    transport.as_ref(),
                    EntityKind::CategoryUser,
                    ListFilter::by_category(category_id),
                ) => fetched,
                _ = session.cancellation().cancelled() => return,
            };
            state.edit_for(&session, |form| {
                form.loading = false;
                match fetched {
                    Ok(users) => form.users = users,
                    Err(error) => {
                        warn!(category_id, error = %format!("{error:#}"), "failed to load category users");
                        form.load_failed = true;
                    }
                }
            });
        });
    }
}

#[async_trait]
impl Widget<Category> for EntitlementsSection {
    fn descriptor(&self) -> WidgetDescriptor {
        WidgetDescriptor::new(Self::KEY).saving().validating()
    }

    async fn on_activate(&self, activation: WidgetActivation<Category>) -> Result<()> {
        let category = activation.data.id.filter(|_| !activation.is_new_data);
        let form = EntitlementsForm {
            original_privacy: activation.data.privacy_context.clone(),
            privacy_context: activation.data.privacy_context.clone(),
            loading: category.is_some(),
            ..EntitlementsForm::default()
        };
        self.state.attach(form, activation.session.clone());
        if let Some(category) = category {
            self.spawn_user_fetch(category.0, activation.session);
        }
        Ok(())
    }

    fn on_reset(&self) {
        self.state.detach();
    }

    async fn on_validate(&self, _was_ever_activated: bool) -> bool {
        self.state.is_valid()
    }

    fn on_data_saving(&self, draft: &mut Category, batch: &mut SaveBatch) -> Result<()> {
        let Some((privacy_context, added, removed)) = self.state.read(|form| {
            (
                form.privacy_context.clone(),
                form.added.clone(),
                form.removed.clone(),
            )
        }) else {
            return Ok(());
        };

        draft.privacy_context = privacy_context;
        let category_id = match draft.id {
            Some(id) => EntityRef::Id(id.0),
            None => batch.primary_id().into(),
        };
        for user in added {
            let value = serde_json::to_value(CategoryUser {
                id: None,
                category_id: category_id.clone(),
                user_id: user.user_id,
                permission_level: user.permission_level,
            })?;
            batch.push(ServiceAction::Add {
                kind: EntityKind::CategoryUser,
                value,
            });
        }
        for user in removed {
            let Some(id) = user.id else {
                bail!("category user '{}' has no id", user.user_id);
            };
            batch.push(ServiceAction::Delete {
                kind: EntityKind::CategoryUser,
                id: EntityRef::Id(id.0),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "../tests/category_sections_tests.rs"]
mod tests;

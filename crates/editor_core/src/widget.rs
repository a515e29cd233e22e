use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use shared::{
    domain::DependencyRef,
    protocol::{ActionBatch, ServiceAction},
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::lock;

/// Static identity of a widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WidgetDescriptor {
    pub key: &'static str,
    pub contributes_to_save: bool,
    pub validates: bool,
}

impl WidgetDescriptor {
    pub const fn new(key: &'static str) -> Self {
        Self {
            key,
            contributes_to_save: false,
            validates: false,
        }
    }

    pub const fn saving(mut self) -> Self {
        self.contributes_to_save = true;
        self
    }

    pub const fn validating(mut self) -> Self {
        self.validates = true;
        self
    }
}

/// Per-widget state published to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetRuntimeState {
    pub key: &'static str,
    pub is_attached: bool,
    pub is_active: bool,
    pub is_dirty: bool,
    pub is_valid: bool,
    pub is_busy: bool,
    pub activation_failed: bool,
}

impl WidgetRuntimeState {
    pub fn new(key: &'static str) -> Self {
        Self {
            key,
            is_attached: false,
            is_active: false,
            is_dirty: false,
            is_valid: true,
            is_busy: false,
            activation_failed: false,
        }
    }
}

/// The batch a save is assembled into. Entry 0 is reserved for the primary
/// add/update action, which is filled in after every widget had its turn on the draft.
#[derive(Debug, Default)]
pub struct SaveBatch {
    dependent: Vec<ServiceAction>,
}

impl SaveBatch {
    pub const PRIMARY_INDEX: usize = 0;

    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an action and returns its index in the submitted batch.
    pub fn push(&mut self, action: ServiceAction) -> usize {
        self.dependent.push(action);
        self.dependent.len()
    }

    /// Reference to the id the primary action will produce.
    pub fn primary_id(&self) -> DependencyRef {
        DependencyRef::new(Self::PRIMARY_INDEX, "id")
    }

    /// Reference to `field` of an action appended earlier.
    pub fn reference(&self, index: usize, field: &str) -> Result<DependencyRef> {
        if index > self.dependent.len() {
            bail!("batch entry {index} does not exist yet");
        }
        Ok(DependencyRef::new(index, field))
    }

    pub fn dependent_actions(&self) -> &[ServiceAction] {
        &self.dependent
    }

    pub(crate) fn into_batch(self, primary: ServiceAction) -> ActionBatch {
        let mut actions = Vec::with_capacity(self.dependent.len() + 1);
        actions.push(primary);
        actions.extend(self.dependent);
        ActionBatch::new(actions)
    }
}

/// Arguments of [`Widget::on_activate`].
pub struct WidgetActivation<T> {
    pub data: Arc<T>,
    pub is_new_data: bool,
    pub first_time_activating: bool,
    pub session: WidgetSession,
}

/// A section of an entity's edit form.
#[async_trait]
pub trait Widget<T>: Send + Sync {
    fn descriptor(&self) -> WidgetDescriptor;

    /// Binds the widget to newly loaded data. An `Err` leaves the widget unattached.
    async fn on_activate(&self, activation: WidgetActivation<T>) -> Result<()>;

    /// Drops local form state. Called synchronously when the entity unloads.
    fn on_reset(&self) {}

    async fn on_validate(&self, _was_ever_activated: bool) -> bool {
        true
    }

    /// Writes this section's fields into `draft` and appends dependent actions.
    /// Must not perform network calls.
    fn on_data_saving(&self, _draft: &mut T, _batch: &mut SaveBatch) -> Result<()> {
        Ok(())
    }
}

/// Ordered widget collection handed to the orchestrator.
pub struct WidgetRegistry<T> {
    widgets: Vec<Arc<dyn Widget<T>>>,
    keys: HashSet<&'static str>,
}

impl<T> Default for WidgetRegistry<T> {
    fn default() -> Self {
        Self {
            widgets: Vec::new(),
            keys: HashSet::new(),
        }
    }
}

impl<T> WidgetRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, widget: Arc<dyn Widget<T>>) -> Result<Self> {
        let key = widget.descriptor().key;
        if !self.keys.insert(key) {
            bail!("widget key '{key}' is registered twice");
        }
        self.widgets.push(widget);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.widgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty()
    }

    pub(crate) fn into_widgets(self) -> Vec<Arc<dyn Widget<T>>> {
        self.widgets
    }
}

struct Slot {
    generation: u64,
    state: Option<WidgetRuntimeState>,
    cancel: CancellationToken,
}

/// Runtime state of every registered widget, indexed by registration order.
pub(crate) struct StateRegistry {
    slots: Mutex<Vec<Slot>>,
    changed: Notify,
}

impl StateRegistry {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            slots: Mutex::new(
                (0..len)
                    .map(|_| Slot {
                        generation: 0,
                        state: None,
                        cancel: CancellationToken::new(),
                    })
                    .collect(),
            ),
            changed: Notify::new(),
        }
    }

    pub(crate) async fn wait_changed(&self) {
        self.changed.notified().await;
    }

    fn notify(&self) {
        self.changed.notify_one();
    }

    /// Starts a new attachment for slot `index`, cancelling whatever the slot held.
    pub(crate) fn open(
        self: &Arc<Self>,
        index: usize,
        key: &'static str,
        generation: u64,
    ) -> WidgetSession {
        let cancel = CancellationToken::new();
        {
            let mut slots = lock(&self.slots);
            if let Some(slot) = slots.get_mut(index) {
                slot.cancel.cancel();
                slot.generation = generation;
                slot.state = Some(WidgetRuntimeState::new(key));
                slot.cancel = cancel.clone();
            }
        }
        self.notify();
        WidgetSession {
            registry: Arc::clone(self),
            index,
            generation,
            key,
            cancel,
        }
    }

    /// Cancels and clears slot `index`. Returns whether it held state.
    pub(crate) fn close(&self, index: usize, generation: u64) -> bool {
        let had_state = {
            let mut slots = lock(&self.slots);
            match slots.get_mut(index) {
                Some(slot) => {
                    slot.cancel.cancel();
                    slot.generation = generation;
                    slot.state.take().is_some()
                }
                None => false,
            }
        };
        if had_state {
            self.notify();
        }
        had_state
    }

    fn update(
        &self,
        index: usize,
        generation: u64,
        apply: impl FnOnce(&mut WidgetRuntimeState),
    ) -> bool {
        let changed = {
            let mut slots = lock(&self.slots);
            let Some(state) = slots
                .get_mut(index)
                .filter(|slot| slot.generation == generation)
                .and_then(|slot| slot.state.as_mut())
            else {
                return false;
            };
            let before = state.clone();
            apply(state);
            *state != before
        };
        if changed {
            self.notify();
        }
        true
    }

    pub(crate) fn set_active(&self, key: &str) -> bool {
        let mut changed = false;
        {
            let mut slots = lock(&self.slots);
            let found = slots
                .iter()
                .filter_map(|slot| slot.state.as_ref())
                .any(|state| state.key == key);
            if !found {
                return false;
            }
            for state in slots.iter_mut().filter_map(|slot| slot.state.as_mut()) {
                let active = state.key == key;
                if state.is_active != active {
                    state.is_active = active;
                    changed = true;
                }
            }
        }
        if changed {
            self.notify();
        }
        true
    }

    pub(crate) fn snapshot(&self) -> Vec<Option<WidgetRuntimeState>> {
        lock(&self.slots)
            .iter()
            .map(|slot| slot.state.clone())
            .collect()
    }

    pub(crate) fn state_of(&self, index: usize) -> Option<WidgetRuntimeState> {
        lock(&self.slots)
            .get(index)
            .and_then(|slot| slot.state.clone())
    }
}

/// A widget's handle on its own runtime state for one attachment.
///
/// Updates through a session opened for an earlier entity are ignored, and its
/// cancellation token fires as soon as that entity unloads.
#[derive(Clone)]
pub struct WidgetSession {
    registry: Arc<StateRegistry>,
    index: usize,
    generation: u64,
    key: &'static str,
    cancel: CancellationToken,
}

impl WidgetSession {
    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_current(&self) -> bool {
        self.apply(|_| {})
    }

    pub fn set_dirty(&self, is_dirty: bool) -> bool {
        self.apply(|state| state.is_dirty = is_dirty)
    }

    pub fn set_valid(&self, is_valid: bool) -> bool {
        self.apply(|state| state.is_valid = is_valid)
    }

    pub fn set_busy(&self, is_busy: bool) -> bool {
        self.apply(|state| state.is_busy = is_busy)
    }

    pub fn set_status(&self, is_dirty: bool, is_valid: bool, is_busy: bool) -> bool {
        self.apply(|state| {
            state.is_dirty = is_dirty;
            state.is_valid = is_valid;
            state.is_busy = is_busy;
        })
    }

    pub(crate) fn mark_attached(&self) -> bool {
        self.apply(|state| {
            state.is_attached = true;
            state.activation_failed = false;
        })
    }

    pub(crate) fn mark_failed(&self) -> bool {
        self.apply(|state| {
            state.is_attached = false;
            state.activation_failed = true;
        })
    }

    /// Whether `other` is a handle on the same attachment as this session.
    pub(crate) fn same_attachment(&self, other: &WidgetSession) -> bool {
        Arc::ptr_eq(&self.registry, &other.registry)
            && self.index == other.index
            && self.generation == other.generation
    }

    fn apply(&self, change: impl FnOnce(&mut WidgetRuntimeState)) -> bool {
        !self.cancel.is_cancelled() && self.registry.update(self.index, self.generation, change)
    }
}

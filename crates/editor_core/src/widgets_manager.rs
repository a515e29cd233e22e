use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::future::join_all;
use shared::{domain::EntityId, protocol::ActionBatch};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    entity::{EditableEntity, EditableRecord},
    error::WidgetFailure,
    lock,
    widget::{
        SaveBatch, StateRegistry, Widget, WidgetActivation, WidgetRegistry, WidgetRuntimeState,
        WidgetSession,
    },
};

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Merged state of all attached widgets plus every section's own record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetsState {
    pub is_dirty: bool,
    pub is_valid: bool,
    pub is_busy: bool,
    pub sections: Vec<WidgetRuntimeState>,
}

impl Default for WidgetsState {
    fn default() -> Self {
        Self {
            is_dirty: false,
            is_valid: true,
            is_busy: false,
            sections: Vec::new(),
        }
    }
}

impl WidgetsState {
    fn from_slots(slots: &[Option<WidgetRuntimeState>]) -> Self {
        let sections: Vec<WidgetRuntimeState> = slots.iter().flatten().cloned().collect();
        let mut merged = Self::default();
        for state in sections.iter().filter(|state| state.is_attached) {
            merged.is_dirty |= state.is_dirty;
            merged.is_valid &= state.is_valid;
            merged.is_busy |= state.is_busy;
        }
        merged.sections = sections;
        merged
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataLoadedOutcome {
    pub errors: Vec<WidgetFailure>,
}

impl DataLoadedOutcome {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveReadiness {
    Ready,
    BlockedByValidation { keys: Vec<&'static str> },
    BlockedByBusyWidget { keys: Vec<&'static str> },
    BlockedByBuildFailure { message: String },
}

/// Result of one save preparation. `batch` is empty unless `readiness` is `Ready`.
#[derive(Debug)]
pub struct SaveTransaction<T> {
    pub draft: T,
    pub batch: ActionBatch,
    pub readiness: SaveReadiness,
}

impl<T> SaveTransaction<T> {
    fn blocked(draft: T, readiness: SaveReadiness) -> Self {
        Self {
            draft,
            batch: ActionBatch::default(),
            readiness,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.readiness == SaveReadiness::Ready
    }
}

/// Drives the widgets of one editor through load, reset and save.
pub struct WidgetsManager<T> {
    widgets: Vec<Arc<dyn Widget<T>>>,
    registry: Arc<StateRegistry>,
    generation: AtomicU64,
    ever_activated: Mutex<Vec<bool>>,
    current: Mutex<Option<(Arc<T>, bool)>>,
    state_rx: watch::Receiver<WidgetsState>,
    aggregator: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> WidgetsManager<T> {
    /// Must be called within a tokio runtime: the merged state stream is fed by a
    /// background task that waits `settle_delay` after the first change of a burst.
    pub fn new(registry: WidgetRegistry<T>, settle_delay: Duration) -> Self {
        let widgets = registry.into_widgets();
        let state_registry = Arc::new(StateRegistry::new(widgets.len()));
        let (state_tx, state_rx) = watch::channel(WidgetsState::default());
        let aggregator = tokio::spawn(run_aggregator(
            Arc::clone(&state_registry),
            state_tx,
            settle_delay,
        ));

        Self {
            ever_activated: Mutex::new(vec![false; widgets.len()]),
            widgets,
            registry: state_registry,
            generation: AtomicU64::new(0),
            current: Mutex::new(None),
            state_rx,
            aggregator: Mutex::new(Some(aggregator)),
        }
    }

    pub fn keys(&self) -> Vec<&'static str> {
        self.widgets
            .iter()
            .map(|widget| widget.descriptor().key)
            .collect()
    }

    /// Debounced merged state.
    pub fn subscribe(&self) -> watch::Receiver<WidgetsState> {
        self.state_rx.clone()
    }

    /// Merged state right now, without waiting for the settle delay.
    pub fn current_state(&self) -> WidgetsState {
        WidgetsState::from_slots(&self.registry.snapshot())
    }

    pub fn failed_keys(&self) -> Vec<&'static str> {
        self.registry
            .snapshot()
            .into_iter()
            .flatten()
            .filter(|state| state.activation_failed)
            .map(|state| state.key)
            .collect()
    }

    /// Marks `key` as the section presented to the user. Returns false for unknown
    /// or unloaded sections.
    pub fn set_active_section(&self, key: &str) -> bool {
        self.registry.set_active(key)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Discards the current entity: cancels every widget's outstanding work and
    /// resets it, in registration order.
    pub fn notify_data_loading(&self, id: EntityId) {
        let generation = self.next_generation();
        *lock(&self.current) = None;

        let mut reset = 0usize;
        for (index, widget) in self.widgets.iter().enumerate() {
            if self.registry.close(index, generation) {
                widget.on_reset();
                reset += 1;
            }
        }
        debug!(entity_id = %id, generation, reset, "widgets reset for entity change");
    }

    /// Activates every widget against `data`. Activations run concurrently; the
    /// returned failures are listed in registration order.
    pub async fn notify_data_loaded(&self, data: Arc<T>, is_new_data: bool) -> DataLoadedOutcome {
        let generation = self.next_generation();
        *lock(&self.current) = Some((Arc::clone(&data), is_new_data));

        let activations = self.widgets.iter().enumerate().map(|(index, widget)| {
            let session = self
                .registry
                .open(index, widget.descriptor().key, generation);
            self.activate(index, widget, session, Arc::clone(&data), is_new_data, true)
        });
        let errors: Vec<WidgetFailure> = join_all(activations)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        info!(
            generation,
            widgets = self.widgets.len(),
            failed = errors.len(),
            "widgets activated"
        );
        DataLoadedOutcome { errors }
    }

    /// Activates a section whose earlier activation failed, against the entity that
    /// is currently loaded. Returns `Ok(false)` when there is nothing to retry.
    pub async fn retry_activation(&self, key: &str) -> Result<bool, WidgetFailure> {
        let Some((index, widget)) = self
            .widgets
            .iter()
            .enumerate()
            .find(|(_, widget)| widget.descriptor().key == key)
        else {
            return Ok(false);
        };
        let Some((data, is_new_data)) = lock(&self.current).clone() else {
            return Ok(false);
        };
        let failed = self
            .registry
            .state_of(index)
            .is_some_and(|state| state.activation_failed);
        if !failed {
            return Ok(false);
        }

        widget.on_reset();
        let generation = self.generation.load(Ordering::SeqCst);
        let session = self
            .registry
            .open(index, widget.descriptor().key, generation);
        self.activate(index, widget, session, data, is_new_data, false)
            .await
            .map(|()| true)
    }

    async fn activate(
        &self,
        index: usize,
        widget: &Arc<dyn Widget<T>>,
        session: WidgetSession,
        data: Arc<T>,
        is_new_data: bool,
        first_time_activating: bool,
    ) -> Result<(), WidgetFailure> {
        let key = session.key();
        let outcome = widget
            .on_activate(WidgetActivation {
                data,
                is_new_data,
                first_time_activating,
                session: session.clone(),
            })
            .await;

        match outcome {
            Ok(()) => {
                if session.mark_attached() {
                    if let Some(flag) = lock(&self.ever_activated).get_mut(index) {
                        *flag = true;
                    }
                    debug!(widget = key, "widget attached");
                }
                Ok(())
            }
            Err(error) => {
                session.mark_failed();
                let message = format!("{error:#}");
                warn!(widget = key, error = %message, "widget activation failed");
                Err(WidgetFailure { key, message })
            }
        }
    }

    /// Cancels all widget work and stops the merged state stream.
    pub fn destroy(&self) {
        let generation = self.next_generation();
        *lock(&self.current) = None;
        for (index, widget) in self.widgets.iter().enumerate() {
            if self.registry.close(index, generation) {
                widget.on_reset();
            }
        }
        if let Some(aggregator) = lock(&self.aggregator).take() {
            aggregator.abort();
        }
    }
}

impl<T: EditableRecord> WidgetsManager<T> {
    /// Save preparation: validate, then check busy sections, then let every attached
    /// widget shape `draft` and the batch in registration order.
    pub async fn notify_data_saving(
        &self,
        draft: T,
        entity: &EditableEntity<T>,
    ) -> SaveTransaction<T> {
        let attached: Vec<(usize, &Arc<dyn Widget<T>>)> = self
            .registry
            .snapshot()
            .iter()
            .zip(self.widgets.iter())
            .enumerate()
            .filter(|(_, (state, _))| state.as_ref().is_some_and(|state| state.is_attached))
            .map(|(index, (_, widget))| (index, widget))
            .collect();
        let ever_activated = lock(&self.ever_activated).clone();

        let mut invalid = Vec::new();
        for (index, widget) in &attached {
            let descriptor = widget.descriptor();
            let was_ever_activated = ever_activated.get(*index).copied().unwrap_or(false);
            if descriptor.validates && !widget.on_validate(was_ever_activated).await {
                invalid.push(descriptor.key);
            }
        }
        if !invalid.is_empty() {
            info!(sections = ?invalid, "save blocked by validation");
            return SaveTransaction::blocked(
                draft,
                SaveReadiness::BlockedByValidation { keys: invalid },
            );
        }

        let busy: Vec<&'static str> = self
            .registry
            .snapshot()
            .into_iter()
            .flatten()
            .filter(|state| state.is_attached && state.is_busy)
            .map(|state| state.key)
            .collect();
        if !busy.is_empty() {
            info!(sections = ?busy, "save blocked by busy sections");
            return SaveTransaction::blocked(
                draft,
                SaveReadiness::BlockedByBusyWidget { keys: busy },
            );
        }

        let mut draft = draft;
        let mut batch = SaveBatch::new();
        for (_, widget) in &attached {
            let descriptor = widget.descriptor();
            if !descriptor.contributes_to_save {
                continue;
            }
            if let Err(error) = widget.on_data_saving(&mut draft, &mut batch) {
                let message = format!("{}: {error:#}", descriptor.key);
                warn!(widget = descriptor.key, error = %message, "failed to build save request");
                return SaveTransaction::blocked(
                    draft,
                    SaveReadiness::BlockedByBuildFailure { message },
                );
            }
        }

        let primary = match entity.save_action(&draft) {
            Ok(primary) => primary,
            Err(error) => {
                let message = format!("{error:#}");
                warn!(error = %message, "failed to encode primary save action");
                return SaveTransaction::blocked(
                    draft,
                    SaveReadiness::BlockedByBuildFailure { message },
                );
            }
        };
        let batch = batch.into_batch(primary);
        debug!(actions = batch.len(), "save request assembled");
        SaveTransaction {
            draft,
            batch,
            readiness: SaveReadiness::Ready,
        }
    }
}

impl<T> Drop for WidgetsManager<T> {
    fn drop(&mut self) {
        if let Some(aggregator) = lock(&self.aggregator).take() {
            aggregator.abort();
        }
    }
}

async fn run_aggregator(
    registry: Arc<StateRegistry>,
    state_tx: watch::Sender<WidgetsState>,
    settle_delay: Duration,
) {
    loop {
        registry.wait_changed().await;
        tokio::time::sleep(settle_delay).await;
        let next = WidgetsState::from_slots(&registry.snapshot());
        state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

#[cfg(test)]
#[path = "tests/widgets_manager_tests.rs"]
mod tests;

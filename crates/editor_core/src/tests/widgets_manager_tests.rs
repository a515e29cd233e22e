use super::*;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use shared::{
    domain::{Category, CategoryId, EntityKind, EntityRef},
    protocol::ServiceAction,
};
use std::sync::atomic::AtomicUsize;

use crate::widget::WidgetDescriptor;

type Log = Arc<Mutex<Vec<String>>>;
type SaveHook = Box<dyn Fn(&mut Category, &mut SaveBatch) -> anyhow::Result<()> + Send + Sync>;

struct ScriptedWidget {
    descriptor: WidgetDescriptor,
    remaining_failures: AtomicUsize,
    valid: bool,
    busy: bool,
    save: Option<SaveHook>,
    log: Log,
    session: Mutex<Option<WidgetSession>>,
}

impl ScriptedWidget {
    fn new(key: &'static str, log: &Log) -> Self {
        Self {
            descriptor: WidgetDescriptor::new(key).saving().validating(),
            remaining_failures: AtomicUsize::new(0),
            valid: true,
            busy: false,
            save: None,
            log: Arc::clone(log),
            session: Mutex::new(None),
        }
    }

    fn failing(self, times: usize) -> Self {
        self.remaining_failures.store(times, Ordering::SeqCst);
        self
    }

    fn invalid(mut self) -> Self {
        self.valid = false;
        self
    }

    fn busy(mut self) -> Self {
        self.busy = true;
        self
    }

    fn on_save(
        mut self,
        hook: impl Fn(&mut Category, &mut SaveBatch) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.save = Some(Box::new(hook));
        self
    }

    fn session(&self) -> WidgetSession {
        self.session
            .lock()
            .unwrap()
            .clone()
            .expect("widget has no session")
    }

    fn record(&self, event: String) {
        self.log.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Widget<Category> for ScriptedWidget {
    fn descriptor(&self) -> WidgetDescriptor {
        self.descriptor
    }

    async fn on_activate(&self, activation: WidgetActivation<Category>) -> anyhow::Result<()> {
        let key = self.descriptor.key;
        self.record(format!(
            "activate:{key}:{}",
            activation.first_time_activating
        ));
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            bail!("{key} source unavailable");
        }
        activation.session.set_busy(self.busy);
        *self.session.lock().unwrap() = Some(activation.session);
        Ok(())
    }

    fn on_reset(&self) {
        self.record(format!("reset:{}", self.descriptor.key));
        self.session.lock().unwrap().take();
    }

    async fn on_validate(&self, _was_ever_activated: bool) -> bool {
        self.record(format!("validate:{}", self.descriptor.key));
        self.valid
    }

    fn on_data_saving(&self, draft: &mut Category, batch: &mut SaveBatch) -> anyhow::Result<()> {
        self.record(format!("save:{}", self.descriptor.key));
        match &self.save {
            Some(hook) => hook(draft, batch),
            None => Ok(()),
        }
    }
}

fn manager(widgets: &[Arc<ScriptedWidget>]) -> WidgetsManager<Category> {
    let mut registry = WidgetRegistry::new();
    for widget in widgets {
        registry = registry
            .register(Arc::clone(widget) as Arc<dyn Widget<Category>>)
            .expect("register widget");
    }
    WidgetsManager::new(registry, DEFAULT_SETTLE_DELAY)
}

fn sports() -> Arc<Category> {
    Arc::new(Category {
        id: Some(CategoryId(10)),
        name: "Sports".into(),
        ..Category::default()
    })
}

fn events(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn existing(id: i64) -> EditableEntity<Category> {
    EditableEntity::loaded(EntityId::Existing(id), sports(), false)
}

#[tokio::test]
async fn data_loaded_reports_failures_in_registration_order() {
    let log = Log::default();
    let metadata = Arc::new(ScriptedWidget::new("metadata", &log));
    let children = Arc::new(ScriptedWidget::new("children", &log).failing(1));
    let users = Arc::new(ScriptedWidget::new("users", &log).failing(1));
    let manager = manager(&[metadata, children, users]);

    let outcome = manager.notify_data_loaded(sports(), false).await;

    assert!(outcome.has_errors());
    let keys: Vec<_> = outcome.errors.iter().map(|failure| failure.key).collect();
    assert_eq!(keys, vec!["children", "users"]);
    assert!(outcome.errors[0].message.contains("source unavailable"));
    assert_eq!(manager.failed_keys(), vec!["children", "users"]);

    let state = manager.current_state();
    let attached: Vec<_> = state
        .sections
        .iter()
        .filter(|section| section.is_attached)
        .map(|section| section.key)
        .collect();
    assert_eq!(attached, vec!["metadata"]);
}

#[tokio::test]
async fn data_loaded_without_failures_attaches_every_widget() {
    let log = Log::default();
    let metadata = Arc::new(ScriptedWidget::new("metadata", &log));
    let children = Arc::new(ScriptedWidget::new("children", &log));
    let manager = manager(&[metadata, children]);

    let outcome = manager.notify_data_loaded(sports(), false).await;

    assert!(!outcome.has_errors());
    let state = manager.current_state();
    assert!(state.sections.iter().all(|section| section.is_attached));
    assert!(state.is_valid && !state.is_dirty && !state.is_busy);
    assert!(events(&log).contains(&"activate:children:true".to_string()));
}

#[tokio::test]
async fn data_loading_resets_in_order_and_cancels_sessions() {
    let log = Log::default();
    let metadata = Arc::new(ScriptedWidget::new("metadata", &log));
    let children = Arc::new(ScriptedWidget::new("children", &log));
    let manager = manager(&[Arc::clone(&metadata), Arc::clone(&children)]);
    manager.notify_data_loaded(sports(), false).await;
    let stale = metadata.session();
    log.lock().unwrap().clear();

    manager.notify_data_loading(EntityId::Existing(11));

    assert_eq!(events(&log), vec!["reset:metadata", "reset:children"]);
    assert!(stale.cancellation().is_cancelled());
    assert!(!stale.is_current());
    assert!(!stale.set_dirty(true));
    assert!(manager.current_state().sections.is_empty());
    assert!(!manager.current_state().is_dirty);
}

#[tokio::test]
async fn failed_widgets_are_reset_on_unload() {
    let log = Log::default();
    let children = Arc::new(ScriptedWidget::new("children", &log).failing(1));
    let manager = manager(&[children]);
    manager.notify_data_loaded(sports(), false).await;

    manager.notify_data_loading(EntityId::Existing(11));

    assert!(events(&log).contains(&"reset:children".to_string()));
    assert!(manager.failed_keys().is_empty());
}

#[tokio::test(start_paused = true)]
async fn merged_state_settles_before_publishing() {
    let log = Log::default();
    let metadata = Arc::new(ScriptedWidget::new("metadata", &log));
    let children = Arc::new(ScriptedWidget::new("children", &log));
    let manager = manager(&[Arc::clone(&metadata), Arc::clone(&children)]);
    let mut rx = manager.subscribe();

    manager.notify_data_loaded(sports(), false).await;
    rx.changed().await.expect("attach published");
    assert!(!rx.borrow_and_update().is_dirty);

    let started = tokio::time::Instant::now();
    metadata.session().set_dirty(true);
    tokio::time::advance(Duration::from_millis(10)).await;
    children.session().set_busy(true);
    assert!(!rx.borrow().is_dirty);

    rx.changed().await.expect("burst published");
    let elapsed = started.elapsed();
    {
        let state = rx.borrow_and_update();
        assert!(state.is_dirty);
        assert!(state.is_busy);
        assert!(state.is_valid);
    }
    assert!(elapsed >= DEFAULT_SETTLE_DELAY);
    assert!(elapsed < DEFAULT_SETTLE_DELAY * 2);

    tokio::time::sleep(DEFAULT_SETTLE_DELAY * 3).await;
    assert!(!rx.has_changed().expect("stream open"));
}

#[tokio::test]
async fn merged_state_ignores_unattached_sections() {
    let log = Log::default();
    let metadata = Arc::new(ScriptedWidget::new("metadata", &log));
    let children = Arc::new(ScriptedWidget::new("children", &log).failing(1));
    let manager = manager(&[Arc::clone(&metadata), children]);
    manager.notify_data_loaded(sports(), false).await;

    metadata.session().set_valid(false);

    let state = manager.current_state();
    assert!(!state.is_valid);
    assert!(state
        .sections
        .iter()
        .any(|section| section.key == "children" && section.activation_failed));
}

#[tokio::test]
async fn validation_blocks_before_busy_check() {
    let log = Log::default();
    let metadata = Arc::new(ScriptedWidget::new("metadata", &log).invalid());
    let children = Arc::new(ScriptedWidget::new("children", &log).busy());
    let manager = manager(&[metadata, children]);
    manager.notify_data_loaded(sports(), false).await;
    log.lock().unwrap().clear();

    let transaction = manager
        .notify_data_saving((*sports()).clone(), &existing(10))
        .await;

    assert_eq!(
        transaction.readiness,
        SaveReadiness::BlockedByValidation {
            keys: vec!["metadata"]
        }
    );
    assert!(transaction.batch.is_empty());
    assert_eq!(
        events(&log),
        vec!["validate:metadata", "validate:children"]
    );
}

#[tokio::test]
async fn busy_section_blocks_before_building() {
    let log = Log::default();
    let metadata = Arc::new(ScriptedWidget::new("metadata", &log));
    let children = Arc::new(ScriptedWidget::new("children", &log).busy());
    let manager = manager(&[metadata, children]);
    manager.notify_data_loaded(sports(), false).await;
    log.lock().unwrap().clear();

    let transaction = manager
        .notify_data_saving((*sports()).clone(), &existing(10))
        .await;

    assert_eq!(
        transaction.readiness,
        SaveReadiness::BlockedByBusyWidget {
            keys: vec!["children"]
        }
    );
    assert!(!events(&log).iter().any(|event| event.starts_with("save:")));
}

#[tokio::test]
async fn save_batch_starts_with_primary_update() {
    let log = Log::default();
    let metadata = Arc::new(ScriptedWidget::new("metadata", &log).on_save(|draft, _| {
        draft.name = "Ball Sports".into();
        Ok(())
    }));
    let children = Arc::new(ScriptedWidget::new("children", &log).on_save(|_, batch| {
        for id in [11, 12] {
            batch.push(ServiceAction::Delete {
                kind: EntityKind::Category,
                id: EntityRef::Id(id),
            });
        }
        Ok(())
    }));
    let manager = manager(&[metadata, children]);
    manager.notify_data_loaded(sports(), false).await;

    let transaction = manager
        .notify_data_saving((*sports()).clone(), &existing(10))
        .await;

    assert!(transaction.is_ready());
    assert_eq!(transaction.draft.name, "Ball Sports");
    let actions = &transaction.batch.actions;
    assert_eq!(actions.len(), 3);
    match &actions[0] {
        ServiceAction::Update { kind, id, value } => {
            assert_eq!(*kind, EntityKind::Category);
            assert_eq!(*id, EntityRef::Id(10));
            assert_eq!(value["name"], "Ball Sports");
            assert!(value.get("id").is_none());
        }
        other => panic!("unexpected primary action {other:?}"),
    }
    assert_eq!(
        actions[1..],
        [
            ServiceAction::Delete {
                kind: EntityKind::Category,
                id: EntityRef::Id(11)
            },
            ServiceAction::Delete {
                kind: EntityKind::Category,
                id: EntityRef::Id(12)
            },
        ]
    );
}

#[tokio::test]
async fn new_entity_saves_with_add_action() {
    let log = Log::default();
    let metadata = Arc::new(ScriptedWidget::new("metadata", &log));
    let manager = manager(&[metadata]);
    let draft = Category {
        name: "Archery".into(),
        ..Category::default()
    };
    manager.notify_data_loaded(Arc::new(draft.clone()), true).await;
    let entity = EditableEntity::loaded(EntityId::New, Arc::new(draft.clone()), true);

    let transaction = manager.notify_data_saving(draft, &entity).await;

    assert!(matches!(
        transaction.batch.actions.as_slice(),
        [ServiceAction::Add { kind: EntityKind::Category, .. }]
    ));
}

#[tokio::test]
async fn build_failure_is_reported() {
    let log = Log::default();
    let metadata = Arc::new(
        ScriptedWidget::new("metadata", &log).on_save(|_, _| Err(anyhow!("tags are malformed"))),
    );
    let manager = manager(&[metadata]);
    manager.notify_data_loaded(sports(), false).await;

    let transaction = manager
        .notify_data_saving((*sports()).clone(), &existing(10))
        .await;

    match transaction.readiness {
        SaveReadiness::BlockedByBuildFailure { message } => {
            assert!(message.contains("metadata"));
            assert!(message.contains("tags are malformed"));
        }
        other => panic!("unexpected readiness {other:?}"),
    }
    assert!(transaction.batch.is_empty());
}

#[tokio::test]
async fn unattached_widgets_do_not_gate_saving() {
    let log = Log::default();
    let metadata = Arc::new(ScriptedWidget::new("metadata", &log));
    let children = Arc::new(ScriptedWidget::new("children", &log).failing(1).invalid());
    let manager = manager(&[metadata, children]);
    manager.notify_data_loaded(sports(), false).await;

    let transaction = manager
        .notify_data_saving((*sports()).clone(), &existing(10))
        .await;

    assert!(transaction.is_ready());
    assert!(!events(&log).contains(&"validate:children".to_string()));
}

#[tokio::test]
async fn retry_activation_attaches_a_failed_widget() {
    let log = Log::default();
    let children = Arc::new(ScriptedWidget::new("children", &log).failing(1));
    let manager = manager(&[Arc::clone(&children)]);
    manager.notify_data_loaded(sports(), false).await;
    assert_eq!(manager.failed_keys(), vec!["children"]);

    assert_eq!(manager.retry_activation("children").await, Ok(true));
    assert!(manager.failed_keys().is_empty());
    assert!(events(&log).contains(&"activate:children:false".to_string()));
    assert!(children.session().is_current());

    assert_eq!(manager.retry_activation("children").await, Ok(false));
    assert_eq!(manager.retry_activation("unknown").await, Ok(false));
}

#[tokio::test]
async fn duplicate_widget_keys_are_rejected() {
    let log = Log::default();
    let registry = WidgetRegistry::<Category>::new()
        .register(Arc::new(ScriptedWidget::new("metadata", &log)))
        .expect("first registration");
    assert!(registry
        .register(Arc::new(ScriptedWidget::new("metadata", &log)))
        .is_err());
}

#[tokio::test]
async fn active_section_is_tracked_per_key() {
    let log = Log::default();
    let metadata = Arc::new(ScriptedWidget::new("metadata", &log));
    let children = Arc::new(ScriptedWidget::new("children", &log));
    let manager = manager(&[metadata, children]);
    manager.notify_data_loaded(sports(), false).await;

    assert!(manager.set_active_section("children"));
    assert!(!manager.set_active_section("missing"));
    let active: Vec<_> = manager
        .current_state()
        .sections
        .iter()
        .filter(|section| section.is_active)
        .map(|section| section.key)
        .collect();
    assert_eq!(active, vec!["children"]);
}

/// Overrides only what a section cannot leave out.
struct NotesWidget;

#[async_trait]
impl Widget<Category> for NotesWidget {
    fn descriptor(&self) -> WidgetDescriptor {
        WidgetDescriptor::new("notes").saving().validating()
    }

    async fn on_activate(&self, activation: WidgetActivation<Category>) -> anyhow::Result<()> {
        activation.session.set_dirty(activation.is_new_data);
        Ok(())
    }
}

#[tokio::test]
async fn default_hooks_validate_and_add_nothing_to_the_batch() {
    let registry = WidgetRegistry::new()
        .register(Arc::new(NotesWidget) as Arc<dyn Widget<Category>>)
        .expect("register widget");
    let manager = WidgetsManager::new(registry, DEFAULT_SETTLE_DELAY);

    assert!(!manager.notify_data_loaded(sports(), false).await.has_errors());
    let transaction = manager
        .notify_data_saving((*sports()).clone(), &existing(10))
        .await;

    assert!(transaction.is_ready());
    assert_eq!(transaction.batch.len(), 1);
    assert!(matches!(
        transaction.batch.actions[0],
        ServiceAction::Update { id: EntityRef::Id(10), .. }
    ));

    manager.notify_data_loading(EntityId::Existing(11));
    assert!(manager.current_state().sections.is_empty());
}

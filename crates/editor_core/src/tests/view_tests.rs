use super::*;
use std::time::Duration;

use shared::domain::{Category, EntityKind};

use crate::{
    collaborators::{EditorCollaborators, MemoryPreferences, PageExitVerification, PendingCreation},
    sections::{EntitlementsSection, MetadataSection, SubCategoriesSection},
    test_support::{lists, CatalogTransport, RecordingNavigator, ScriptedDialogs, FOOTBALL, SPORTS},
    widget::{Widget, WidgetRegistry},
    widgets_manager::WidgetsManager,
};

const LAST_SECTION: &str = "/content/categories.lastSection";

struct Fixture {
    transport: Arc<CatalogTransport>,
    navigator: Arc<RecordingNavigator>,
    dialogs: Arc<ScriptedDialogs>,
    preferences: Arc<MemoryPreferences>,
    metadata: Arc<MetadataSection<Category>>,
    controller: EditViewController<Category>,
}

async fn fixture() -> Fixture {
    let transport = CatalogTransport::seeded().await;
    let metadata = Arc::new(MetadataSection::<Category>::new());
    let sections: [Arc<dyn Widget<Category>>; 3] = [
        metadata.clone(),
        Arc::new(SubCategoriesSection::new(transport.clone())),
        Arc::new(EntitlementsSection::new(transport.clone())),
    ];
    let registry = sections
        .into_iter()
        .try_fold(WidgetRegistry::new(), WidgetRegistry::register)
        .expect("register sections");
    let widgets = Arc::new(WidgetsManager::new(registry, Duration::from_millis(1)));

    let navigator = Arc::new(RecordingNavigator::default());
    let dialogs = Arc::new(ScriptedDialogs::answering(false));
    let store = EditorStore::new(
        transport.clone(),
        widgets,
        EditorCollaborators {
            navigator: navigator.clone(),
            dialogs: dialogs.clone(),
            exit_guard: Arc::new(PageExitVerification::new()),
            creation: Arc::new(PendingCreation::new()),
        },
    );
    let preferences = Arc::new(MemoryPreferences::new());
    let controller = EditViewController::new(store, preferences.clone());

    Fixture {
        transport,
        navigator,
        dialogs,
        preferences,
        metadata,
        controller,
    }
}

fn active_section(view: &EditView) -> Option<&'static str> {
    match view {
        EditView::Editor { sections, .. } => sections
            .iter()
            .find(|section| section.is_active)
            .map(|section| section.key),
        _ => None,
    }
}

fn banner(view: EditView) -> Option<Banner> {
    match view {
        EditView::Editor { banner, .. } => banner,
        other => panic!("unexpected view {other:?}"),
    }
}

#[tokio::test]
async fn loaded_editor_starts_on_the_first_section() {
    let f = fixture().await;

    assert_eq!(f.controller.view(), EditView::Loading);
    assert_eq!(
        f.controller.open(EntityId::Existing(SPORTS)).await,
        LoadOutcome::Loaded
    );

    let view = f.controller.view();
    assert_eq!(active_section(&view), Some(MetadataSection::<Category>::KEY));
    match view {
        EditView::Editor {
            title,
            is_new,
            sections,
            is_saving,
            banner,
            ..
        } => {
            assert_eq!(title, "Sports");
            assert!(!is_new);
            assert!(!is_saving);
            assert!(banner.is_none());
            let keys: Vec<_> = sections.iter().map(|section| section.key).collect();
            assert_eq!(
                keys,
                vec![
                    MetadataSection::<Category>::KEY,
                    SubCategoriesSection::KEY,
                    EntitlementsSection::KEY
                ]
            );
        }
        other => panic!("unexpected view {other:?}"),
    }
}

#[tokio::test]
async fn remembered_section_is_restored_on_load() {
    let f = fixture().await;
    f.preferences
        .set(LAST_SECTION, EntitlementsSection::KEY.to_string());

    f.controller.open(EntityId::Existing(SPORTS)).await;

    assert_eq!(
        active_section(&f.controller.view()),
        Some(EntitlementsSection::KEY)
    );
}

#[tokio::test]
async fn selecting_a_section_remembers_it() {
    let f = fixture().await;
    f.controller.open(EntityId::Existing(SPORTS)).await;

    assert!(f.controller.select_section(SubCategoriesSection::KEY));
    assert!(!f.controller.select_section("history"));

    assert_eq!(
        f.preferences.get(LAST_SECTION).as_deref(),
        Some(SubCategoriesSection::KEY)
    );
    assert_eq!(
        active_section(&f.controller.view()),
        Some(SubCategoriesSection::KEY)
    );
}

#[tokio::test]
async fn route_id_is_parsed_before_loading() {
    let f = fixture().await;

    f.navigator.set_param("id", "sports");
    assert_eq!(
        f.controller.open_from_route().await,
        LoadOutcome::RedirectedToList
    );
    assert_eq!(f.navigator.visits(), vec!["/content/categories"]);
    assert!(f.transport.batches().is_empty());

    f.navigator.set_param("id", &FOOTBALL.to_string());
    assert_eq!(f.controller.open_from_route().await, LoadOutcome::Loaded);
    match f.controller.view() {
        EditView::Editor { title, .. } => assert_eq!(title, "Football"),
        other => panic!("unexpected view {other:?}"),
    }
}

#[tokio::test]
async fn blocked_save_shows_a_dismissible_banner() {
    let f = fixture().await;
    f.controller.open(EntityId::Existing(SPORTS)).await;

    f.metadata.set_name(" ");
    assert_eq!(f.controller.save().await, SaveOutcome::Blocked);

    assert_eq!(
        banner(f.controller.view()),
        Some(Banner::Invalid {
            sections: vec![MetadataSection::<Category>::KEY]
        })
    );
    assert!(f.controller.dismiss_banner());
    assert_eq!(banner(f.controller.view()), None);
    assert!(!f.controller.dismiss_banner());
}

#[tokio::test]
async fn save_during_load_alerts_the_user() {
    let f = fixture().await;

    assert_eq!(f.controller.save().await, SaveOutcome::Ignored);

    assert_eq!(f.dialogs.alerts().len(), 1);
    assert!(f.transport.writes().is_empty());
}

#[tokio::test]
async fn failed_fetch_offers_retry_and_the_list() {
    let f = fixture().await;

    assert_eq!(
        f.controller.open(EntityId::Existing(999)).await,
        LoadOutcome::Failed
    );

    match f.controller.view() {
        EditView::LoadFailed {
            message,
            can_retry,
            back_to_list,
            failed_sections,
        } => {
            assert!(message.starts_with("failed to load entity"), "{message}");
            assert!(can_retry);
            assert_eq!(back_to_list, "/content/categories");
            assert!(failed_sections.is_empty());
        }
        other => panic!("unexpected view {other:?}"),
    }
}

#[tokio::test]
async fn retry_reactivates_failed_sections() {
    let f = fixture().await;
    f.transport
        .fail_when(lists(EntityKind::Category), "listing unavailable");

    f.controller.open(EntityId::Existing(SPORTS)).await;
    match f.controller.view() {
        EditView::LoadFailed {
            failed_sections, ..
        } => assert_eq!(failed_sections, vec![SubCategoriesSection::KEY]),
        other => panic!("unexpected view {other:?}"),
    }

    assert_eq!(f.controller.retry().await, LoadOutcome::Loaded);

    let view = f.controller.view();
    assert_eq!(active_section(&view), Some(MetadataSection::<Category>::KEY));
    match view {
        EditView::Editor { sections, .. } => {
            assert!(sections.iter().all(|section| !section.failed))
        }
        other => panic!("unexpected view {other:?}"),
    }
}

#[tokio::test]
async fn close_keeps_the_editor_when_changes_are_kept() {
    let f = fixture().await;
    f.controller.open(EntityId::Existing(SPORTS)).await;
    f.metadata.set_name("Outdoor sports");

    assert!(!f.controller.close().await);
    assert!(f.navigator.visits().is_empty());

    f.dialogs.set_answer(true);
    assert!(f.controller.close().await);
    assert_eq!(f.navigator.visits(), vec!["/content/categories"]);
    assert_eq!(f.dialogs.confirms(), 2);
}

#[tokio::test]
async fn view_stream_follows_the_store_until_destroyed() {
    let f = fixture().await;
    let mut views = Box::pin(f.controller.views());

    assert_eq!(views.next().await, Some(EditView::Loading));

    f.controller.open(EntityId::Existing(SPORTS)).await;
    let loaded = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(view) = views.next().await {
            if matches!(view, EditView::Editor { .. }) {
                return view;
            }
        }
        panic!("stream ended before the editor loaded");
    })
    .await
    .expect("editor view");
    assert!(matches!(loaded, EditView::Editor { is_new: false, .. }));

    f.controller.store().destroy();
    let rest = tokio::time::timeout(Duration::from_secs(2), views.collect::<Vec<_>>()).await;
    assert!(rest.is_ok(), "view stream did not complete");
}

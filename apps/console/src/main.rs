use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand, ValueEnum};
use editor_core::{
    load_settings,
    sections::{
        EntitlementsSection, MetadataSection, PlaylistContentSection, PlaylistMetadataSection,
        SubCategoriesSection,
    },
    ConfirmRequest, Dialogs, EditView, EditViewController, EditableRecord, EditorCollaborators,
    EditorStore, HttpTransport, LoadOutcome, MemoryPreferences, Navigator, PageExitVerification,
    PendingCreation, SaveOutcome, Transport, TransportError, Widget, WidgetRegistry,
    WidgetsManager,
};
use server_api::CatalogService;
use shared::{
    domain::{Category, PermissionLevel, Playlist, NEW_ENTITY_SENTINEL},
    protocol::{ActionBatch, MultiResponse},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
struct Cli {
    /// Edit a seeded in-memory catalogue instead of the configured server.
    #[arg(long)]
    in_process: bool,
    #[arg(long)]
    server_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Category {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long)]
        privacy_context: Option<String>,
        #[arg(long = "remove-child")]
        remove_children: Vec<i64>,
        #[arg(long = "add-user")]
        add_users: Vec<String>,
        #[arg(long, value_enum, default_value_t = Permission::Member)]
        permission: Permission,
        #[arg(long = "remove-user")]
        remove_users: Vec<String>,
    },
    Playlist {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long = "remove-entry")]
        remove_entries: Vec<i64>,
        #[arg(long = "move-up")]
        move_up: Vec<i64>,
        #[arg(long = "move-down")]
        move_down: Vec<i64>,
    },
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// Record id, or "new" to create one.
    id: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Section to present after loading.
    #[arg(long)]
    section: Option<String>,
    #[arg(long)]
    save: bool,
    /// Answer "yes" when asked to discard unsaved changes.
    #[arg(long)]
    discard: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Permission {
    Manager,
    Moderator,
    Contributor,
    Member,
}

impl From<Permission> for PermissionLevel {
    fn from(permission: Permission) -> Self {
        match permission {
            Permission::Manager => PermissionLevel::Manager,
            Permission::Moderator => PermissionLevel::Moderator,
            Permission::Contributor => PermissionLevel::Contributor,
            Permission::Member => PermissionLevel::Member,
        }
    }
}

/// Serves batches from an in-process catalogue.
struct LocalTransport {
    catalog: CatalogService,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn multi_request(&self, batch: ActionBatch) -> Result<MultiResponse, TransportError> {
        Ok(self.catalog.execute(&batch).await)
    }
}

struct ConsoleNavigator {
    id: String,
}

impl Navigator for ConsoleNavigator {
    fn navigate_to(&self, path: &str, _params: &[(&str, String)]) {
        println!("-> {path}");
    }

    fn route_param(&self, name: &str) -> Option<String> {
        (name == "id").then(|| self.id.clone())
    }
}

struct ConsoleDialogs {
    discard: bool,
}

#[async_trait]
impl Dialogs for ConsoleDialogs {
    async fn confirm(&self, request: ConfirmRequest) -> bool {
        let label = if self.discard {
            &request.accept_label
        } else {
            &request.reject_label
        };
        println!("{}: {} [{label}]", request.header, request.message);
        self.discard
    }

    async fn alert(&self, message: &str) {
        println!("! {message}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }
    let transport: Arc<dyn Transport> = if cli.in_process {
        let catalog = CatalogService::new();
        catalog
            .seed_demo_data()
            .await
            .map_err(|error| anyhow::anyhow!("demo seed failed: {error}"))?;
        info!("editing the in-process demo catalogue");
        Arc::new(LocalTransport { catalog })
    } else {
        let http = HttpTransport::new(&settings).context("invalid server settings")?;
        info!(endpoint = %http.endpoint(), "editing remote catalogue");
        Arc::new(http)
    };

    match cli.command {
        Command::Category {
            session,
            privacy_context,
            remove_children,
            add_users,
            permission,
            remove_users,
        } => {
            let metadata = Arc::new(MetadataSection::<Category>::new());
            let children = Arc::new(SubCategoriesSection::new(transport.clone()));
            let entitlements = Arc::new(EntitlementsSection::new(transport.clone()));
            let widgets: Vec<Arc<dyn Widget<Category>>> =
                vec![metadata.clone(), children.clone(), entitlements.clone()];
            let draft = Category {
                name: session.name.clone().unwrap_or_default(),
                ..Category::default()
            };

            run_session(transport, settings.settle_delay, widgets, draft, &session, || {
                apply_details(&*metadata, &session);
                if let Some(privacy_context) = privacy_context {
                    entitlements.set_privacy_context(Some(privacy_context));
                }
                for id in remove_children {
                    if !children.remove_child(id) {
                        warn!(id, "not a sub-category of this category");
                    }
                }
                for user_id in remove_users {
                    if !entitlements.remove_user(&user_id) {
                        warn!(%user_id, "user is not entitled to this category");
                    }
                }
                for user_id in add_users {
                    entitlements.add_user(&user_id, permission.into())?;
                }
                Ok(())
            })
            .await
        }
        Command::Playlist {
            session,
            remove_entries,
            move_up,
            move_down,
        } => {
            let metadata = Arc::new(PlaylistMetadataSection::new());
            let content = Arc::new(PlaylistContentSection::new(transport.clone()));
            let widgets: Vec<Arc<dyn Widget<Playlist>>> = vec![metadata.clone(), content.clone()];
            let draft = Playlist {
                name: session.name.clone().unwrap_or_default(),
                ..Playlist::default()
            };

            run_session(transport, settings.settle_delay, widgets, draft, &session, || {
                apply_details(&*metadata, &session);
                for id in remove_entries {
                    content.remove_entry(id);
                }
                for id in move_up {
                    content.move_up(id);
                }
                for id in move_down {
                    content.move_down(id);
                }
                println!(
                    "content: {} entries, {}s",
                    content.entries().len(),
                    content.total_duration_secs()
                );
                Ok(())
            })
            .await
        }
    }
}

fn apply_details<T: editor_core::sections::DescribedRecord>(
    metadata: &MetadataSection<T>,
    session: &SessionArgs,
) {
    if let Some(name) = &session.name {
        metadata.set_name(name.clone());
    }
    if let Some(description) = &session.description {
        metadata.set_description(description.clone());
    }
    if !session.tags.is_empty() {
        metadata.set_tags(session.tags.clone());
    }
}

/// Opens one editor, applies `edit`, then saves or closes it.
async fn run_session<T: EditableRecord>(
    transport: Arc<dyn Transport>,
    settle_delay: Duration,
    widgets: Vec<Arc<dyn Widget<T>>>,
    draft: T,
    session: &SessionArgs,
    edit: impl FnOnce() -> Result<()>,
) -> Result<()> {
    let registry = widgets
        .into_iter()
        .try_fold(WidgetRegistry::new(), WidgetRegistry::register)?;
    let creation = Arc::new(PendingCreation::new());
    if session.id.eq_ignore_ascii_case(NEW_ENTITY_SENTINEL) {
        creation.offer(draft);
    }
    let store = EditorStore::new(
        transport,
        Arc::new(WidgetsManager::new(registry, settle_delay)),
        EditorCollaborators {
            navigator: Arc::new(ConsoleNavigator {
                id: session.id.clone(),
            }),
            dialogs: Arc::new(ConsoleDialogs {
                discard: session.discard,
            }),
            exit_guard: Arc::new(PageExitVerification::new()),
            creation,
        },
    );
    let controller = EditViewController::new(store, Arc::new(MemoryPreferences::new()));

    let outcome = controller.open_from_route().await;
    print_view(&controller.view());
    if outcome != LoadOutcome::Loaded {
        controller.store().destroy();
        bail!("{} {} could not be opened", T::KIND, session.id);
    }
    settle(&controller).await?;
    if let Some(key) = &session.section {
        if !controller.select_section(key) {
            warn!(section = %key, "unknown section");
        }
    }

    edit()?;
    print_view(&controller.view());

    if session.save {
        let outcome = controller.save().await;
        print_view(&controller.view());
        if outcome != SaveOutcome::Saved {
            controller.store().destroy();
            bail!("save did not complete: {outcome:?}");
        }
    } else if !controller.close().await {
        println!("unsaved changes kept; pass --save or --discard");
    }
    controller.store().destroy();
    Ok(())
}

async fn settle<T: EditableRecord>(controller: &EditViewController<T>) -> Result<()> {
    let widgets = controller.store().widgets();
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while widgets.current_state().is_busy {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("sections did not finish loading")
}

fn print_view(view: &EditView) {
    match view {
        EditView::Loading => println!("loading..."),
        EditView::LoadFailed {
            message,
            can_retry,
            back_to_list,
            failed_sections,
        } => {
            println!("load failed: {message}");
            if !failed_sections.is_empty() {
                println!("  failed sections: {}", failed_sections.join(", "));
            }
            println!("  retry possible: {can_retry}, list: {back_to_list}");
        }
        EditView::Editor {
            title,
            is_new,
            sections,
            is_dirty,
            is_saving,
            banner,
        } => {
            let marker = if *is_dirty { " *" } else { "" };
            let title = if *is_new && title.is_empty() {
                "(new)"
            } else {
                title.as_str()
            };
            println!("{title}{marker}");
            for section in sections {
                let mut flags = Vec::new();
                if section.is_active {
                    flags.push("active");
                }
                if section.is_dirty {
                    flags.push("modified");
                }
                if !section.is_valid {
                    flags.push("invalid");
                }
                if section.is_busy {
                    flags.push("busy");
                }
                if section.failed {
                    flags.push("failed");
                }
                println!("  [{}] {}", section.key, flags.join(" "));
            }
            if *is_saving {
                println!("  saving...");
            }
            if let Some(banner) = banner {
                println!("  ! {banner:?}");
            }
        }
    }
}

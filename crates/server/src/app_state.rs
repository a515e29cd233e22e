use server_api::CatalogService;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) catalog: CatalogService,
}

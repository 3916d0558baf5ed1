use std::sync::Arc;

use anyhow::Context;
use aria_events::Bus;
use aria_kernel::Kernel;
use tracing::info;

use crate::config::HubConfig;
use crate::discovery::DiscoveryModule;
use crate::hub::Hub;
use crate::ml::{MlModule, PredictionEngine};
use crate::modules::Module;
use crate::organic_discovery::{DomainAreaClusterer, OrganicDiscoveryModule};
use crate::router;
use crate::shadow_module::ShadowModule;
use crate::AppState;

const BUS_CAPACITY: usize = 256;

pub(crate) struct BootstrapOutput {
    pub router: axum::Router<AppState>,
    pub state: AppState,
}

/// Modules the hub starts with, in initialization order. Discovery needs a
/// configured command; the ML module needs an engine.
pub(crate) fn builtin_modules(
    config: &HubConfig,
    prediction_engine: Option<Arc<dyn PredictionEngine>>,
) -> Vec<Arc<dyn Module>> {
    let mut modules: Vec<Arc<dyn Module>> = Vec::new();
    match DiscoveryModule::from_config(config) {
        Some(discovery) => modules.push(discovery),
        None => info!("no discovery command configured; discovery module disabled"),
    }
    modules.push(OrganicDiscoveryModule::new(
        config,
        Arc::new(DomainAreaClusterer),
    ));
    modules.push(ShadowModule::new(config));
    match prediction_engine {
        Some(engine) => modules.push(MlModule::new(config, engine)),
        None => info!("no prediction engine supplied; ml module disabled"),
    }
    modules
}

/// Open the store, register and start modules, and build the router.
pub(crate) async fn build(
    config: HubConfig,
    prediction_engine: Option<Arc<dyn PredictionEngine>>,
) -> anyhow::Result<BootstrapOutput> {
    let kernel = Kernel::open(&config.store.cache_dir).with_context(|| {
        format!("open store under {}", config.store.cache_dir.display())
    })?;
    let hub = Hub::new(Arc::new(config), kernel, Bus::new(BUS_CAPACITY));
    for module in builtin_modules(hub.config(), prediction_engine) {
        hub.register_module(module)?;
    }
    hub.initialize_all().await;
    Ok(BootstrapOutput {
        router: router::build_router(),
        state: AppState::new(hub),
    })
}

pub(crate) fn attach_layers(router: axum::Router<AppState>, state: AppState) -> axum::Router<()> {
    use tower_http::trace::TraceLayer;

    router
        .with_state::<()>(state)
        .layer(TraceLayer::new_for_http())
}

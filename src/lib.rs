pub mod api;
pub mod config;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

use std::sync::Arc;

// Export API types
pub use api::handlers;
pub use api::routes;

pub use logic::{
    ConfigUpdate, ConflictReason, ConflictResolver, DiffEngine, EngineSettings, Mutation,
    UpdateCommand, UpdateCoordinator, UpdateResult, ValidationError, ValidationErrorType,
    Validator,
};

// Export all model types
pub use model::*;

// Export store types
pub use store::{ConfigStore, InMemoryStore, PostgresStore};

/// Router over `store` with the engine configured from `config`
pub fn build_app<S: ConfigStore + 'static>(
    store: Arc<S>,
    config: &crate::config::AppConfig,
) -> axum::Router {
    let coordinator = UpdateCoordinator::new(store, config.validator(), config.engine_settings());
    crate::api::routes::create_router::<S>().with_state(Arc::new(coordinator))
}

/// Serve `app` on `listener` until the process is stopped
pub async fn serve(listener: tokio::net::TcpListener, app: axum::Router) -> anyhow::Result<()> {
    axum::serve(listener, app).await?;
    Ok(())
}

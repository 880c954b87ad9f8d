use axum::{
    routing::{get, post, put},
    Router,
};

use crate::api::handlers::{self, AppState};
use crate::store::traits::ConfigStore;

pub fn create_router<S: ConfigStore + 'static>() -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Reading the configuration
        .route("/config", get(handlers::get_config::<S>))
        .route("/config/edit", get(handlers::get_config_for_edit::<S>))
        .route("/config/fingerprint/:fingerprint", get(handlers::check_fingerprint::<S>))
        // Revision history
        .route("/config/revisions", get(handlers::list_revisions::<S>))
        .route(
            "/config/revisions/:fingerprint",
            get(handlers::get_revision::<S>),
        )
        .route(
            "/config/changes/:later/:earlier",
            get(handlers::get_changes::<S>),
        )
        // Node edits
        .route(
            "/config/nodes",
            put(handlers::update_node::<S>)
                .post(handlers::add_node::<S>)
                .delete(handlers::remove_node::<S>),
        )
        .route("/config/nodes/move", post(handlers::move_node::<S>))
}

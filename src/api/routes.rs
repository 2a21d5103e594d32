use axum::{
    routing::get,
    Router,
};

use crate::api::handlers::{self, AppState};

pub fn create_router() -> Router<AppState> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Brokers
        .route(
            "/v1/service_brokers",
            get(handlers::list_brokers).post(handlers::create_broker),
        )
        .route(
            "/v1/service_brokers/:id",
            get(handlers::get_broker)
                .patch(handlers::update_broker)
                .delete(handlers::delete_broker),
        )
        // Platforms
        .route(
            "/v1/platforms",
            get(handlers::list_platforms).post(handlers::create_platform),
        )
        // Catalog listings
        .route("/v1/service_offerings", get(handlers::list_offerings))
        .route("/v1/service_plans", get(handlers::list_plans))
        .route("/v1/visibilities", get(handlers::list_visibilities))
        // Instances
        .route(
            "/v1/service_instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/v1/service_instances/:id",
            get(handlers::get_instance)
                .patch(handlers::update_instance)
                .delete(handlers::delete_instance),
        )
        // Bindings
        .route(
            "/v1/service_bindings",
            get(handlers::list_bindings).post(handlers::create_binding),
        )
        .route(
            "/v1/service_bindings/:id",
            get(handlers::get_binding).delete(handlers::delete_binding),
        )
        // Operations
        .route("/v1/operations/:id", get(handlers::get_operation))
}

/// Router with its state attached, ready to serve.
pub fn create_app(state: AppState) -> Router {
    create_router().with_state(state)
}

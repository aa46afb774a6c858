use axum::{
    Router, middleware,
    routing::{IntoMakeService, get},
};
use tower_http::cors::{Any, CorsLayer};

use crate::{DeploymentImpl, middleware as app_middleware};

pub mod health;
pub mod tasks;
pub mod workflows;

#[cfg(test)]
pub(crate) mod test_support;

/// The full application: `/health` plus everything under `/api`.
pub fn app(deployment: DeploymentImpl) -> Router {
    let api_routes = Router::new()
        .merge(tasks::router())
        .merge(workflows::router());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api", api_routes)
        .with_state(deployment)
        .layer(cors)
        .layer(middleware::from_fn(app_middleware::request_id_middleware))
}

pub fn router(deployment: DeploymentImpl) -> IntoMakeService<Router> {
    app(deployment).into_make_service()
}

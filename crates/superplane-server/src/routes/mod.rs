mod canvases;
mod executions;
mod health;
mod organizations;
mod stages;
mod webhooks;

use axum::middleware;
use axum::routing::get;
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::{auth, ws, AppState};

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .merge(organizations::routes())
        .merge(canvases::routes())
        .merge(stages::routes())
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::authenticate));

    let webhooks = webhooks::routes().layer(RequestBodyLimitLayer::new(webhooks::MAX_BODY_BYTES));
    let callbacks = executions::routes().layer(RequestBodyLimitLayer::new(executions::MAX_BODY_BYTES));

    Router::new()
        .route("/health", get(health::health))
        .route("/ws/{canvas_id}", get(ws::subscribe))
        .merge(api)
        .merge(webhooks)
        .merge(callbacks)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

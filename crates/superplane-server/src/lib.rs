//! HTTP and WebSocket front end for Superplane.
//!
//! Three groups of routes share one [`axum::Router`]:
//!
//! - `/api/v1/sources/{id}/...` webhook intake, authenticated by HMAC signature
//! - `/api/v1/outputs` and `/api/v1/executions/finish`, authenticated by
//!   execution tokens
//! - everything else under `/api/v1`, authenticated by session token and
//!   authorized by the interceptor before the handler runs
//!
//! `/ws/{canvas_id}` streams canvas events to subscribed browsers.

pub mod auth;
pub mod config;
pub mod error;
mod routes;
pub mod telemetry;
mod ws;

use std::sync::Arc;

use superplane::Core;

pub use config::{Config, LogFormat};
pub use error::{ApiError, ApiResult, ErrorResponse};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Core>,
    pub base_url: Arc<str>,
}

impl AppState {
    pub fn new(core: Arc<Core>, base_url: &str) -> Self {
        Self {
            core,
            base_url: base_url.trim_end_matches('/').into(),
        }
    }
}

/// Build the application router.
pub fn app(state: AppState) -> axum::Router {
    routes::router(state)
}

//! HTTP API for the translation gateway.
//!
//! Endpoints:
//! - POST /translate - Translate one text or a batch into one or more targets
//! - POST /detect - Detect the language of text
//! - GET /languages - Loaded languages and reachable targets
//! - GET /health - 200 when healthy, 503 otherwise
//! - GET /models - Catalog with installed/loaded state
//! - POST /admin/models/{from}/{to}/{install|load|unload} - Model lifecycle
//! - GET, POST /admin/keys - List or issue API keys
//! - DELETE /admin/keys/{key} - Revoke an API key

mod handlers;
mod types;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{LogVerbosity, DEFAULT_KEY_REQ_LIMIT};
use crate::gateway::Gateway;

pub use handlers::{AdminAccess, ClientAddress};
pub use types::*;


/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    /// Required in `x-admin-token` for admin routes. `None` disables them.
    pub admin_token: Option<String>,
    pub verbosity: LogVerbosity,
    pub default_req_limit: u64,
    /// Take the client address from `X-Forwarded-For`.
    pub trust_forwarded_for: bool,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            admin_token: None,
            verbosity: LogVerbosity::default(),
            default_req_limit: DEFAULT_KEY_REQ_LIMIT,
            trust_forwarded_for: true,
        }
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_verbosity(mut self, verbosity: LogVerbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

/// Create the API router with the given state.
pub fn create_router_with_state(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/translate", post(handlers::translate))
        .route("/detect", post(handlers::detect))
        .route("/languages", get(handlers::languages))
        .route("/health", get(handlers::health_check))
        .route("/models", get(handlers::list_models))
        .route(
            "/admin/models/{from}/{to}/{action}",
            post(handlers::model_action),
        )
        .route(
            "/admin/keys",
            get(handlers::list_keys).post(handlers::issue_key),
        )
        .route("/admin/keys/{key}", delete(handlers::revoke_key))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

pub mod auth;
pub mod config;
pub mod domain;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod search;
pub mod session;
pub mod transport;

use config::Config;
use domain::tools::{register_tools, ToolSettings};
use mcp::{dispatcher::ToolDispatcher, server::McpServer};
use search::SearchBackend;
use session::SessionRegistry;
use transport::TransportMode;

#[derive(Clone)]
pub struct AppState {
    pub api_token: Option<Arc<str>>,
    pub response_mode: TransportMode,
    pub server: McpServer,
}

impl AppState {
    pub fn new(api_token: Option<String>, response_mode: TransportMode, server: McpServer) -> Self {
        Self {
            api_token: api_token.map(Arc::<str>::from),
            response_mode,
            server,
        }
    }
}

/// Wires the registry, the dispatcher and the tool set from configuration.
pub fn build_server(config: &Config, backend: SearchBackend) -> McpServer {
    let registry = SessionRegistry::new(config.max_inflight_per_session);
    let mut dispatcher = ToolDispatcher::new(registry.clone(), Some(config.nested_call_timeout));
    register_tools(
        &mut dispatcher,
        backend,
        ToolSettings {
            notification_delay: config.notification_delay,
            search_limit: config.search_limit,
        },
    );
    McpServer::new(registry, dispatcher)
}

pub fn build_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/mcp",
            post(http::handlers::mcp_post)
                .get(http::handlers::mcp_get)
                .delete(http::handlers::mcp_delete),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer_token,
        ));

    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/mcp", get(http::handlers::discovery))
        .merge(protected)
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}

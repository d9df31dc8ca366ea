use sampling_mcp_server::{
    build_app, build_server, config::Config, logging, search::SearchBackend, AppState,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let backend = SearchBackend::local(config.docs_dir.as_deref())?;

    let server = build_server(&config, backend);
    server
        .registry()
        .spawn_eviction_task(config.session_idle_timeout);

    let bind_socket = config.bind_socket()?;
    let state = AppState::new(config.api_token.clone(), config.response_mode, server);
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(bind_socket).await?;

    info!(
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        response_mode = %config.response_mode,
        auth = config.api_token.is_some(),
        "server starting"
    );

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

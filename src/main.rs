use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

mod config;
mod error;
mod logging;
mod routes;
mod services;
pub mod models;

use services::insight::InsightAgent;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    logging::init_logging()?;

    // Load configuration
    let config = config::Config::new()?;

    // Build our application state
    let state = Arc::new(AppState::new(config));

    // Build our application with a route
    let app = Router::new()
        .merge(routes::routes())
        .merge(routes::analyze::routes(&state.config))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    // Run it
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// Application state
pub struct AppState {
    pub config: config::Config,
    pub agent: InsightAgent,
}

impl AppState {
    fn new(config: config::Config) -> Self {
        let agent = InsightAgent::with_openai(
            &config.openai_key,
            &config.openai_model,
            config.insight.clone(),
        );
        Self { config, agent }
    }
}

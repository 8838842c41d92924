use std::sync::Arc;

mod api;
mod cache;
mod config;
mod error;
mod executor;
mod injection;
mod llm;
mod model;
mod pipeline;
mod plan;
mod shaper;
mod state;
mod stream;
mod triplestore;

use cache::{CacheGate, InMemoryCacheBackend};
use config::AppConfig;
use llm::OllamaClient;
use state::AppState;
use triplestore::OxigraphTriplestore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cap_nl_query_service=debug".parse().unwrap()),
        )
        .init();

    let config = AppConfig::from_env();

    let triplestore = OxigraphTriplestore::new().expect("failed to initialize triplestore");
    if let Some(ttl_path) = &config.triplestore_seed_ttl {
        match std::fs::read_to_string(ttl_path) {
            Ok(turtle) => {
                if let Err(e) = triplestore.load_turtle(&turtle) {
                    tracing::warn!(error = %e, path = ttl_path, "failed to load triplestore seed");
                }
            }
            Err(e) => tracing::warn!(error = %e, path = ttl_path, "failed to read triplestore seed file"),
        }
    }

    let llm = OllamaClient::new(config.llm_base_url.clone(), config.llm_model.clone(), config.nl_to_sparql_system_prompt.clone());

    let cache = CacheGate::new(InMemoryCacheBackend::new());

    let bind_addr = config.bind_addr;
    let state = AppState::new(Arc::new(triplestore), Arc::new(llm), cache, config);

    let app = api::router(state);

    tracing::info!("cap-nl-query-service listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .expect("failed to bind TCP listener");

    axum::serve(listener, app).await.expect("server error");
}

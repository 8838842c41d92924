//! Shared application state handed to every Axum handler via `.with_state`.
//! Every collaborator is an injected `Arc<dyn Trait>` rather than a process
//! global, so tests can substitute fakes trivially.

use std::sync::Arc;

use crate::cache::CacheGate;
use crate::config::AppConfig;
use crate::llm::LanguageModelClient;
use crate::triplestore::TriplestoreClient;

#[derive(Clone)]
pub struct AppState(pub Arc<AppStateInner>);

pub struct AppStateInner {
    pub triplestore: Arc<dyn TriplestoreClient>,
    pub llm: Arc<dyn LanguageModelClient>,
    pub cache: CacheGate,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(
        triplestore: Arc<dyn TriplestoreClient>,
        llm: Arc<dyn LanguageModelClient>,
        cache: CacheGate,
        config: AppConfig,
    ) -> Self {
        Self(Arc::new(AppStateInner { triplestore, llm, cache, config }))
    }
}

impl std::ops::Deref for AppState {
    type Target = AppStateInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

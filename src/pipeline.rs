//! C7 — Pipeline Orchestrator.
//!
//! The state machine `READ_CACHE → GENERATE → EXECUTE → SHAPE →
//! CONTEXTUALIZE → DONE` that POST `/api/v1/nl/query` drives. Runs in its own
//! spawned task, pushing `PipelineEvent`s into a channel that the HTTP
//! handler turns into a streaming response body; a failed send means the
//! client disconnected, which cancels the rest of the run.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use futures::stream::BoxStream;
use tracing::Instrument;

use crate::executor;
use crate::model::{NlRequest, NormalizedKey, PipelineEvent, SparqlPayload, TriplestoreResponse};
use crate::plan;
use crate::shaper;
use crate::state::AppState;
use crate::stream::multiplex;

mod status {
    pub const PROCESSING_QUERY: &str = "Processing your query";
    pub const GENERATING_SPARQL: &str = "Analyzing contexts in the knowledge graph";
    pub const EXECUTING_QUERY: &str = "Fetching contextual data from knowledge graph";
    pub const NO_RESULTS: &str = "No context found, thinking more";
    pub const PROCESSING_RESULTS: &str = "Analyzing context and preparing answer";
}

const NO_DATA_ANSWER: &str = "I do not have this information yet.";

pub fn run(request: NlRequest, state: AppState) -> BoxStream<'static, PipelineEvent> {
    let (tx, rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();
    let cancel_for_run = cancel.clone();

    let key = NormalizedKey::from_effective_query(&request.effective_query());
    let span = tracing::info_span!("nl_query_pipeline", normalized_query = %key, cache_hit = tracing::field::Empty);

    tokio::spawn(
        async move {
            run_inner(request, state, tx, cancel_for_run).await;
        }
        .instrument(span),
    );

    Box::pin(ReceiverStream::new(rx))
}

/// `true` on success (or client disconnect, which is not a failure to
/// report), `false` if the caller should stop sending further events.
async fn emit(tx: &mpsc::Sender<PipelineEvent>, cancel: &CancellationToken, event: PipelineEvent) -> bool {
    if tx.send(event).await.is_err() {
        cancel.cancel();
        return false;
    }
    true
}

async fn run_inner(request: NlRequest, state: AppState, tx: mpsc::Sender<PipelineEvent>, cancel: CancellationToken) {
    tracing::info!("stage=read_cache");
    if !emit(&tx, &cancel, PipelineEvent::Status(status::PROCESSING_QUERY.to_string())).await {
        return;
    }

    let effective_query = request.effective_query();
    let key = NormalizedKey::from_effective_query(&effective_query);

    let (payload, cache_hit) = match state.cache.lookup(&key) {
        Some(entry) => (entry.sparql, true),
        None => {
            tracing::info!("stage=generate");
            if !emit(&tx, &cancel, PipelineEvent::Status(status::GENERATING_SPARQL.to_string())).await {
                return;
            }

            let generated = state
                .llm
                .generate_complete(&effective_query, state.llm.nl_to_sparql_prompt(), 0.0)
                .await;

            let response_text = match generated {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "language model generation failed");
                    let _ = emit(&tx, &cancel, PipelineEvent::Error(e.to_stream_message())).await;
                    let _ = emit(&tx, &cancel, PipelineEvent::Done).await;
                    return;
                }
            };

            let payload = plan::classify_model_output(&response_text);
            if payload.is_empty() {
                tracing::warn!("model output did not classify to a runnable SPARQL payload");
                let _ = emit(&tx, &cancel, PipelineEvent::AnswerChunk(NO_DATA_ANSWER.to_string())).await;
                let _ = emit(&tx, &cancel, PipelineEvent::Done).await;
                return;
            }

            (payload, false)
        }
    };

    tracing::Span::current().record("cache_hit", cache_hit);

    tracing::info!("stage=execute");
    if !emit(&tx, &cancel, PipelineEvent::Status(status::EXECUTING_QUERY.to_string())).await {
        return;
    }

    let (final_response, last_sparql) = match execute_payload(&payload, &state).await {
        Ok(outcome) => outcome,
        Err(transport_error) => {
            // Transport failure during EXECUTE degrades gracefully to the
            // no-data answer rather than surfacing an internal error.
            tracing::warn!(error = %transport_error, "triplestore transport failure, degrading to no-data answer");
            let _ = emit(&tx, &cancel, PipelineEvent::AnswerChunk(NO_DATA_ANSWER.to_string())).await;
            let _ = emit(&tx, &cancel, PipelineEvent::Done).await;
            return;
        }
    };

    let Some(final_response) = final_response else {
        let _ = emit(&tx, &cancel, PipelineEvent::AnswerChunk(NO_DATA_ANSWER.to_string())).await;
        let _ = emit(&tx, &cancel, PipelineEvent::Done).await;
        return;
    };

    if !cache_hit {
        state.cache.store(key, payload, &request.query);
    }

    if final_response.is_empty() {
        if !emit(&tx, &cancel, PipelineEvent::Status(status::NO_RESULTS.to_string())).await {
            return;
        }
    }

    let max_rows = state.config.max_shaped_rows;
    let shaped = shaper::shape(&final_response, max_rows);

    tracing::info!("stage=contextualize");
    if !emit(&tx, &cancel, PipelineEvent::Status(status::PROCESSING_RESULTS.to_string())).await {
        return;
    }

    let upstream = match state
        .llm
        .contextualize_answer(&effective_query, &last_sparql, &shaped, "")
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "language model contextualization failed");
            let _ = emit(&tx, &cancel, PipelineEvent::Error(e.to_stream_message())).await;
            let _ = emit(&tx, &cancel, PipelineEvent::Done).await;
            return;
        }
    };

    let mut events = multiplex(upstream, state.config.stall_window, cancel.clone());
    use futures::StreamExt;
    while let Some(event) = events.next().await {
        if !emit(&tx, &cancel, event).await {
            return;
        }
    }

    let _ = emit(&tx, &cancel, PipelineEvent::Done).await;
}

/// Dispatch a payload for execution and return its last response plus the
/// SPARQL text actually run (for contextualization context).
async fn execute_payload(
    payload: &SparqlPayload,
    state: &AppState,
) -> Result<(Option<TriplestoreResponse>, String), crate::error::AppError> {
    match payload {
        SparqlPayload::Single(sparql) => {
            let response = state.triplestore.execute(sparql).await?;
            Ok((Some(response), sparql.clone()))
        }
        SparqlPayload::Sequential(steps) => {
            let outcome = executor::execute_plan(steps, state.triplestore.as_ref()).await?;
            let last_sparql = steps.last().map(|s| s.sparql.clone()).unwrap_or_default();
            Ok((outcome.final_response, last_sparql))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheBackend;
    use crate::config::AppConfig;
    use crate::llm::LanguageModelClient;
    use crate::triplestore::TriplestoreClient;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    struct FakeTriplestore {
        response: TriplestoreResponse,
    }

    #[async_trait]
    impl TriplestoreClient for FakeTriplestore {
        async fn execute(&self, _sparql: &str) -> Result<TriplestoreResponse, crate::error::AppError> {
            Ok(self.response.clone())
        }
        async fn check_graph_exists(&self, _graph: &str) -> Result<bool, crate::error::AppError> {
            Ok(true)
        }
        async fn create_graph(&self, _graph: &str) -> Result<(), crate::error::AppError> {
            Ok(())
        }
    }

    struct FakeLlm {
        generated: String,
        answer_chunks: Vec<String>,
    }

    #[async_trait]
    impl LanguageModelClient for FakeLlm {
        async fn generate_complete(
            &self,
            _prompt: &str,
            _system_prompt: &str,
            _temperature: f32,
        ) -> Result<String, crate::error::AppError> {
            Ok(self.generated.clone())
        }

        async fn contextualize_answer(
            &self,
            _user_query: &str,
            _sparql_query: &str,
            _sparql_results: &str,
            _system_prompt: &str,
        ) -> Result<futures::stream::BoxStream<'static, Result<String, crate::error::AppError>>, crate::error::AppError>
        {
            let chunks: Vec<Result<String, crate::error::AppError>> =
                self.answer_chunks.iter().cloned().map(Ok).collect();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn llm_model(&self) -> &str {
            "fake-model"
        }

        fn nl_to_sparql_prompt(&self) -> &str {
            "fake prompt"
        }
    }

    fn test_state(llm: FakeLlm, triplestore: FakeTriplestore) -> AppState {
        let config = AppConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            stall_window: Duration::from_secs(300),
            max_shaped_rows: 10_000,
            llm_base_url: "http://localhost:11434".to_string(),
            llm_model: "fake-model".to_string(),
            nl_to_sparql_system_prompt: "fake prompt".to_string(),
            triplestore_seed_ttl: None,
        };
        AppState::new(Arc::new(triplestore), Arc::new(llm), crate::cache::CacheGate::new(InMemoryCacheBackend::new()), config)
    }

    #[tokio::test]
    async fn full_run_emits_status_then_answer_then_done() {
        let mut row = BTreeMap::new();
        row.insert("count".to_string(), crate::model::Cell::Literal { value: "4".to_string(), datatype: None });
        let llm = FakeLlm {
            generated: "SELECT ?count WHERE { ?s :count ?count }".to_string(),
            answer_chunks: vec!["There are ".to_string(), "4 results.".to_string()],
        };
        let triplestore = FakeTriplestore { response: TriplestoreResponse::Tabular { rows: vec![row] } };
        let state = test_state(llm, triplestore);

        let request = NlRequest { query: "how many things are there?".to_string(), context: None };
        let events: Vec<_> = run(request, state).collect().await;

        assert!(matches!(events.first(), Some(PipelineEvent::Status(_))));
        assert!(events.iter().any(|e| matches!(e, PipelineEvent::AnswerChunk(c) if c == "There are ")));
        assert_eq!(events.last(), Some(&PipelineEvent::Done));
    }

    #[tokio::test]
    async fn empty_model_response_yields_no_data_answer() {
        let llm = FakeLlm { generated: "I cannot help with that.".to_string(), answer_chunks: vec![] };
        let triplestore = FakeTriplestore { response: TriplestoreResponse::Boolean(true) };
        let state = test_state(llm, triplestore);

        let request = NlRequest { query: "what is the meaning of life?".to_string(), context: None };
        let events: Vec<_> = run(request, state).collect().await;

        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::AnswerChunk(c) if c == NO_DATA_ANSWER)));
        assert_eq!(events.last(), Some(&PipelineEvent::Done));
    }

    #[tokio::test]
    async fn cache_hit_skips_generation_stage() {
        let llm = FakeLlm { generated: "SELECT * WHERE {}".to_string(), answer_chunks: vec!["ok".to_string()] };
        let triplestore = FakeTriplestore { response: TriplestoreResponse::Boolean(false) };
        let state = test_state(llm, triplestore);

        let key = NormalizedKey::from_effective_query("cached question");
        state.cache.store(key, SparqlPayload::Single("ASK { ?s ?p ?o }".to_string()), "cached question");

        let request = NlRequest { query: "cached question".to_string(), context: None };
        let events: Vec<_> = run(request, state).collect().await;

        let has_generating_status = events.iter().any(|e| {
            matches!(e, PipelineEvent::Status(s) if s == status::GENERATING_SPARQL)
        });
        assert!(!has_generating_status);
    }
}

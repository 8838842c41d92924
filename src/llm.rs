//! C10 — Language Model Adapter (ambient).
//!
//! `LanguageModelClient` is the capability the pipeline orchestrator and
//! stream multiplexer depend on; `OllamaClient` is the default HTTP
//! implementation, speaking the Ollama `/api/generate` surface via `reqwest`
//! the same way the teacher's sibling crates reach for it for HTTP transport.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[async_trait]
pub trait LanguageModelClient: Send + Sync {
    /// Non-streamed, deterministic-capable generation (used for NL→SPARQL).
    async fn generate_complete(
        &self,
        prompt: &str,
        system_prompt: &str,
        temperature: f32,
    ) -> Result<String, AppError>;

    /// Streamed generation that weaves the triplestore results into a final
    /// natural-language answer, yielded as token fragments.
    async fn contextualize_answer(
        &self,
        user_query: &str,
        sparql_query: &str,
        sparql_results: &str,
        system_prompt: &str,
    ) -> Result<BoxStream<'static, Result<String, AppError>>, AppError>;

    async fn health_check(&self) -> bool;

    fn llm_model(&self) -> &str;

    fn nl_to_sparql_prompt(&self) -> &str;
}

#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    nl_to_sparql_prompt: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, nl_to_sparql_prompt: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            nl_to_sparql_prompt: nl_to_sparql_prompt.into(),
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateChunk {
    response: String,
    #[serde(default)]
    done: bool,
}

/// Adapt a stream of raw HTTP body chunks into a stream of complete lines,
/// buffering partial lines across chunk boundaries (chunk boundaries rarely
/// align with newlines).
fn newline_delimited_lines(
    byte_stream: impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin + Send + 'static,
) -> BoxStream<'static, Result<String, AppError>> {
    enum Next {
        Line(String),
        TransportError(String),
    }

    struct State<S> {
        stream: S,
        buffer: String,
        finished: bool,
        failed: Option<String>,
    }

    let state = State { stream: byte_stream, buffer: String::new(), finished: false, failed: None };

    let lines = stream::unfold(state, |mut state| async move {
        loop {
            if let Some(idx) = state.buffer.find('\n') {
                let line: String = state.buffer.drain(..=idx).collect();
                let line = line.trim_end_matches('\n').to_string();
                if line.is_empty() {
                    continue;
                }
                return Some((Next::Line(line), state));
            }

            if let Some(err) = state.failed.take() {
                return Some((Next::TransportError(err), state));
            }

            if state.finished {
                if state.buffer.is_empty() {
                    return None;
                }
                let line = std::mem::take(&mut state.buffer);
                return Some((Next::Line(line), state));
            }

            match state.stream.next().await {
                Some(Ok(chunk)) => state.buffer.push_str(&String::from_utf8_lossy(&chunk)),
                Some(Err(e)) => {
                    state.finished = true;
                    state.failed = Some(e.to_string());
                }
                None => state.finished = true,
            }
        }
    });

    Box::pin(lines.map(|next| match next {
        Next::Line(line) => Ok(line),
        Next::TransportError(e) => Err(AppError::LmTransport(e)),
    }))
}

#[async_trait]
impl LanguageModelClient for OllamaClient {
    async fn generate_complete(
        &self,
        prompt: &str,
        system_prompt: &str,
        temperature: f32,
    ) -> Result<String, AppError> {
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            system: system_prompt,
            stream: false,
            options: GenerateOptions { temperature },
        };

        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::LmTransport(e.to_string()))?;

        let chunk: GenerateChunk = response
            .json()
            .await
            .map_err(|e| AppError::LmTransport(format!("malformed response body: {}", e)))?;

        Ok(chunk.response)
    }

    async fn contextualize_answer(
        &self,
        user_query: &str,
        sparql_query: &str,
        sparql_results: &str,
        system_prompt: &str,
    ) -> Result<BoxStream<'static, Result<String, AppError>>, AppError> {
        let prompt = format!(
            "Question: {}\n\nSPARQL executed:\n{}\n\nResults:\n{}\n\nAnswer the question using only the results above.",
            user_query, sparql_query, sparql_results
        );

        let body = GenerateRequest {
            model: &self.model,
            prompt: &prompt,
            system: system_prompt,
            stream: true,
            options: GenerateOptions { temperature: 0.7 },
        };

        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::LmTransport(e.to_string()))?;

        let lines = newline_delimited_lines(response.bytes_stream());
        let parsed = lines.map(|line_result| {
            line_result.and_then(|line| {
                serde_json::from_str::<GenerateChunk>(&line)
                    .map_err(|e| AppError::LmTransport(format!("malformed stream chunk: {}", e)))
            })
        });

        // Ollama signals end-of-answer with `done: true` on the final chunk
        // rather than always closing the connection immediately after, so
        // stop pulling once it is seen instead of relying solely on EOF.
        let token_stream = stream::unfold((parsed, false), |(mut parsed, stopped)| async move {
            if stopped {
                return None;
            }
            match parsed.next().await {
                Some(Ok(chunk)) => {
                    let done = chunk.done;
                    Some((Ok(chunk.response), (parsed, done)))
                }
                Some(Err(e)) => Some((Err(e), (parsed, true))),
                None => None,
            }
        });

        Ok(Box::pin(token_stream))
    }

    async fn health_check(&self) -> bool {
        self.http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(std::time::Duration::from_secs(3))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn llm_model(&self) -> &str {
        &self.model
    }

    fn nl_to_sparql_prompt(&self) -> &str {
        &self.nl_to_sparql_prompt
    }
}

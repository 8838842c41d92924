//! Core data model shared by every pipeline stage: requests, cache entries,
//! SPARQL payloads, bindings, triplestore responses, and the frames streamed
//! back to the client.

use std::collections::BTreeMap;
use std::fmt;

/// A natural-language request as received on `POST /api/v1/nl/query`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NlRequest {
    pub query: String,
    pub context: Option<String>,
}

impl NlRequest {
    pub const MAX_QUERY_LEN: usize = 1000;

    /// `context ⧺ "\n\n" ⧺ query` when context is present, otherwise just `query`.
    pub fn effective_query(&self) -> String {
        match &self.context {
            Some(ctx) if !ctx.is_empty() => format!("{}\n\n{}", ctx, self.query),
            _ => self.query.clone(),
        }
    }
}

/// Lowercased, trimmed effective query. The sole cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedKey(pub String);

impl NormalizedKey {
    pub fn from_effective_query(effective: &str) -> Self {
        Self(effective.to_lowercase().trim().to_string())
    }
}

impl fmt::Display for NormalizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single step of a sequential plan: the SPARQL body plus the ordered
/// injection markers it contains (each a verbatim `INJECT(...)`-style substring).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlanStep {
    pub sparql: String,
    pub inject_markers: Vec<String>,
}

/// Either a single SPARQL string, or an ordered sequence of parametrically
/// linked steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SparqlPayload {
    Single(String),
    Sequential(Vec<PlanStep>),
}

impl SparqlPayload {
    pub fn is_empty(&self) -> bool {
        match self {
            SparqlPayload::Single(s) => s.trim().is_empty(),
            SparqlPayload::Sequential(steps) => steps.is_empty(),
        }
    }
}

/// A cache record: the canonical SPARQL payload plus popularity bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub sparql: SparqlPayload,
    pub count: u64,
    pub original_query: String,
    pub normalized_query: NormalizedKey,
}

/// One popularity-ranked row, as returned by `popular()` / the `/cache/stats`
/// and `/queries/top` endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PopularQuery {
    pub original_query: String,
    pub normalized_query: String,
    pub count: u64,
}

/// A value bound to a variable name after executing a query step.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum BindingValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
}

impl fmt::Display for BindingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingValue::Integer(i) => write!(f, "{}", i),
            BindingValue::Real(r) => write!(f, "{}", r),
            BindingValue::Text(s) => write!(f, "{}", s),
            BindingValue::Boolean(b) => write!(f, "{}", b),
        }
    }
}

/// Variable bindings accumulated across a plan's executed steps. Ordered so
/// that shaped output preserves first-seen column order.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    order: Vec<String>,
    values: BTreeMap<String, BindingValue>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&BindingValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Insert or overwrite a binding. Later writers win, matching the
    /// sequential executor's merge-on-collision behavior.
    pub fn set(&mut self, name: impl Into<String>, value: BindingValue) {
        let name = name.into();
        if !self.values.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.values.insert(name, value);
    }

    pub fn iter_in_order(&self) -> impl Iterator<Item = (&String, &BindingValue)> {
        self.order.iter().filter_map(move |k| self.values.get(k).map(|v| (k, v)))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The shape returned by a triplestore after executing a query.
#[derive(Debug, Clone, PartialEq)]
pub enum TriplestoreResponse {
    Tabular { rows: Vec<BTreeMap<String, Cell>> },
    Boolean(bool),
}

impl TriplestoreResponse {
    pub fn is_empty(&self) -> bool {
        match self {
            TriplestoreResponse::Tabular { rows } => rows.is_empty(),
            TriplestoreResponse::Boolean(_) => false,
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            TriplestoreResponse::Tabular { rows } => rows.len(),
            TriplestoreResponse::Boolean(_) => 1,
        }
    }
}

/// A single cell of a tabular result row, tagged by RDF term kind so callers
/// never have to duck-type a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Uri(String),
    Literal { value: String, datatype: Option<String> },
    Blank(String),
}

impl Cell {
    /// The raw textual value, independent of term kind — what the original
    /// system's `value_obj.get('value')` extracted.
    pub fn value(&self) -> &str {
        match self {
            Cell::Uri(v) => v,
            Cell::Literal { value, .. } => value,
            Cell::Blank(v) => v,
        }
    }
}

/// A frame yielded to the HTTP client over the course of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Status(String),
    Heartbeat(String),
    AnswerChunk(String),
    Error(String),
    Done,
}

impl PipelineEvent {
    /// Render to the newline-terminated wire format described in the stream
    /// frame contract.
    pub fn to_frame(&self) -> String {
        match self {
            PipelineEvent::Status(s) => format!("status: {}\n", s),
            PipelineEvent::Heartbeat(s) => format!("status: {}\n", s),
            PipelineEvent::AnswerChunk(s) => format!("{}\n", s),
            PipelineEvent::Error(s) => format!("error: {}\n", s),
            PipelineEvent::Done => "data: [DONE]\n".to_string(),
        }
    }
}

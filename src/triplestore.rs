//! C9 — Triplestore Adapter (ambient).
//!
//! The `TriplestoreClient` trait is the injected capability C3 executes
//! against; `OxigraphTriplestore` is the default, in-process implementation,
//! following the teacher's `SparqlStore` shape (`Arc<Store>` for cheap shared
//! access across Axum handlers) but mapping results onto `TriplestoreResponse`
//! instead of a bespoke health/CONSTRUCT-chain surface.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use oxigraph::io::{RdfFormat, RdfParser};
use oxigraph::model::{GraphName, NamedNode, Term};
use oxigraph::sparql::QueryResults;
use oxigraph::store::Store;

use crate::error::AppError;
use crate::model::{Cell, TriplestoreResponse};

#[async_trait]
pub trait TriplestoreClient: Send + Sync {
    async fn execute(&self, sparql: &str) -> Result<TriplestoreResponse, AppError>;

    async fn check_graph_exists(&self, graph: &str) -> Result<bool, AppError>;

    async fn create_graph(&self, graph: &str) -> Result<(), AppError>;
}

/// Oxigraph-backed default implementation. SPARQL execution runs synchronously
/// under the hood (Oxigraph has no async API); `execute` offloads it to
/// `spawn_blocking` so a slow query cannot stall the runtime's other tasks.
#[derive(Clone)]
pub struct OxigraphTriplestore {
    store: Arc<Store>,
}

impl OxigraphTriplestore {
    pub fn new() -> Result<Self, AppError> {
        let store = Store::new().map_err(|e| AppError::TriplestoreTransport(e.to_string()))?;
        Ok(Self { store: Arc::new(store) })
    }

    /// Load Turtle RDF into the default graph. Used for the optional startup
    /// seed configured via `AppConfig.triplestore_seed_ttl`.
    pub fn load_turtle(&self, turtle: &str) -> Result<(), AppError> {
        let parser = RdfParser::from_format(RdfFormat::Turtle).with_default_graph(GraphName::DefaultGraph);
        self.store
            .load_from_reader(parser, Cursor::new(turtle.as_bytes()))
            .map_err(|e| AppError::TriplestoreTransport(e.to_string()))
    }
}

#[async_trait]
impl TriplestoreClient for OxigraphTriplestore {
    async fn execute(&self, sparql: &str) -> Result<TriplestoreResponse, AppError> {
        let store = self.store.clone();
        let sparql = sparql.to_string();
        tokio::task::spawn_blocking(move || run_query(&store, &sparql))
            .await
            .map_err(|e| AppError::TriplestoreTransport(format!("query task panicked: {}", e)))?
    }

    async fn check_graph_exists(&self, graph: &str) -> Result<bool, AppError> {
        let named = NamedNode::new(graph).map_err(|e| AppError::BadRequest(e.to_string()))?;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            store
                .contains_named_graph(&named)
                .map_err(|e| AppError::TriplestoreTransport(e.to_string()))
        })
        .await
        .map_err(|e| AppError::TriplestoreTransport(format!("task panicked: {}", e)))?
    }

    async fn create_graph(&self, graph: &str) -> Result<(), AppError> {
        let named = NamedNode::new(graph).map_err(|e| AppError::BadRequest(e.to_string()))?;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            store
                .insert_named_graph(&named)
                .map_err(|e| AppError::TriplestoreTransport(e.to_string()))
        })
        .await
        .map_err(|e| AppError::TriplestoreTransport(format!("task panicked: {}", e)))?
    }
}

fn run_query(store: &Store, sparql: &str) -> Result<TriplestoreResponse, AppError> {
    let results = store
        .query(sparql)
        .map_err(|e| AppError::TriplestoreTransport(e.to_string()))?;

    match results {
        QueryResults::Solutions(solutions) => {
            let variables = solutions.variables().to_vec();
            let mut rows = Vec::new();
            for solution in solutions {
                let solution = solution.map_err(|e| AppError::TriplestoreTransport(e.to_string()))?;
                let mut row = BTreeMap::new();
                for var in &variables {
                    if let Some(term) = solution.get(var) {
                        row.insert(var.as_str().to_string(), term_to_cell(term));
                    }
                }
                rows.push(row);
            }
            Ok(TriplestoreResponse::Tabular { rows })
        }
        QueryResults::Boolean(b) => Ok(TriplestoreResponse::Boolean(b)),
        QueryResults::Graph(_) => Err(AppError::TriplestoreTransport(
            "CONSTRUCT/DESCRIBE results are not supported by this pipeline".to_string(),
        )),
    }
}

fn term_to_cell(term: &Term) -> Cell {
    match term {
        Term::NamedNode(n) => Cell::Uri(n.as_str().to_string()),
        Term::BlankNode(b) => Cell::Blank(b.as_str().to_string()),
        Term::Literal(l) => Cell::Literal {
            value: l.value().to_string(),
            datatype: Some(l.datatype().as_str().to_string()),
        },
        #[allow(unreachable_patterns)]
        _ => Cell::Literal { value: term.to_string(), datatype: None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_seed() -> OxigraphTriplestore {
        let ts = OxigraphTriplestore::new().unwrap();
        ts.load_turtle(
            "@prefix ex: <http://example.org/> .\nex:a ex:amount 10 .\nex:b ex:amount 20 .",
        )
        .unwrap();
        ts
    }

    #[tokio::test]
    async fn select_maps_to_tabular() {
        let ts = store_with_seed();
        let response = ts
            .execute("SELECT ?s ?v WHERE { ?s <http://example.org/amount> ?v }")
            .await
            .unwrap();
        match response {
            TriplestoreResponse::Tabular { rows } => assert_eq!(rows.len(), 2),
            other => panic!("expected tabular, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn ask_maps_to_boolean() {
        let ts = store_with_seed();
        let response = ts
            .execute("ASK { ?s <http://example.org/amount> 10 }")
            .await
            .unwrap();
        assert_eq!(response, TriplestoreResponse::Boolean(true));
    }

    #[tokio::test]
    async fn construct_is_rejected() {
        let ts = store_with_seed();
        let response = ts.execute("CONSTRUCT { ?s ?p ?o } WHERE { ?s ?p ?o }").await;
        assert!(response.is_err());
    }
}

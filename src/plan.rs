//! C2 — Plan Parser.
//!
//! Classifies a language-model response as a single SPARQL query or a
//! sequential plan, and parses both the canonical cache format (a structured
//! JSON list) and the legacy `---query N ...---` delimited text the original
//! system wrote before this redesign. Never executes anything — it only
//! normalizes text into a `SparqlPayload`.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::injection::extract_inject_markers;
use crate::model::{PlanStep, SparqlPayload};

fn code_fence_pattern() -> &'static Regex {
    static PAT: OnceLock<Regex> = OnceLock::new();
    PAT.get_or_init(|| Regex::new(r"(?s)```(?:[a-zA-Z]*\n)?(.*?)```").unwrap())
}

fn top_level_keyword_pattern() -> &'static Regex {
    static PAT: OnceLock<Regex> = OnceLock::new();
    PAT.get_or_init(|| Regex::new(r"(?i)\b(SELECT|ASK|CONSTRUCT|DESCRIBE)\b").unwrap())
}

fn legacy_delimiter_pattern() -> &'static Regex {
    static PAT: OnceLock<Regex> = OnceLock::new();
    PAT.get_or_init(|| Regex::new(r"---query \d+[^-]*---").unwrap())
}

/// Strip a surrounding ```` ```sparql ... ``` ```` or bare ```` ``` ... ``` ````
/// code fence, if present; otherwise return the input trimmed.
fn strip_code_fences(text: &str) -> String {
    if let Some(caps) = code_fence_pattern().captures(text) {
        caps.get(1).map(|m| m.as_str().trim().to_string()).unwrap_or_default()
    } else {
        text.trim().to_string()
    }
}

/// On-wire shape accepted for a canonical cached sequential plan: either a
/// bare SPARQL string or an object carrying one plus precomputed markers.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum CanonicalStepJson {
    Bare(String),
    Tagged { sparql: String },
}

impl CanonicalStepJson {
    fn into_step(self) -> PlanStep {
        let sparql = match self {
            CanonicalStepJson::Bare(s) => s,
            CanonicalStepJson::Tagged { sparql } => sparql,
        };
        let inject_markers = extract_inject_markers(&sparql);
        PlanStep { sparql, inject_markers }
    }
}

/// Classify a fresh language-model response.
pub fn classify_model_output(response: &str) -> SparqlPayload {
    let stripped = strip_code_fences(response);

    if let Some(payload) = try_parse_json_sequence(&stripped) {
        return payload;
    }

    if let Some(m) = top_level_keyword_pattern().find(&stripped) {
        let body = stripped[m.start()..].trim().to_string();
        return SparqlPayload::Single(body);
    }

    SparqlPayload::Single(String::new())
}

fn try_parse_json_sequence(text: &str) -> Option<SparqlPayload> {
    let value: Vec<CanonicalStepJson> = serde_json::from_str(text).ok()?;
    if value.is_empty() {
        return None;
    }
    let steps: Vec<PlanStep> = value.into_iter().map(CanonicalStepJson::into_step).collect();
    Some(SparqlPayload::Sequential(steps))
}

/// Parse a cached payload, accepting the canonical structured form, the
/// legacy `---query N ...---` delimited text, or a bare single SPARQL
/// string, in that order of preference.
pub fn parse_cached_payload(raw: &str) -> SparqlPayload {
    let trimmed = raw.trim();

    if let Some(payload) = try_parse_json_sequence(trimmed) {
        return payload;
    }

    if legacy_delimiter_pattern().is_match(trimmed) {
        return parse_legacy_sequential(trimmed);
    }

    SparqlPayload::Single(trimmed.to_string())
}

fn parse_legacy_sequential(text: &str) -> SparqlPayload {
    let steps: Vec<PlanStep> = legacy_delimiter_pattern()
        .split(text)
        .skip(1) // the text before the first delimiter is always empty/preamble
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() || part.starts_with("---") {
                None
            } else {
                let inject_markers = extract_inject_markers(part);
                Some(PlanStep { sparql: part.to_string(), inject_markers })
            }
        })
        .collect();

    if steps.is_empty() {
        SparqlPayload::Single(String::new())
    } else {
        SparqlPayload::Sequential(steps)
    }
}

/// Serialize a payload to the canonical on-disk form: a plain string for
/// `Single`, a JSON array of `{"sparql": ...}` objects for `Sequential`.
pub fn to_canonical_text(payload: &SparqlPayload) -> String {
    match payload {
        SparqlPayload::Single(s) => s.clone(),
        SparqlPayload::Sequential(steps) => {
            let tagged: Vec<CanonicalStepJsonRef<'_>> =
                steps.iter().map(|s| CanonicalStepJsonRef { sparql: &s.sparql }).collect();
            serde_json::to_string(&tagged).unwrap_or_default()
        }
    }
}

#[derive(Serialize)]
struct CanonicalStepJsonRef<'a> {
    sparql: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_single_query_with_prose_discarded() {
        let response = "Sure, here you go:\n```sparql\nSELECT ?x WHERE { ?x a ?t }\n```\nHope that helps!";
        let payload = classify_model_output(response);
        assert_eq!(payload, SparqlPayload::Single("SELECT ?x WHERE { ?x a ?t }".to_string()));
    }

    #[test]
    fn classifies_sequential_json_array() {
        let response = r#"[{"sparql": "SELECT ?total WHERE { ?s :amt ?total }"}, {"sparql": "SELECT ?x WHERE { ?x :v INJECT(total/2) }"}]"#;
        let payload = classify_model_output(response);
        match payload {
            SparqlPayload::Sequential(steps) => {
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[1].inject_markers, vec!["INJECT(total/2)".to_string()]);
            }
            other => panic!("expected sequential, got {:?}", other),
        }
    }

    #[test]
    fn empty_response_yields_empty_payload() {
        let payload = classify_model_output("I'm not sure how to answer that.");
        assert!(payload.is_empty());
    }

    #[test]
    fn parses_legacy_delimited_cache_text() {
        let cached = "---query 1 of 2---\nSELECT ?total WHERE { ?s :amt ?total }\n---query 2 of 2---\nSELECT ?x WHERE { ?x :v INJECT(total/2) }";
        let payload = parse_cached_payload(cached);
        match payload {
            SparqlPayload::Sequential(steps) => {
                assert_eq!(steps.len(), 2);
                assert!(steps[0].inject_markers.is_empty());
                assert_eq!(steps[1].inject_markers, vec!["INJECT(total/2)".to_string()]);
            }
            other => panic!("expected sequential, got {:?}", other),
        }
    }

    #[test]
    fn parses_bare_single_cache_text() {
        let payload = parse_cached_payload("SELECT ?x WHERE { ?x a ?t }");
        assert_eq!(payload, SparqlPayload::Single("SELECT ?x WHERE { ?x a ?t }".to_string()));
    }

    #[test]
    fn canonical_round_trip_for_sequential() {
        let payload = SparqlPayload::Sequential(vec![
            PlanStep { sparql: "SELECT ?a WHERE { ?a :x ?y }".to_string(), inject_markers: vec![] },
            PlanStep {
                sparql: "SELECT ?b WHERE { ?b :y INJECT(a/2) }".to_string(),
                inject_markers: vec!["INJECT(a/2)".to_string()],
            },
        ]);
        let canonical = to_canonical_text(&payload);
        let reparsed = parse_cached_payload(&canonical);
        assert_eq!(reparsed, payload);
    }
}

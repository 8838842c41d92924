//! C3 — Sequential Executor.
//!
//! Walks a plan's steps in order, substituting injection markers via C1
//! before each submission to the triplestore, merging results into a running
//! `Bindings` map, and stopping at the first transport failure.

use crate::injection::{evaluate_injection, replace_first};
use crate::model::{BindingValue, Bindings, Cell, PlanStep, TriplestoreResponse};
use crate::triplestore::TriplestoreClient;
use crate::error::AppError;

/// Outcome of running a full plan: the last step's response (present even if
/// that response was empty) and the accumulated bindings.
pub struct ExecutionOutcome {
    pub final_response: Option<TriplestoreResponse>,
    pub bindings: Bindings,
}

pub async fn execute_plan(
    steps: &[PlanStep],
    triplestore: &dyn TriplestoreClient,
) -> Result<ExecutionOutcome, AppError> {
    let mut bindings = Bindings::new();
    let mut final_response = None;

    for step in steps {
        let sparql = substitute_markers(step, &bindings);

        let response = triplestore.execute(&sparql).await?;

        merge_response_into_bindings(&response, &mut bindings);
        final_response = Some(response);
    }

    Ok(ExecutionOutcome { final_response, bindings })
}

fn substitute_markers(step: &PlanStep, bindings: &Bindings) -> String {
    let mut sparql = step.sparql.clone();
    for marker in &step.inject_markers {
        let value = evaluate_injection(marker, bindings);
        match replace_first(&sparql, marker, &value) {
            Some(replaced) => sparql = replaced,
            None => {
                tracing::warn!(marker, "injection marker not found in step body, proceeding unreplaced");
            }
        }
    }
    sparql
}

fn merge_response_into_bindings(response: &TriplestoreResponse, bindings: &mut Bindings) {
    match response {
        TriplestoreResponse::Tabular { rows } => {
            if let Some(first_row) = rows.first() {
                for (column, cell) in first_row {
                    bindings.set(column.clone(), coerce_cell(cell));
                }
            }
        }
        TriplestoreResponse::Boolean(b) => {
            bindings.set("boolean", BindingValue::Boolean(*b));
        }
    }
}

/// Prefer integer when the parsed real is whole, else real, else raw text.
fn coerce_cell(cell: &Cell) -> BindingValue {
    let raw = cell.value();
    if let Ok(i) = raw.parse::<i64>() {
        return BindingValue::Integer(i);
    }
    if let Ok(r) = raw.parse::<f64>() {
        if r.fract() == 0.0 && r.is_finite() {
            return BindingValue::Integer(r as i64);
        }
        return BindingValue::Real(r);
    }
    BindingValue::Text(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Cell;
    use std::collections::BTreeMap;

    #[test]
    fn coerces_whole_reals_to_integers() {
        let cell = Cell::Literal { value: "4.0".to_string(), datatype: None };
        assert_eq!(coerce_cell(&cell), BindingValue::Integer(4));
    }

    #[test]
    fn coerces_fractional_reals() {
        let cell = Cell::Literal { value: "4.5".to_string(), datatype: None };
        assert_eq!(coerce_cell(&cell), BindingValue::Real(4.5));
    }

    #[test]
    fn falls_back_to_text() {
        let cell = Cell::Uri("http://example.org/x".to_string());
        assert_eq!(coerce_cell(&cell), BindingValue::Text("http://example.org/x".to_string()));
    }

    #[test]
    fn merge_overwrites_on_collision() {
        let mut bindings = Bindings::new();
        bindings.set("total", BindingValue::Integer(1));
        let mut row = BTreeMap::new();
        row.insert("total".to_string(), Cell::Literal { value: "9".to_string(), datatype: None });
        let response = TriplestoreResponse::Tabular { rows: vec![row] };
        merge_response_into_bindings(&response, &mut bindings);
        assert_eq!(bindings.get("total"), Some(&BindingValue::Integer(9)));
    }
}

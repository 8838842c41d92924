//! C4 — Result Shaper.
//!
//! Converts a `TriplestoreResponse` into a compact textual block suitable as
//! language-model context: one line per row, columns in the first row's key
//! order (alphabetical, since rows are keyed by `BTreeMap`), capped at a
//! configurable number of rows with an explicit truncation annotation rather
//! than a silent drop.

use crate::model::{Cell, TriplestoreResponse};

pub fn shape(response: &TriplestoreResponse, max_rows: usize) -> String {
    match response {
        TriplestoreResponse::Boolean(b) => format!("result: {}", b),
        TriplestoreResponse::Tabular { rows } => shape_tabular(rows, max_rows),
    }
}

fn shape_tabular(rows: &[std::collections::BTreeMap<String, Cell>], max_rows: usize) -> String {
    if rows.is_empty() {
        return "(no results)".to_string();
    }

    let columns: Vec<&String> = rows[0].keys().collect();
    let total = rows.len();
    let taken = rows.iter().take(max_rows);

    let mut lines: Vec<String> = Vec::with_capacity(total.min(max_rows) + 1);
    for row in taken {
        let rendered: Vec<String> = columns
            .iter()
            .filter_map(|col| row.get(col.as_str()).map(|cell| format!("{}={}", col, cell.value())))
            .collect();
        lines.push(rendered.join(", "));
    }

    if total > max_rows {
        lines.push(format!("... truncated {} additional row(s)", total - max_rows));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn row(pairs: &[(&str, &str)]) -> BTreeMap<String, Cell> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Cell::Literal { value: v.to_string(), datatype: None }))
            .collect()
    }

    #[test]
    fn shapes_boolean_response() {
        let shaped = shape(&TriplestoreResponse::Boolean(true), 10);
        assert_eq!(shaped, "result: true");
    }

    #[test]
    fn shapes_empty_tabular_response() {
        let shaped = shape(&TriplestoreResponse::Tabular { rows: vec![] }, 10);
        assert_eq!(shaped, "(no results)");
    }

    #[test]
    fn orders_columns_alphabetically() {
        let rows = vec![row(&[("b", "2"), ("a", "1")])];
        let shaped = shape(&TriplestoreResponse::Tabular { rows }, 10);
        assert!(shaped.starts_with("a=1, b=2"));
    }

    #[test]
    fn truncates_and_annotates_beyond_cap() {
        let rows: Vec<_> = (0..5).map(|i| row(&[("x", Box::leak(i.to_string().into_boxed_str()))])).collect();
        let shaped = shape(&TriplestoreResponse::Tabular { rows }, 3);
        assert!(shaped.contains("truncated 2 additional row(s)"));
        assert_eq!(shaped.lines().count(), 4);
    }
}

//! C1 — Injection Evaluator.
//!
//! Parses `INJECT(expr)` / `INJECT_FROM_PREVIOUS(expr)` markers, substitutes
//! bound variables, and evaluates the resulting arithmetic expression through
//! a hand-written recursive-descent parser over a closed grammar. This is the
//! "restricted expression interpreter" redesign: no embedded scripting
//! engine, no `eval`, just literals, identifiers from bindings, eight named
//! functions, four binary ops, unary minus, comparison, and parentheses.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::model::{BindingValue, Bindings};

const ALLOWED_FUNCTIONS: &[&str] = &["int", "float", "round", "abs", "min", "max", "ceil", "floor"];
const WRAPPER_NAMES: &[&str] = &["INJECT_FROM_PREVIOUS", "INJECT", "evaluate"];

fn identifier_pattern() -> &'static Regex {
    static PAT: OnceLock<Regex> = OnceLock::new();
    PAT.get_or_init(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap())
}

/// Scan `sparql` for `INJECT(...)` / `INJECT_FROM_PREVIOUS(...)` markers,
/// matching a balanced parenthesized expression of depth <= 1, and return
/// each marker's exact substring in order of first appearance.
pub fn extract_inject_markers(sparql: &str) -> Vec<String> {
    let mut markers = Vec::new();
    let bytes = sparql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if let Some(name) = matches_marker_name(sparql, i) {
            let open = i + name.len();
            if bytes.get(open) == Some(&b'(') {
                if let Some(close) = find_balanced_close(sparql, open) {
                    markers.push(sparql[i..=close].to_string());
                    i = close + 1;
                    continue;
                }
            }
        }
        i += 1;
    }
    markers
}

fn matches_marker_name(s: &str, at: usize) -> Option<&'static str> {
    for &name in &["INJECT_FROM_PREVIOUS", "INJECT"] {
        if s[at..].starts_with(name) {
            return Some(name);
        }
    }
    None
}

/// Find the index of the `)` balancing the `(` at `open`, allowing nesting up
/// to depth 1 (i.e. one level of parenthesized sub-expression inside).
fn find_balanced_close(s: &str, open: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0i32;
    for (offset, &b) in bytes[open..].iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Replace the first textual occurrence of `marker` in `sparql` with
/// `replacement`. Returns `None` (and leaves `sparql` unmodified upstream)
/// when the marker is not found, matching the "proceed without replacement,
/// record a diagnostic" rule.
pub fn replace_first(sparql: &str, marker: &str, replacement: &str) -> Option<String> {
    sparql.find(marker).map(|idx| {
        let mut out = String::with_capacity(sparql.len());
        out.push_str(&sparql[..idx]);
        out.push_str(replacement);
        out.push_str(&sparql[idx + marker.len()..]);
        out
    })
}

/// Unwrap outer `INJECT(...)`, `INJECT_FROM_PREVIOUS(...)`, and
/// `evaluate(...)` layers, in any order, once each.
fn unwrap_layers(marker: &str) -> String {
    let mut expr = marker.trim().to_string();
    let mut used: HashSet<&'static str> = HashSet::new();

    loop {
        let mut stripped = None;
        for &name in WRAPPER_NAMES {
            if used.contains(name) {
                continue;
            }
            if let Some(inner) = strip_wrapper(&expr, name) {
                stripped = Some((name, inner));
                break;
            }
        }
        match stripped {
            Some((name, inner)) => {
                used.insert(name);
                expr = inner;
            }
            None => break,
        }
    }
    expr
}

fn strip_wrapper(s: &str, name: &str) -> Option<String> {
    let trimmed = s.trim();
    if !trimmed.starts_with(name) {
        return None;
    }
    let rest = &trimmed[name.len()..];
    let rest = rest.trim_start();
    if !rest.starts_with('(') || !rest.ends_with(')') {
        return None;
    }
    // Confirm the trailing ')' actually balances the leading '(' — otherwise
    // this isn't a `name(...)` wrapper but e.g. `name(a) + (b)`.
    if find_balanced_close(rest, 0) == Some(rest.len() - 1) {
        Some(rest[1..rest.len() - 1].trim().to_string())
    } else {
        None
    }
}

/// Evaluate an `INJECT(...)`-style marker against the current bindings and
/// return the literal text to substitute into the SPARQL body. Never fails:
/// any problem (undefined variable, parse error, evaluation error) yields the
/// safe default `"1"`.
pub fn evaluate_injection(marker: &str, bindings: &Bindings) -> String {
    let expr = unwrap_layers(marker);

    let idents: HashSet<String> = identifier_pattern()
        .find_iter(&expr)
        .map(|m| m.as_str().to_string())
        .collect();

    let unresolved: Vec<&String> = idents
        .iter()
        .filter(|id| !ALLOWED_FUNCTIONS.contains(&id.as_str()) && !bindings.contains(id))
        .collect();

    if !unresolved.is_empty() {
        tracing::warn!(missing = ?unresolved, expr, "injection references undefined variable(s)");
        return "1".to_string();
    }

    let substituted = substitute_bindings(&expr, bindings);

    match eval::parse_and_eval(&substituted) {
        Ok(value) => coerce(value),
        Err(e) => {
            tracing::warn!(error = %e, expr = substituted, "injection evaluation failed");
            "1".to_string()
        }
    }
}

fn substitute_bindings(expr: &str, bindings: &Bindings) -> String {
    let mut out = expr.to_string();
    for (name, value) in bindings.iter_in_order() {
        let word = Regex::new(&format!(r"\b{}\b", regex::escape(name))).unwrap();
        let literal = match value {
            BindingValue::Integer(i) => i.to_string(),
            BindingValue::Real(r) => r.to_string(),
            BindingValue::Boolean(b) => b.to_string(),
            BindingValue::Text(t) => format!("'{}'", t.replace('\'', "\\'")),
        };
        out = word.replace_all(&out, literal.as_str()).to_string();
    }
    out
}

fn coerce(value: eval::Value) -> String {
    match value {
        eval::Value::Number(n) => {
            let rounded = n.round() as i64;
            let clamped = rounded.max(1);
            clamped.to_string()
        }
        eval::Value::Bool(b) => b.to_string(),
        eval::Value::Text(t) => t,
    }
}

/// The closed-grammar arithmetic evaluator: literals, identifiers restricted
/// to the allowed function set, the four binary ops, unary minus, comparison,
/// and parenthesization. No attribute access, no indexing, no free name
/// lookups.
mod eval {
    #[derive(Debug, Clone, PartialEq)]
    pub enum Value {
        Number(f64),
        Bool(bool),
        Text(String),
    }

    impl Value {
        fn as_number(&self) -> Result<f64, String> {
            match self {
                Value::Number(n) => Ok(*n),
                other => Err(format!("expected a number, found {:?}", other)),
            }
        }
    }

    pub fn parse_and_eval(expr: &str) -> Result<Value, String> {
        let tokens = tokenize(expr)?;
        let mut parser = Parser { tokens, pos: 0 };
        let value = parser.parse_comparison()?;
        if parser.pos != parser.tokens.len() {
            return Err(format!("unexpected trailing input at token {}", parser.pos));
        }
        Ok(value)
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Token {
        Number(f64),
        Text(String),
        Ident(String),
        Plus,
        Minus,
        Star,
        Slash,
        Eq,
        Ne,
        Lt,
        Le,
        Gt,
        Ge,
        LParen,
        RParen,
        Comma,
    }

    fn tokenize(expr: &str) -> Result<Vec<Token>, String> {
        let chars: Vec<char> = expr.chars().collect();
        let mut tokens = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c.is_whitespace() {
                i += 1;
            } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text.parse().map_err(|_| format!("bad number literal: {}", text))?;
                tokens.push(Token::Number(n));
            } else if c == '\'' {
                let start = i + 1;
                let mut j = start;
                let mut out = String::new();
                let mut closed = false;
                while j < chars.len() {
                    if chars[j] == '\\' && j + 1 < chars.len() {
                        out.push(chars[j + 1]);
                        j += 2;
                        continue;
                    }
                    if chars[j] == '\'' {
                        closed = true;
                        break;
                    }
                    out.push(chars[j]);
                    j += 1;
                }
                if !closed {
                    return Err("unterminated string literal".to_string());
                }
                tokens.push(Token::Text(out));
                i = j + 1;
            } else if c.is_alphabetic() || c == '_' {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            } else {
                match c {
                    '+' => tokens.push(Token::Plus),
                    '-' => tokens.push(Token::Minus),
                    '*' => tokens.push(Token::Star),
                    '/' => tokens.push(Token::Slash),
                    '(' => tokens.push(Token::LParen),
                    ')' => tokens.push(Token::RParen),
                    ',' => tokens.push(Token::Comma),
                    '=' if chars.get(i + 1) == Some(&'=') => {
                        tokens.push(Token::Eq);
                        i += 1;
                    }
                    '!' if chars.get(i + 1) == Some(&'=') => {
                        tokens.push(Token::Ne);
                        i += 1;
                    }
                    '<' if chars.get(i + 1) == Some(&'=') => {
                        tokens.push(Token::Le);
                        i += 1;
                    }
                    '>' if chars.get(i + 1) == Some(&'=') => {
                        tokens.push(Token::Ge);
                        i += 1;
                    }
                    '<' => tokens.push(Token::Lt),
                    '>' => tokens.push(Token::Gt),
                    other => return Err(format!("unexpected character: {}", other)),
                }
                i += 1;
                continue;
            }
        }
        Ok(tokens)
    }

    struct Parser {
        tokens: Vec<Token>,
        pos: usize,
    }

    impl Parser {
        fn peek(&self) -> Option<&Token> {
            self.tokens.get(self.pos)
        }

        fn advance(&mut self) -> Option<Token> {
            let t = self.tokens.get(self.pos).cloned();
            self.pos += 1;
            t
        }

        fn parse_comparison(&mut self) -> Result<Value, String> {
            let left = self.parse_additive()?;
            let op = match self.peek() {
                Some(Token::Eq) => Some(Token::Eq),
                Some(Token::Ne) => Some(Token::Ne),
                Some(Token::Lt) => Some(Token::Lt),
                Some(Token::Le) => Some(Token::Le),
                Some(Token::Gt) => Some(Token::Gt),
                Some(Token::Ge) => Some(Token::Ge),
                _ => None,
            };
            let Some(op) = op else { return Ok(left) };
            self.advance();
            let right = self.parse_additive()?;
            let (l, r) = (left.as_number()?, right.as_number()?);
            let result = match op {
                Token::Eq => l == r,
                Token::Ne => l != r,
                Token::Lt => l < r,
                Token::Le => l <= r,
                Token::Gt => l > r,
                Token::Ge => l >= r,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }

        fn parse_additive(&mut self) -> Result<Value, String> {
            let mut left = self.parse_multiplicative()?;
            loop {
                match self.peek() {
                    Some(Token::Plus) => {
                        self.advance();
                        let right = self.parse_multiplicative()?;
                        left = Value::Number(left.as_number()? + right.as_number()?);
                    }
                    Some(Token::Minus) => {
                        self.advance();
                        let right = self.parse_multiplicative()?;
                        left = Value::Number(left.as_number()? - right.as_number()?);
                    }
                    _ => break,
                }
            }
            Ok(left)
        }

        fn parse_multiplicative(&mut self) -> Result<Value, String> {
            let mut left = self.parse_unary()?;
            loop {
                match self.peek() {
                    Some(Token::Star) => {
                        self.advance();
                        let right = self.parse_unary()?;
                        left = Value::Number(left.as_number()? * right.as_number()?);
                    }
                    Some(Token::Slash) => {
                        self.advance();
                        let right = self.parse_unary()?;
                        let divisor = right.as_number()?;
                        if divisor == 0.0 {
                            return Err("division by zero".to_string());
                        }
                        left = Value::Number(left.as_number()? / divisor);
                    }
                    _ => break,
                }
            }
            Ok(left)
        }

        fn parse_unary(&mut self) -> Result<Value, String> {
            if let Some(Token::Minus) = self.peek() {
                self.advance();
                let v = self.parse_unary()?;
                return Ok(Value::Number(-v.as_number()?));
            }
            self.parse_primary()
        }

        fn parse_primary(&mut self) -> Result<Value, String> {
            match self.advance() {
                Some(Token::Number(n)) => Ok(Value::Number(n)),
                Some(Token::Text(t)) => Ok(Value::Text(t)),
                Some(Token::LParen) => {
                    let v = self.parse_comparison()?;
                    match self.advance() {
                        Some(Token::RParen) => Ok(v),
                        _ => Err("expected closing parenthesis".to_string()),
                    }
                }
                Some(Token::Ident(name)) => self.parse_call(&name),
                other => Err(format!("unexpected token: {:?}", other)),
            }
        }

        fn parse_call(&mut self, name: &str) -> Result<Value, String> {
            if !matches!(self.peek(), Some(Token::LParen)) {
                return Err(format!("bare identifier not allowed: {}", name));
            }
            self.advance();
            let mut args = Vec::new();
            if !matches!(self.peek(), Some(Token::RParen)) {
                loop {
                    args.push(self.parse_comparison()?);
                    match self.peek() {
                        Some(Token::Comma) => {
                            self.advance();
                        }
                        _ => break,
                    }
                }
            }
            match self.advance() {
                Some(Token::RParen) => {}
                _ => return Err("expected closing parenthesis in call".to_string()),
            }
            apply_function(name, args)
        }
    }

    fn apply_function(name: &str, args: Vec<Value>) -> Result<Value, String> {
        let nums: Result<Vec<f64>, String> = args.iter().map(|v| v.as_number()).collect();
        match name {
            "int" => Ok(Value::Number(nums?.first().copied().unwrap_or(0.0).trunc())),
            "float" => Ok(Value::Number(nums?.first().copied().unwrap_or(0.0))),
            "round" => Ok(Value::Number(nums?.first().copied().unwrap_or(0.0).round())),
            "abs" => Ok(Value::Number(nums?.first().copied().unwrap_or(0.0).abs())),
            "ceil" => Ok(Value::Number(nums?.first().copied().unwrap_or(0.0).ceil())),
            "floor" => Ok(Value::Number(nums?.first().copied().unwrap_or(0.0).floor())),
            "min" => {
                let nums = nums?;
                nums.into_iter()
                    .fold(None, |acc, n| Some(acc.map_or(n, |a: f64| a.min(n))))
                    .map(Value::Number)
                    .ok_or_else(|| "min() requires at least one argument".to_string())
            }
            "max" => {
                let nums = nums?;
                nums.into_iter()
                    .fold(None, |acc, n| Some(acc.map_or(n, |a: f64| a.max(n))))
                    .map(Value::Number)
                    .ok_or_else(|| "max() requires at least one argument".to_string())
            }
            other => Err(format!("unknown function: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BindingValue;

    fn bindings_with(pairs: &[(&str, BindingValue)]) -> Bindings {
        let mut b = Bindings::new();
        for (k, v) in pairs {
            b.set(*k, v.clone());
        }
        b
    }

    #[test]
    fn clamps_underflow_to_one() {
        let bindings = bindings_with(&[("total", BindingValue::Integer(0))]);
        assert_eq!(evaluate_injection("INJECT(total/4)", &bindings), "1");
    }

    #[test]
    fn evaluates_division() {
        let bindings = bindings_with(&[("total", BindingValue::Integer(10882))]);
        assert_eq!(evaluate_injection("INJECT(total/2)", &bindings), "5441");
    }

    #[test]
    fn missing_variable_clamps_to_one() {
        let bindings = Bindings::new();
        assert_eq!(evaluate_injection("INJECT(missing/2)", &bindings), "1");
    }

    #[test]
    fn unwraps_either_nesting_order() {
        let bindings = bindings_with(&[("total", BindingValue::Integer(20))]);
        assert_eq!(
            evaluate_injection("INJECT(evaluate(total/2))", &bindings),
            evaluate_injection("evaluate(INJECT(total/2))", &bindings),
        );
    }

    #[test]
    fn supports_allowed_functions() {
        let bindings = bindings_with(&[("total", BindingValue::Real(10.6))]);
        assert_eq!(evaluate_injection("INJECT(round(total))", &bindings), "11");
        assert_eq!(evaluate_injection("INJECT(floor(total))", &bindings), "10");
        assert_eq!(evaluate_injection("INJECT(ceil(total))", &bindings), "11");
    }

    #[test]
    fn rejects_disallowed_identifiers() {
        let bindings = Bindings::new();
        assert_eq!(evaluate_injection("INJECT(__import__(1))", &bindings), "1");
    }

    #[test]
    fn extracts_markers_in_order() {
        let sparql = "SELECT ?x WHERE {?x ?p ?o} LIMIT INJECT(total/2) OFFSET INJECT(skip)";
        let markers = extract_inject_markers(sparql);
        assert_eq!(markers, vec!["INJECT(total/2)", "INJECT(skip)"]);
    }

    #[test]
    fn replace_first_only_replaces_first_occurrence() {
        let sparql = "LIMIT INJECT(x) OFFSET INJECT(x)";
        let replaced = replace_first(sparql, "INJECT(x)", "5").unwrap();
        assert_eq!(replaced, "LIMIT 5 OFFSET INJECT(x)");
    }
}

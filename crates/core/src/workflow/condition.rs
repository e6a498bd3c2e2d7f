//! Constrained condition evaluator.
//!
//! Conditions gate steps against a read-only projection of accumulated
//! results. The language is deliberately tiny: dot-path lookups, literals,
//! the comparators `== != > < >= <=` and `contains`, negation with `!`,
//! `&&` / `||`, and parentheses. No method calls, no arithmetic, no side
//! effects. Arbitrary expression evaluation is a security hazard and is
//! not supported.
//!
//! The projection maps step ids to `{ "data": .., "status": .., "metadata":
//! { "attempts": .., "agent_id": .. } }`, so a typical gate reads
//! `fetch.data.rows > 0 && fetch.status == 'succeeded'`. A bare path is a
//! truthiness test; a missing path resolves to null (falsy).

use serde_json::Value;

/// Parse or type failure while evaluating a condition
#[derive(Debug, Clone, thiserror::Error)]
#[error("condition error: {0}")]
pub struct ConditionError(pub String);

/// Evaluate `expr` against the state projection `scope`.
pub fn evaluate(expr: &str, scope: &Value) -> Result<bool, ConditionError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens, pos: 0 };
    let result = parser.parse_or(scope)?;
    if parser.pos != parser.tokens.len() {
        return Err(ConditionError(format!(
            "unexpected trailing input in '{}'",
            expr
        )));
    }
    Ok(result)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Bang,
    And,
    Or,
    Cmp(Comparator),
    Path(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(ConditionError("expected '&&'".to_string()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(ConditionError("expected '||'".to_string()));
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(Comparator::Eq));
                    i += 2;
                } else {
                    return Err(ConditionError(
                        "assignment is not supported; use '=='".to_string(),
                    ));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(Comparator::Ne));
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(Comparator::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Cmp(Comparator::Gt));
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(Comparator::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Cmp(Comparator::Lt));
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end == chars.len() {
                    return Err(ConditionError("unterminated string literal".to_string()));
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| ConditionError(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Num(num));
            }
            c if is_path_char(c) => {
                let start = i;
                while i < chars.len() && (is_path_char(chars[i]) || chars[i] == '.') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    "null" => tokens.push(Token::Null),
                    "contains" => tokens.push(Token::Cmp(Comparator::Contains)),
                    _ => tokens.push(Token::Path(word)),
                }
            }
            other => {
                return Err(ConditionError(format!("unexpected character '{}'", other)));
            }
        }
    }

    Ok(tokens)
}

// Loop-iteration result keys contain '#'
fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '#'
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self, scope: &Value) -> Result<bool, ConditionError> {
        let mut result = self.parse_and(scope)?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and(scope)?;
            result = result || rhs;
        }
        Ok(result)
    }

    fn parse_and(&mut self, scope: &Value) -> Result<bool, ConditionError> {
        let mut result = self.parse_unary(scope)?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_unary(scope)?;
            result = result && rhs;
        }
        Ok(result)
    }

    fn parse_unary(&mut self, scope: &Value) -> Result<bool, ConditionError> {
        if self.peek() == Some(&Token::Bang) {
            self.next();
            return Ok(!self.parse_unary(scope)?);
        }
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let inner = self.parse_or(scope)?;
            match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err(ConditionError("missing closing parenthesis".to_string())),
            }
        } else {
            self.parse_comparison(scope)
        }
    }

    fn parse_comparison(&mut self, scope: &Value) -> Result<bool, ConditionError> {
        let left = self.parse_operand(scope)?;

        match self.peek() {
            Some(Token::Cmp(op)) => {
                let op = *op;
                self.next();
                let right = self.parse_operand(scope)?;
                Ok(compare(&left, op, &right))
            }
            // Bare operand: truthiness
            _ => Ok(truthy(&left)),
        }
    }

    fn parse_operand(&mut self, scope: &Value) -> Result<Value, ConditionError> {
        match self.next() {
            Some(Token::Path(path)) => Ok(resolve_path(scope, &path)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Num(n)) => serde_json::Number::from_f64(n)
                .map(Value::Number)
                .ok_or_else(|| ConditionError(format!("invalid number {}", n))),
            Some(Token::Bool(b)) => Ok(Value::Bool(b)),
            Some(Token::Null) => Ok(Value::Null),
            other => Err(ConditionError(format!(
                "expected an operand, found {:?}",
                other
            ))),
        }
    }
}

/// Dot-path lookup; a missing segment resolves to null.
fn resolve_path(scope: &Value, path: &str) -> Value {
    let mut current = scope;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn compare(left: &Value, op: Comparator, right: &Value) -> bool {
    match op {
        Comparator::Eq => values_equal(left, right),
        Comparator::Ne => !values_equal(left, right),
        Comparator::Gt => numeric_cmp(left, right).map(|o| o.is_gt()).unwrap_or(false),
        Comparator::Lt => numeric_cmp(left, right).map(|o| o.is_lt()).unwrap_or(false),
        Comparator::Ge => numeric_cmp(left, right).map(|o| o.is_ge()).unwrap_or(false),
        Comparator::Le => numeric_cmp(left, right).map(|o| o.is_le()).unwrap_or(false),
        Comparator::Contains => contains(left, right),
    }
}

/// Numbers compare numerically even when one side is a numeric string.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (as_f64(left), as_f64(right)) {
        (Some(l), Some(r)) => (l - r).abs() < f64::EPSILON,
        _ => match (left, right) {
            (Value::String(l), Value::String(r)) => l == r,
            _ => left == right,
        },
    }
}

fn numeric_cmp(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (as_f64(left), as_f64(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r),
        _ => match (left, right) {
            (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
            _ => None,
        },
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn contains(left: &Value, right: &Value) -> bool {
    match left {
        Value::String(s) => match right {
            Value::String(needle) => s.contains(needle.as_str()),
            _ => false,
        },
        Value::Array(items) => items.iter().any(|item| values_equal(item, right)),
        Value::Object(map) => match right {
            Value::String(key) => map.contains_key(key.as_str()),
            _ => false,
        },
        _ => false,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

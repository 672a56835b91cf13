//! Sandboxed evaluation of small data expressions such as
//! `fetch.output.items[0].title` or `a.output.length + 1 > 3`.
//!
//! Two layers of protection:
//! 1. a deny-list of dangerous names, matched against the tokens: free
//!    identifiers are checked for globals, module loaders and dynamic code,
//!    while property names and string index keys are checked for object
//!    internals. String literals are never matched;
//! 2. an allow-list grammar: literals, identifiers, property access,
//!    indexing, arithmetic, comparison and boolean operators. Calls,
//!    assignment, object construction and everything else fail to parse.
//!
//! Identifiers resolve only against the supplied context map.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Number, Value};
use tracing::warn;

use lisa_core::error::{LisaError, Result};

const DEFAULT_MAX_LENGTH: usize = 1024;
const DEFAULT_MAX_DEPTH: usize = 32;

/// Context key under which every visible task output is also reachable by id.
pub const TASK_ROOT: &str = "$task";

/// `(pattern, label)` pairs for free identifiers.
const DENIED_NAMES: &[(&str, &str)] = &[
    (r"^(eval|Function)$", "dynamic code evaluation"),
    (r"^(process|global|globalThis|window|self|document|this)$", "global object access"),
    (r"^(Deno|Bun)$", "runtime access"),
    (r"^(require|import|module|exports)$", "module loading"),
    (r"^(Reflect|Proxy|Symbol|Object)$", "reflection"),
    (r"^(new|delete|async|await|yield)$", "reserved keyword"),
];

/// `(pattern, label)` pairs for property names and string index keys.
/// Free identifiers are checked against these too.
const DENIED_PROPERTIES: &[(&str, &str)] = &[
    (r"^constructor$", "constructor access"),
    (r"^(prototype|__proto__)$", "prototype manipulation"),
    (r"^__(define|lookup)(G|S)etter__$", "accessor manipulation"),
];

struct DenyMatcher {
    names: Vec<(Regex, &'static str)>,
    properties: Vec<(Regex, &'static str)>,
}

impl DenyMatcher {
    fn new() -> Self {
        Self {
            names: compile(DENIED_NAMES),
            properties: compile(DENIED_PROPERTIES),
        }
    }

    fn property(&self, key: &str) -> Option<&'static str> {
        self.properties
            .iter()
            .find(|(re, _)| re.is_match(key))
            .map(|(_, label)| *label)
    }

    fn name(&self, ident: &str) -> Option<&'static str> {
        self.property(ident).or_else(|| {
            self.names
                .iter()
                .find(|(re, _)| re.is_match(ident))
                .map(|(_, label)| *label)
        })
    }

    /// First denied token, judged by the position it appears in.
    fn scan(&self, tokens: &[Token]) -> Result<()> {
        for (i, token) in tokens.iter().enumerate() {
            let prev = i.checked_sub(1).and_then(|p| tokens.get(p));
            let (label, text) = match token {
                Token::Ident(name) if prev == Some(&Token::Dot) => (self.property(name), name),
                Token::Ident(name) => (self.name(name), name),
                Token::Str(key) if prev == Some(&Token::LBracket) && tokens.get(i + 1) == Some(&Token::RBracket) => {
                    (self.property(key), key)
                }
                _ => continue,
            };
            if let Some(label) = label {
                return Err(denied(label, text));
            }
        }
        Ok(())
    }
}

fn compile(table: &[(&str, &'static str)]) -> Vec<(Regex, &'static str)> {
    table
        .iter()
        .filter_map(|(pattern, label)| match Regex::new(pattern) {
            Ok(re) => Some((re, *label)),
            Err(e) => {
                warn!(pattern, error = %e, "Invalid deny pattern, skipping");
                None
            }
        })
        .collect()
}

fn denied(label: &str, name: &str) -> LisaError {
    LisaError::UnsafeExpression(format!("{} is not allowed ('{}')", label, name))
}

fn deny_matcher() -> &'static DenyMatcher {
    static MATCHER: OnceLock<DenyMatcher> = OnceLock::new();
    MATCHER.get_or_init(DenyMatcher::new)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| LisaError::Expression(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(LisaError::Expression("unterminated string".into())),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| LisaError::Expression("unterminated string".into()))?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' | '!' if next == Some('=') => {
                // `==`/`===` and `!=`/`!==` compare the same way.
                let eq = c == '=';
                i += 2;
                if chars.get(i) == Some(&'=') {
                    i += 1;
                }
                tokens.push(if eq { Token::Eq } else { Token::NotEq });
            }
            '=' => return Err(LisaError::UnsafeExpression("assignment is not allowed".into())),
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let or_equal = next == Some('=');
                tokens.push(match (c, or_equal) {
                    ('<', true) => Token::Le,
                    ('<', false) => Token::Lt,
                    (_, true) => Token::Ge,
                    _ => Token::Gt,
                });
                i += if or_equal { 2 } else { 1 };
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            other => {
                return Err(LisaError::UnsafeExpression(format!(
                    "character '{}' is not allowed",
                    other
                )))
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Neg,
    Plus,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    max_depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(LisaError::Expression("expression nests too deeply".into()));
        }
        Ok(())
    }

    fn parse(mut self) -> Result<Expr> {
        if self.tokens.is_empty() {
            return Err(LisaError::Expression("empty expression".into()));
        }
        let expr = self.parse_or()?;
        match self.peek() {
            None => Ok(expr),
            Some(token) => Err(LisaError::Expression(format!("unexpected token {:?}", token))),
        }
    }

    fn parse_binary(
        &mut self,
        ops: &[(Token, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr>,
    ) -> Result<Expr> {
        let mut left = next(self)?;
        'outer: loop {
            for (token, op) in ops {
                if self.eat(token) {
                    let right = next(self)?;
                    left = Expr::Binary(*op, Box::new(left), Box::new(right));
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        self.parse_binary(&[(Token::Or, BinaryOp::Or)], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        self.parse_binary(&[(Token::And, BinaryOp::And)], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        self.parse_binary(
            &[(Token::Eq, BinaryOp::Eq), (Token::NotEq, BinaryOp::NotEq)],
            Self::parse_comparison,
        )
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        self.parse_binary(
            &[
                (Token::Le, BinaryOp::Le),
                (Token::Lt, BinaryOp::Lt),
                (Token::Ge, BinaryOp::Ge),
                (Token::Gt, BinaryOp::Gt),
            ],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        self.parse_binary(
            &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)],
            Self::parse_multiplicative,
        )
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        self.parse_binary(
            &[
                (Token::Star, BinaryOp::Mul),
                (Token::Slash, BinaryOp::Div),
                (Token::Percent, BinaryOp::Rem),
            ],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        self.enter()?;
        let op = match self.peek() {
            Some(Token::Minus) => Some(UnaryOp::Neg),
            Some(Token::Plus) => Some(UnaryOp::Plus),
            Some(Token::Not) => Some(UnaryOp::Not),
            _ => None,
        };
        let expr = match op {
            Some(op) => {
                self.pos += 1;
                Expr::Unary(op, Box::new(self.parse_unary()?))
            }
            None => self.parse_postfix()?,
        };
        self.depth -= 1;
        Ok(expr)
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.advance() {
                        Some(Token::Ident(name)) => expr = Expr::Member(Box::new(expr), name),
                        _ => return Err(LisaError::Expression("expected property name after '.'".into())),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    self.enter()?;
                    let index = self.parse_or()?;
                    self.depth -= 1;
                    if !self.eat(&Token::RBracket) {
                        return Err(LisaError::Expression("expected ']'".into()));
                    }
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::LParen) => {
                    return Err(LisaError::UnsafeExpression("function calls are not allowed".into()));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number(n)?)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "undefined" => Expr::Literal(Value::Null),
                _ => Expr::Ident(name),
            }),
            Some(Token::LParen) => {
                self.enter()?;
                let expr = self.parse_or()?;
                self.depth -= 1;
                if !self.eat(&Token::RParen) {
                    return Err(LisaError::Expression("expected ')'".into()));
                }
                Ok(expr)
            }
            Some(token) => Err(LisaError::Expression(format!("unexpected token {:?}", token))),
            None => Err(LisaError::Expression("unexpected end of expression".into())),
        }
    }
}

/// Integral values stay integers so `[1,2,3].length` is `3`, not `3.0`.
fn number(n: f64) -> Result<Value> {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Ok(Value::from(n as i64));
    }
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| LisaError::Expression("result is not a finite number".into()))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn as_number(value: &Value, op: &str) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| LisaError::Expression(format!("'{}' needs numbers", op))),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Null => Ok(0.0),
        other => Err(LisaError::Expression(format!(
            "'{}' needs numbers, got {}",
            op,
            type_name(other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Text form used for string concatenation and template interpolation.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn member(target: &Value, name: &str) -> Result<Value> {
    match target {
        Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
        Value::Array(items) if name == "length" => Ok(Value::from(items.len())),
        Value::String(s) if name == "length" => Ok(Value::from(s.chars().count())),
        Value::Null => Err(LisaError::Expression(format!(
            "cannot read property '{}' of null",
            name
        ))),
        _ => Ok(Value::Null),
    }
}

fn index(target: &Value, key: &Value) -> Result<Value> {
    match (target, key) {
        (Value::Null, _) => Err(LisaError::Expression("cannot index null".into())),
        (Value::Array(items), Value::Number(n)) => Ok(n
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0)
            .and_then(|f| items.get(f as usize))
            .cloned()
            .unwrap_or(Value::Null)),
        (Value::String(s), Value::Number(n)) => Ok(n
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0)
            .and_then(|f| s.chars().nth(f as usize))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null)),
        (_, Value::String(name)) => match deny_matcher().property(name) {
            Some(label) => Err(denied(label, name)),
            None => member(target, name),
        },
        (Value::Object(map), other) => Ok(map.get(&to_text(other)).cloned().unwrap_or(Value::Null)),
        _ => Ok(Value::Null),
    }
}

fn eval(expr: &Expr, context: &Map<String, Value>) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => context
            .get(name)
            .cloned()
            .ok_or_else(|| LisaError::Expression(format!("'{}' is not defined", name))),
        Expr::Member(target, name) => member(&eval(target, context)?, name),
        Expr::Index(target, key) => index(&eval(target, context)?, &eval(key, context)?),
        Expr::Unary(op, operand) => {
            let value = eval(operand, context)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnaryOp::Neg => number(-as_number(&value, "-")?),
                UnaryOp::Plus => number(as_number(&value, "+")?),
            }
        }
        Expr::Binary(BinaryOp::And, left, right) => {
            let l = eval(left, context)?;
            if truthy(&l) {
                eval(right, context)
            } else {
                Ok(l)
            }
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            let l = eval(left, context)?;
            if truthy(&l) {
                Ok(l)
            } else {
                eval(right, context)
            }
        }
        Expr::Binary(op, left, right) => {
            let l = eval(left, context)?;
            let r = eval(right, context)?;
            binary(*op, &l, &r)
        }
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    match op {
        BinaryOp::Add => {
            if l.is_string() || r.is_string() {
                Ok(Value::String(format!("{}{}", to_text(l), to_text(r))))
            } else {
                number(as_number(l, "+")? + as_number(r, "+")?)
            }
        }
        BinaryOp::Sub => number(as_number(l, "-")? - as_number(r, "-")?),
        BinaryOp::Mul => number(as_number(l, "*")? * as_number(r, "*")?),
        BinaryOp::Div | BinaryOp::Rem => {
            let symbol = if op == BinaryOp::Div { "/" } else { "%" };
            let divisor = as_number(r, symbol)?;
            if divisor == 0.0 {
                return Err(LisaError::Expression("division by zero".into()));
            }
            let dividend = as_number(l, symbol)?;
            number(if op == BinaryOp::Div { dividend / divisor } else { dividend % divisor })
        }
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(l, r))),
        BinaryOp::NotEq => Ok(Value::Bool(!loose_eq(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (l, r) {
                (Value::String(a), Value::String(b)) => a.partial_cmp(b),
                _ => as_number(l, "compare")?.partial_cmp(&as_number(r, "compare")?),
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::And => Ok(if truthy(l) { r.clone() } else { l.clone() }),
        BinaryOp::Or => Ok(if truthy(l) { l.clone() } else { r.clone() }),
    }
}

fn is_task_root(expr: &Expr) -> bool {
    matches!(expr, Expr::Ident(name) if name == TASK_ROOT)
}

fn collect_identifiers(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Ident(name) => {
            out.insert(name.clone());
        }
        Expr::Member(target, name) => {
            if is_task_root(target) {
                out.insert(name.clone());
            }
            collect_identifiers(target, out);
        }
        Expr::Index(target, key) => {
            if let (true, Expr::Literal(Value::String(id))) = (is_task_root(target), key.as_ref()) {
                out.insert(id.clone());
            }
            collect_identifiers(target, out);
            collect_identifiers(key, out);
        }
        Expr::Unary(_, operand) => collect_identifiers(operand, out),
        Expr::Binary(_, left, right) => {
            collect_identifiers(left, out);
            collect_identifiers(right, out);
        }
    }
}

/// Evaluates expressions against a read-only context map.
#[derive(Debug, Clone)]
pub struct ExpressionEvaluator {
    max_length: usize,
    max_depth: usize,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_limits(max_length: usize, max_depth: usize) -> Self {
        Self {
            max_length,
            max_depth: max_depth.max(1),
        }
    }

    /// Reject expressions that are too long, contain disallowed characters
    /// or use a denied name.
    pub fn check(&self, expression: &str) -> Result<()> {
        self.scan(expression).map(|_| ())
    }

    fn scan(&self, expression: &str) -> Result<Vec<Token>> {
        if expression.len() > self.max_length {
            return Err(LisaError::UnsafeExpression(format!(
                "expression longer than {} bytes",
                self.max_length
            )));
        }
        let tokens = tokenize(expression)?;
        deny_matcher().scan(&tokens)?;
        Ok(tokens)
    }

    fn parse(&self, expression: &str) -> Result<Expr> {
        Parser {
            tokens: self.scan(expression)?,
            pos: 0,
            depth: 0,
            max_depth: self.max_depth,
        }
        .parse()
    }

    pub fn evaluate(&self, expression: &str, context: &Map<String, Value>) -> Result<Value> {
        let expr = self.parse(expression)?;
        eval(&expr, context)
    }

    /// Context names an expression reads, without evaluating it. Static keys
    /// under `$task` (`$task.id`, `$task['id']`) are reported as names too.
    pub fn identifiers(&self, expression: &str) -> Result<BTreeSet<String>> {
        let expr = self.parse(expression)?;
        let mut out = BTreeSet::new();
        collect_identifiers(&expr, &mut out);
        Ok(out)
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lisa_core::error::ErrorKind;
    use serde_json::json;

    fn ctx(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("context must be an object"),
        }
    }

    fn eval_ok(expr: &str, context: Value) -> Value {
        ExpressionEvaluator::new().evaluate(expr, &ctx(context)).unwrap()
    }

    fn eval_err(expr: &str) -> LisaError {
        ExpressionEvaluator::new()
            .evaluate(expr, &ctx(json!({"task1": {"output": [1, 2, 3]}})))
            .unwrap_err()
    }

    #[test]
    fn test_length_of_output() {
        let v = eval_ok("task1.output.length", json!({"task1": {"output": [1, 2, 3]}}));
        assert_eq!(v, json!(3));
    }

    #[test]
    fn test_property_and_index_access() {
        let context = json!({"fetch": {"output": {"items": [{"title": "a"}, {"title": "b"}]}}});
        assert_eq!(eval_ok("fetch.output.items[1].title", context.clone()), json!("b"));
        assert_eq!(eval_ok("fetch.output['items'][0]['title']", context.clone()), json!("a"));
        assert_eq!(eval_ok("fetch.output.items[5]", context.clone()), Value::Null);
        assert_eq!(eval_ok("fetch.output.missing", context), Value::Null);
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        let context = json!({"a": {"output": 4}, "b": {"output": 2.5}});
        assert_eq!(eval_ok("a.output + 2 * 3", context.clone()), json!(10));
        assert_eq!(eval_ok("(a.output + 2) * 3", context.clone()), json!(18));
        assert_eq!(eval_ok("a.output * b.output", context.clone()), json!(10));
        assert_eq!(eval_ok("a.output / 8", context.clone()), json!(0.5));
        assert_eq!(eval_ok("-a.output % 3", context.clone()), json!(-1));
        assert_eq!(eval_ok("'n=' + a.output", context), json!("n=4"));
    }

    #[test]
    fn test_comparison_and_logic() {
        let context = json!({"t": {"output": {"count": 3, "name": "x"}}});
        assert_eq!(eval_ok("t.output.count > 2 && t.output.name == 'x'", context.clone()), json!(true));
        assert_eq!(eval_ok("t.output.count <= 2 || !t.output.name", context.clone()), json!(false));
        assert_eq!(eval_ok("t.output.count === 3.0", context.clone()), json!(true));
        assert_eq!(eval_ok("t.output.count != 3", context.clone()), json!(false));
        assert_eq!(eval_ok("t.output.missing || 'fallback'", context), json!("fallback"));
    }

    #[test]
    fn test_denied_identifiers() {
        for expr in [
            "process.env.HOME",
            "globalThis",
            "task1.constructor",
            "task1.__proto__",
            "task1.output.prototype",
            "require('fs')",
            "eval('1')",
            "Function('return 1')",
            "this.x",
            "window.location",
            "import('x')",
        ] {
            assert_eq!(eval_err(expr).kind(), ErrorKind::UnsafeExpression, "{}", expr);
        }
    }

    #[test]
    fn test_denied_words_as_ids_keys_and_text() {
        let context = json!({
            "fetch": {"output": {"items": [1, 2], "env": "prod", "module": "core"}},
            "t": {"output": {"name": "new"}},
            "$task": {"fetch": {"output": {"items": [1, 2]}}}
        });
        assert_eq!(eval_ok("fetch.output.items.length", context.clone()), json!(2));
        assert_eq!(eval_ok("fetch.output.env", context.clone()), json!("prod"));
        assert_eq!(eval_ok("fetch.output['module']", context.clone()), json!("core"));
        assert_eq!(eval_ok("t.output.name == 'new'", context.clone()), json!(true));
        assert_eq!(eval_ok("'self service'", context.clone()), json!("self service"));
        assert_eq!(eval_ok("'a;b' + ' => ' + 'process'", context.clone()), json!("a;b => process"));
        assert_eq!(eval_ok("$task['fetch'].output.items[1]", context), json!(2));
    }

    #[test]
    fn test_denied_property_keys() {
        for expr in [
            "task1['constructor']",
            "task1.output['__proto__']",
            "task1.__defineGetter__",
            "task1.output['con' + 'structor']",
            "constructor",
        ] {
            assert_eq!(eval_err(expr).kind(), ErrorKind::UnsafeExpression, "{}", expr);
        }
    }

    #[test]
    fn test_disallowed_constructs() {
        for expr in ["task1.output.map(x)", "a = 1", "x => x", "`${a}`", "a; b", "{}"] {
            assert_eq!(eval_err(expr).kind(), ErrorKind::UnsafeExpression, "{}", expr);
        }
    }

    #[test]
    fn test_unknown_identifier_is_expression_error() {
        let err = eval_err("other.output");
        assert_eq!(err.kind(), ErrorKind::Expression);
        assert!(err.to_string().contains("'other' is not defined"));
    }

    #[test]
    fn test_null_access_and_division() {
        assert_eq!(eval_err("task1.output.x.y").kind(), ErrorKind::Expression);
        assert_eq!(eval_err("1 / 0").kind(), ErrorKind::Expression);
        assert_eq!(eval_err("1 +").kind(), ErrorKind::Expression);
        assert_eq!(eval_err("").kind(), ErrorKind::Expression);
    }

    #[test]
    fn test_limits() {
        let evaluator = ExpressionEvaluator::with_limits(16, 4);
        let long = "1 + 1 + 1 + 1 + 1 + 1";
        assert_eq!(
            evaluator.evaluate(long, &Map::new()).unwrap_err().kind(),
            ErrorKind::UnsafeExpression
        );
        let deep = "((((((1))))))";
        assert_eq!(
            evaluator.evaluate(deep, &Map::new()).unwrap_err().kind(),
            ErrorKind::Expression
        );
    }

    #[test]
    fn test_identifiers() {
        let ids = ExpressionEvaluator::new()
            .identifiers("a.output.length + b.output[c.output]")
            .unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);

        let ids = ExpressionEvaluator::new()
            .identifiers("$task['user-name'].output + $task.b.output")
            .unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["$task", "b", "user-name"]);
    }
}

//! Plan expression language
//!
//! A small, closed expression grammar evaluated against a [`Scope`]:
//! variables (`$name`), literals, arrays, hashes (`{ 'k' => v }`), member
//! access (`$r.ok_set`), indexing (`$list[0]`), arithmetic and comparison,
//! boolean logic, and calls to a fixed set of built-in functions, either
//! prefix (`length($x)`) or chained (`$x.map |$n| { $n * 2 }`).
//!
//! Strings embedded in plan steps interpolate `${expr}` and `$var`.

use super::scope::Scope;
use super::value::PlanValue;
use crate::error::{Result, TetherError};
use crate::result::ResultSet;
use serde_json::{json, Map, Number, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Var(String),
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Pipe,
    Arrow,
    Colon,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    AndAnd,
    OrOr,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '$' {
            let start = i + 1;
            let mut end = start;
            while end < chars.len() && is_ident_char(chars[end]) {
                end += 1;
            }
            if end == start {
                return Err(TetherError::Expression(format!(
                    "expected a variable name after '$' in '{}'",
                    src
                )));
            }
            tokens.push(Token::Var(chars[start..end].iter().collect()));
            i = end;
            continue;
        }

        if is_ident_start(c) {
            let start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let is_float = i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit();
            if is_float {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let token = if is_float {
                text.parse::<f64>().map(Token::Float).ok()
            } else {
                text.parse::<i64>().map(Token::Int).ok()
            };
            tokens.push(token.ok_or_else(|| {
                TetherError::Expression(format!("invalid number '{}'", text))
            })?);
            continue;
        }

        if c == '\'' || c == '"' {
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => {
                        return Err(TetherError::Expression(format!(
                            "unterminated string in '{}'",
                            src
                        )))
                    }
                    Some(&q) if q == c => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        match chars.get(i + 1) {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(&other) => text.push(other),
                            None => text.push('\\'),
                        }
                        i += 2;
                    }
                    Some(&other) => {
                        text.push(other);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(text));
            continue;
        }

        let (token, width) = match (c, next) {
            ('=', Some('=')) => (Token::Eq, 2),
            ('=', Some('>')) => (Token::Arrow, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('&', Some('&')) => (Token::AndAnd, 2),
            ('|', Some('|')) => (Token::OrOr, 2),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            ('{', _) => (Token::LBrace, 1),
            ('}', _) => (Token::RBrace, 1),
            (',', _) => (Token::Comma, 1),
            ('.', _) => (Token::Dot, 1),
            ('|', _) => (Token::Pipe, 1),
            (':', _) => (Token::Colon, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('!', _) => (Token::Bang, 1),
            _ => {
                return Err(TetherError::Expression(format!(
                    "unexpected character '{}' in '{}'",
                    c, src
                )))
            }
        };
        tokens.push(token);
        i += width;
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Anonymous block passed to `map` and `filter`
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: Box<Expr>,
}

/// Parsed expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Array(Vec<Expr>),
    Hash(Vec<(Expr, Expr)>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call {
        name: String,
        args: Vec<Expr>,
        lambda: Option<Lambda>,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
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

    fn eat_keyword(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(w)) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.advance() {
            Some(ref t) if *t == token => Ok(()),
            other => Err(TetherError::Expression(format!(
                "expected {:?}, found {:?}",
                token, other
            ))),
        }
    }

    fn expression(&mut self) -> Result<Expr> {
        self.or()
    }

    fn or(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        while self.eat(&Token::OrOr) || self.eat_keyword("or") {
            let right = self.and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.not()?;
        while self.eat(&Token::AndAnd) || self.eat_keyword("and") {
            let right = self.not()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr> {
        if self.eat(&Token::Bang) || self.eat_keyword("not") {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let left = self.additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::Ne) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            Some(Token::Ident(w)) if w == "in" => BinaryOp::In,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = match self.advance() {
                    Some(Token::Ident(name)) => name,
                    other => {
                        return Err(TetherError::Expression(format!(
                            "expected a name after '.', found {:?}",
                            other
                        )))
                    }
                };
                let has_args = self.peek() == Some(&Token::LParen);
                let has_lambda = self.peek() == Some(&Token::Pipe);
                if has_args || has_lambda {
                    let mut args = vec![expr];
                    if has_args {
                        args.extend(self.arguments()?);
                    }
                    let lambda = self.lambda()?;
                    expr = Expr::Call { name, args, lambda };
                } else {
                    expr = Expr::Member(Box::new(expr), name);
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.expression()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(Token::Comma)?;
        }
    }

    fn lambda(&mut self) -> Result<Option<Lambda>> {
        if !self.eat(&Token::Pipe) {
            return Ok(None);
        }
        let mut params = Vec::new();
        loop {
            match self.advance() {
                Some(Token::Var(name)) => params.push(name),
                other => {
                    return Err(TetherError::Expression(format!(
                        "expected a lambda parameter, found {:?}",
                        other
                    )))
                }
            }
            if self.eat(&Token::Pipe) {
                break;
            }
            self.expect(Token::Comma)?;
        }
        let body = if self.eat(&Token::LBrace) {
            let body = self.expression()?;
            self.expect(Token::RBrace)?;
            body
        } else {
            self.expression()?
        };
        Ok(Some(Lambda {
            params,
            body: Box::new(body),
        }))
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Int(n)) => Ok(Expr::Literal(json!(n))),
            Some(Token::Float(f)) => Ok(Expr::Literal(json!(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Var(name)) => Ok(Expr::Var(name)),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "undef" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => {
                    let args = self.arguments()?;
                    let lambda = self.lambda()?;
                    Ok(Expr::Call {
                        name: word,
                        args,
                        lambda,
                    })
                }
                // Bare words are strings, as in hash keys
                _ => Ok(Expr::Literal(Value::String(word))),
            },
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.expression()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                    }
                }
                Ok(Expr::Array(items))
            }
            Some(Token::LBrace) => {
                let mut pairs = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = self.expression()?;
                        if !self.eat(&Token::Arrow) {
                            self.expect(Token::Colon)?;
                        }
                        let value = self.expression()?;
                        pairs.push((key, value));
                        if self.eat(&Token::RBrace) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                        if self.eat(&Token::RBrace) {
                            break;
                        }
                    }
                }
                Ok(Expr::Hash(pairs))
            }
            other => Err(TetherError::Expression(format!(
                "unexpected {:?}",
                other
            ))),
        }
    }
}

/// Parse a complete expression
pub fn parse(src: &str) -> Result<Expr> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expression()?;
    if parser.pos < parser.tokens.len() {
        return Err(TetherError::Expression(format!(
            "unexpected {:?} in '{}'",
            parser.tokens[parser.pos], src
        )));
    }
    Ok(expr)
}

/// Parse and evaluate in one go
pub fn evaluate(src: &str, scope: &Scope) -> Result<PlanValue> {
    parse(src)?.eval(scope)
}

impl Expr {
    pub fn eval(&self, scope: &Scope) -> Result<PlanValue> {
        match self {
            Expr::Literal(value) => Ok(PlanValue::Data(value.clone())),
            Expr::Var(name) => scope
                .get(name)
                .cloned()
                .ok_or_else(|| TetherError::Expression(format!("unknown variable '${}'", name))),
            Expr::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| item.eval(scope).map(|v| v.to_json()))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Array(values).into())
            }
            Expr::Hash(pairs) => {
                let mut map = Map::new();
                for (key, value) in pairs {
                    map.insert(key.eval(scope)?.to_string(), value.eval(scope)?.to_json());
                }
                Ok(Value::Object(map).into())
            }
            Expr::Member(target, name) => {
                let value = target.eval(scope)?;
                if let Some(found) = value.member(name) {
                    return Ok(found);
                }
                match value {
                    // Missing hash keys are undef, like indexing
                    PlanValue::Data(Value::Object(_)) if !is_builtin(name) => Ok(PlanValue::null()),
                    _ if is_builtin(name) => call_builtin(name, vec![value], None, scope),
                    _ => Err(TetherError::Expression(format!(
                        "{} has no member '{}'",
                        value.type_name(),
                        name
                    ))),
                }
            }
            Expr::Index(target, index) => target.eval(scope)?.index(&index.eval(scope)?),
            Expr::Call { name, args, lambda } => {
                let args = args
                    .iter()
                    .map(|arg| arg.eval(scope))
                    .collect::<Result<Vec<_>>>()?;
                call_builtin(name, args, lambda.as_ref(), scope)
            }
            Expr::Unary(UnaryOp::Not, inner) => Ok(json!(!inner.eval(scope)?.truthy()).into()),
            Expr::Unary(UnaryOp::Neg, inner) => match inner.eval(scope)?.to_json() {
                Value::Number(n) => match n.as_i64() {
                    Some(i) => i
                        .checked_neg()
                        .map(|negated| json!(negated).into())
                        .ok_or_else(|| TetherError::Expression("integer overflow".to_string())),
                    None => Ok(json!(-n.as_f64().unwrap_or_default()).into()),
                },
                other => Err(TetherError::Expression(format!("cannot negate {}", other))),
            },
            Expr::Binary(BinaryOp::And, left, right) => {
                Ok(json!(left.eval(scope)?.truthy() && right.eval(scope)?.truthy()).into())
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                Ok(json!(left.eval(scope)?.truthy() || right.eval(scope)?.truthy()).into())
            }
            Expr::Binary(op, left, right) => {
                binary(*op, left.eval(scope)?.to_json(), right.eval(scope)?.to_json())
            }
        }
    }
}

enum Num {
    Int(i64),
    Float(f64),
}

fn as_num(value: &Value) -> Option<Num> {
    let Value::Number(n) = value else {
        return None;
    };
    n.as_i64()
        .map(Num::Int)
        .or_else(|| n.as_f64().map(Num::Float))
}

fn float(value: f64) -> Result<PlanValue> {
    Number::from_f64(value)
        .map(|n| PlanValue::Data(Value::Number(n)))
        .ok_or_else(|| TetherError::Expression(format!("{} is not a finite number", value)))
}

fn arithmetic(op: BinaryOp, a: Num, b: Num) -> Result<PlanValue> {
    match (a, b) {
        (Num::Int(a), Num::Int(b)) => {
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div if b == 0 => {
                    return Err(TetherError::Expression("division by zero".to_string()))
                }
                BinaryOp::Div => a.checked_div(b),
                BinaryOp::Rem if b == 0 => {
                    return Err(TetherError::Expression("division by zero".to_string()))
                }
                BinaryOp::Rem => a.checked_rem(b),
                _ => None,
            };
            result
                .map(|n| json!(n).into())
                .ok_or_else(|| TetherError::Expression("integer overflow".to_string()))
        }
        (a, b) => {
            let to_f = |n: Num| match n {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            let (a, b) = (to_f(a), to_f(b));
            match op {
                BinaryOp::Add => float(a + b),
                BinaryOp::Sub => float(a - b),
                BinaryOp::Mul => float(a * b),
                BinaryOp::Div => float(a / b),
                BinaryOp::Rem => float(a % b),
                _ => Err(TetherError::Expression("not an arithmetic operator".to_string())),
            }
        }
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (as_num(left), as_num(right)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => Some(a.cmp(&b)),
        (Some(a), Some(b)) => {
            let to_f = |n: Num| match n {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            to_f(a).partial_cmp(&to_f(b))
        }
        _ => match (left, right) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

fn equal(left: &Value, right: &Value) -> bool {
    match compare(left, right) {
        Some(ordering) => ordering == Ordering::Equal,
        None => left == right,
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<PlanValue> {
    match op {
        BinaryOp::Eq => Ok(json!(equal(&left, &right)).into()),
        BinaryOp::Ne => Ok(json!(!equal(&left, &right)).into()),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&left, &right).ok_or_else(|| {
                TetherError::Expression(format!("cannot compare {} with {}", left, right))
            })?;
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(json!(result).into())
        }
        BinaryOp::In => {
            let found = match (&left, &right) {
                (Value::String(needle), Value::String(haystack)) => haystack.contains(needle.as_str()),
                (needle, Value::Array(items)) => items.iter().any(|item| equal(needle, item)),
                (Value::String(key), Value::Object(map)) => map.contains_key(key),
                _ => false,
            };
            Ok(json!(found).into())
        }
        BinaryOp::Add => match (left, right) {
            (Value::String(a), b) => Ok(json!(format!("{}{}", a, PlanValue::Data(b))).into()),
            (Value::Array(mut a), Value::Array(b)) => {
                a.extend(b);
                Ok(Value::Array(a).into())
            }
            (Value::Object(mut a), Value::Object(b)) => {
                a.extend(b);
                Ok(Value::Object(a).into())
            }
            (a, b) => match (as_num(&a), as_num(&b)) {
                (Some(x), Some(y)) => arithmetic(op, x, y),
                _ => Err(TetherError::Expression(format!("cannot add {} and {}", a, b))),
            },
        },
        _ => match (as_num(&left), as_num(&right)) {
            (Some(x), Some(y)) => arithmetic(op, x, y),
            _ => Err(TetherError::Expression(format!(
                "arithmetic needs numbers, got {} and {}",
                left, right
            ))),
        },
    }
}

const BUILTINS: &[&str] = &[
    "length", "join", "map", "filter", "keys", "values", "split", "upcase", "downcase", "empty",
    "flatten", "sort", "unique", "to_json", "type",
];

fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

fn arity(name: &str, args: &[PlanValue], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        return Err(TetherError::Expression(format!(
            "{}() takes {} to {} arguments, got {}",
            name,
            min,
            max,
            args.len()
        )));
    }
    Ok(())
}

fn string_arg<'a>(name: &str, value: &'a Value) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| TetherError::Expression(format!("{}() expects a string, got {}", name, value)))
}

fn array_arg(name: &str, value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(TetherError::Expression(format!(
            "{}() expects an array, got {}",
            name, other
        ))),
    }
}

/// Elements a lambda iterates over, with the parameters each call binds
fn iteration(name: &str, collection: &PlanValue) -> Result<Vec<Vec<PlanValue>>> {
    match collection {
        PlanValue::ResultSet(set) => Ok(set
            .iter()
            .map(|result| vec![PlanValue::Result(result.clone())])
            .collect()),
        PlanValue::Data(Value::Array(items)) => Ok(items
            .iter()
            .map(|item| vec![PlanValue::Data(item.clone())])
            .collect()),
        PlanValue::Data(Value::Object(map)) => Ok(map
            .iter()
            .map(|(k, v)| vec![json!(k).into(), PlanValue::Data(v.clone())])
            .collect()),
        other => Err(TetherError::Expression(format!(
            "{}() cannot iterate over {}",
            name,
            other.type_name()
        ))),
    }
}

fn call_lambda(lambda: &Lambda, mut args: Vec<PlanValue>, scope: &Scope) -> Result<PlanValue> {
    // A one-parameter lambda over a hash sees [key, value]
    if lambda.params.len() == 1 && args.len() == 2 {
        let pair = json!([args[0].to_json(), args[1].to_json()]);
        args = vec![pair.into()];
    }
    if lambda.params.len() != args.len() {
        return Err(TetherError::Expression(format!(
            "lambda takes {} parameters, got {}",
            lambda.params.len(),
            args.len()
        )));
    }
    let mut inner = scope.clone();
    for (param, arg) in lambda.params.iter().zip(args) {
        inner = inner.with(param.clone(), arg);
    }
    lambda.body.eval(&inner)
}

fn call_builtin(
    name: &str,
    args: Vec<PlanValue>,
    lambda: Option<&Lambda>,
    scope: &Scope,
) -> Result<PlanValue> {
    if matches!(name, "map" | "filter") {
        arity(name, &args, 1, 1)?;
        let lambda = lambda
            .ok_or_else(|| TetherError::Expression(format!("{}() needs a lambda", name)))?;
        let collection = &args[0];
        let items = iteration(name, collection)?;

        if name == "map" {
            let mut mapped = Vec::with_capacity(items.len());
            for item in items {
                mapped.push(call_lambda(lambda, item, scope)?.to_json());
            }
            return Ok(Value::Array(mapped).into());
        }

        let mut kept = Vec::new();
        for item in items {
            if call_lambda(lambda, item.clone(), scope)?.truthy() {
                kept.push(item);
            }
        }
        return Ok(match collection {
            PlanValue::ResultSet(_) => {
                let results = kept
                    .into_iter()
                    .filter_map(|mut item| match item.pop() {
                        Some(PlanValue::Result(result)) => Some(result),
                        _ => None,
                    })
                    .collect();
                PlanValue::ResultSet(ResultSet::new(results)?)
            }
            PlanValue::Data(Value::Object(_)) => {
                let mut map = Map::new();
                for item in kept {
                    if let [k, v] = item.as_slice() {
                        map.insert(k.to_string(), v.to_json());
                    }
                }
                Value::Object(map).into()
            }
            _ => Value::Array(kept.into_iter().flatten().map(|v| v.to_json()).collect()).into(),
        });
    }
    if lambda.is_some() {
        return Err(TetherError::Expression(format!(
            "{}() does not take a lambda",
            name
        )));
    }

    let first = args.first().cloned().unwrap_or_else(PlanValue::null);
    match name {
        "length" => {
            arity(name, &args, 1, 1)?;
            let len = match &first {
                PlanValue::ResultSet(set) => set.len(),
                PlanValue::Data(Value::String(s)) => s.chars().count(),
                PlanValue::Data(Value::Array(items)) => items.len(),
                PlanValue::Data(Value::Object(map)) => map.len(),
                other => {
                    return Err(TetherError::Expression(format!(
                        "length() of {}",
                        other.type_name()
                    )))
                }
            };
            Ok(json!(len).into())
        }
        "empty" => {
            arity(name, &args, 1, 1)?;
            let empty = match &first {
                PlanValue::ResultSet(set) => set.is_empty(),
                PlanValue::Data(Value::Null) => true,
                PlanValue::Data(Value::String(s)) => s.is_empty(),
                PlanValue::Data(Value::Array(items)) => items.is_empty(),
                PlanValue::Data(Value::Object(map)) => map.is_empty(),
                _ => false,
            };
            Ok(json!(empty).into())
        }
        "join" => {
            arity(name, &args, 1, 2)?;
            let separator = match args.get(1) {
                Some(sep) => string_arg(name, &sep.to_json())?.to_string(),
                None => String::new(),
            };
            let items = array_arg(name, first.to_json())?;
            let joined = items
                .into_iter()
                .map(|item| PlanValue::Data(item).to_string())
                .collect::<Vec<_>>()
                .join(&separator);
            Ok(json!(joined).into())
        }
        "split" => {
            arity(name, &args, 2, 2)?;
            let text = first.to_json();
            let separator = args[1].to_json();
            let parts: Vec<Value> = string_arg(name, &text)?
                .split(string_arg(name, &separator)?)
                .map(|part| json!(part))
                .collect();
            Ok(Value::Array(parts).into())
        }
        "upcase" | "downcase" => {
            arity(name, &args, 1, 1)?;
            let text = first.to_json();
            let text = string_arg(name, &text)?;
            let converted = if name == "upcase" {
                text.to_uppercase()
            } else {
                text.to_lowercase()
            };
            Ok(json!(converted).into())
        }
        "keys" | "values" => {
            arity(name, &args, 1, 1)?;
            match first.to_json() {
                Value::Object(map) if name == "keys" => {
                    Ok(Value::Array(map.keys().map(|k| json!(k)).collect()).into())
                }
                Value::Object(map) => Ok(Value::Array(map.values().cloned().collect()).into()),
                other => Err(TetherError::Expression(format!(
                    "{}() expects a hash, got {}",
                    name, other
                ))),
            }
        }
        "flatten" => {
            arity(name, &args, 1, 1)?;
            fn flatten_into(value: Value, out: &mut Vec<Value>) {
                match value {
                    Value::Array(items) => items.into_iter().for_each(|i| flatten_into(i, out)),
                    other => out.push(other),
                }
            }
            let mut out = Vec::new();
            flatten_into(first.to_json(), &mut out);
            Ok(Value::Array(out).into())
        }
        "sort" => {
            arity(name, &args, 1, 1)?;
            let mut items = array_arg(name, first.to_json())?;
            items.sort_by(|a, b| compare(a, b).unwrap_or(Ordering::Equal));
            Ok(Value::Array(items).into())
        }
        "unique" => {
            arity(name, &args, 1, 1)?;
            let mut unique: Vec<Value> = Vec::new();
            for item in array_arg(name, first.to_json())? {
                if !unique.iter().any(|seen| equal(seen, &item)) {
                    unique.push(item);
                }
            }
            Ok(Value::Array(unique).into())
        }
        "to_json" => {
            arity(name, &args, 1, 1)?;
            Ok(json!(first.to_json().to_string()).into())
        }
        "type" => {
            arity(name, &args, 1, 1)?;
            Ok(json!(first.type_name()).into())
        }
        other => Err(TetherError::Expression(format!(
            "unknown function '{}'",
            other
        ))),
    }
}

/// Render `${expr}` and `$var` references inside a string
///
/// `\$` produces a literal dollar sign.
pub fn interpolate(text: &str, scope: &Scope) -> Result<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        match (chars[i], chars.get(i + 1)) {
            ('\\', Some('$')) => {
                out.push('$');
                i += 2;
            }
            ('$', Some('{')) => {
                let start = i + 2;
                let mut depth = 1;
                let mut end = start;
                while end < chars.len() {
                    match chars[end] {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    end += 1;
                }
                if depth != 0 {
                    return Err(TetherError::Expression(format!(
                        "unterminated '${{' in '{}'",
                        text
                    )));
                }
                let inner: String = chars[start..end].iter().collect();
                out.push_str(&evaluate(&inner, scope)?.to_string());
                i = end + 1;
            }
            ('$', Some(&c)) if is_ident_start(c) => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_ident_char(chars[end]) {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let value = scope.get(&name).ok_or_else(|| {
                    TetherError::Expression(format!("unknown variable '${}'", name))
                })?;
                out.push_str(&value.to_string());
                i = end;
            }
            (c, _) => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Resolve a raw step field against scope
///
/// A string that parses as a whole expression beginning with `$` is
/// evaluated and keeps its type; other strings are interpolated. Arrays and
/// hashes resolve element by element.
pub fn resolve(value: &Value, scope: &Scope) -> Result<PlanValue> {
    match value {
        Value::String(s) if s.starts_with('$') && !s.starts_with("${") => match parse(s) {
            Ok(expr) => expr.eval(scope),
            Err(_) => Ok(json!(interpolate(s, scope)?).into()),
        },
        Value::String(s) => Ok(json!(interpolate(s, scope)?).into()),
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve(item, scope)?.to_json());
            }
            Ok(Value::Array(resolved).into())
        }
        Value::Object(map) => {
            let mut resolved = Map::new();
            for (key, item) in map {
                resolved.insert(key.clone(), resolve(item, scope)?.to_json());
            }
            Ok(Value::Object(resolved).into())
        }
        other => Ok(PlanValue::Data(other.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionKind, CommandOutput};
    use crate::result::{Payload, TargetResult};
    use crate::target::{Target, TransportKind};

    fn scope() -> Scope {
        Scope::new()
            .with("n", json!(4).into())
            .with("name", json!("web").into())
            .with("list", json!([3, 1, 2, 1]).into())
            .with("hash", json!({"a": 1, "b": {"c": "deep"}}).into())
    }

    fn eval(src: &str) -> Value {
        evaluate(src, &scope()).unwrap().to_json()
    }

    fn result_set() -> ResultSet {
        let result = |name: &str, code: i32| {
            TargetResult::from_payload(
                Target::parse(name, TransportKind::Ssh).unwrap(),
                ActionKind::Command,
                Payload::Command(CommandOutput {
                    stdout: format!("{}-out", name),
                    exit_code: code,
                    ..Default::default()
                }),
            )
        };
        ResultSet::new(vec![result("a", 0), result("b", 1), result("c", 0)]).unwrap()
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(eval("1 + 2 * 3"), json!(7));
        assert_eq!(eval("($n - 1) * 2"), json!(6));
        assert_eq!(eval("7 / 2"), json!(3));
        assert_eq!(eval("7 % 4"), json!(3));
        assert_eq!(eval("1.5 + 1"), json!(2.5));
        assert_eq!(eval("-$n"), json!(-4));
        assert!(evaluate("1 / 0", &scope()).is_err());
    }

    #[test]
    fn test_negating_min_integer_overflows() {
        let err = evaluate("-(0 - 9223372036854775807 - 1)", &scope()).unwrap_err();
        assert!(err.to_string().contains("integer overflow"));
        assert_eq!(eval("-(0 - 9223372036854775807)"), json!(9223372036854775807i64));
    }

    #[test]
    fn test_comparison_and_logic() {
        assert_eq!(eval("$n > 3 and $name == 'web'"), json!(true));
        assert_eq!(eval("!($n >= 5) || false"), json!(true));
        assert_eq!(eval("2 in $list"), json!(true));
        assert_eq!(eval("'a' in $hash"), json!(true));
        assert_eq!(eval("1 == 1.0"), json!(true));
    }

    #[test]
    fn test_indexing_and_members() {
        assert_eq!(eval("$list[0]"), json!(3));
        assert_eq!(eval("$list[-1]"), json!(1));
        assert_eq!(eval("$hash['b']['c']"), json!("deep"));
        assert_eq!(eval("$hash.b.c"), json!("deep"));
        assert_eq!(eval("$hash.missing"), Value::Null);
    }

    #[test]
    fn test_builtins() {
        assert_eq!(eval("length($list)"), json!(4));
        assert_eq!(eval("$list.length"), json!(4));
        assert_eq!(eval("$list.unique.sort"), json!([1, 2, 3]));
        assert_eq!(eval("join(['a', 'b'], ',')"), json!("a,b"));
        assert_eq!(eval("split('a.b', '.')"), json!(["a", "b"]));
        assert_eq!(eval("$name.upcase()"), json!("WEB"));
        assert_eq!(eval("keys($hash)"), json!(["a", "b"]));
        assert_eq!(eval("flatten([1, [2, [3]]])"), json!([1, 2, 3]));
        assert_eq!(eval("empty([])"), json!(true));
        assert_eq!(eval("type($hash)"), json!("Hash"));
        assert_eq!(eval("to_json([1])"), json!("[1]"));
        assert_eq!(eval("{'k' => $n, v: 2}"), json!({"k": 4, "v": 2}));
    }

    #[test]
    fn test_lambdas() {
        assert_eq!(eval("$list.map |$x| { $x * 10 }"), json!([30, 10, 20, 10]));
        assert_eq!(eval("filter($list) |$x| $x > 1"), json!([3, 2]));
        assert_eq!(eval("$hash.filter |$k, $v| { $k == 'a' }"), json!({"a": 1}));
        assert_eq!(eval("$hash.map |$pair| { $pair[0] }"), json!(["a", "b"]));
        assert!(evaluate("map($list)", &scope()).is_err());
    }

    #[test]
    fn test_result_set_members() {
        let scope = scope().with("r", PlanValue::ResultSet(result_set()));
        let get = |src: &str| evaluate(src, &scope).unwrap();
        assert_eq!(get("$r.ok").to_json(), json!(false));
        assert_eq!(get("$r.error_set.names").to_json(), json!(["b"]));
        assert_eq!(get("$r.ok_set.count").to_json(), json!(2));
        assert_eq!(get("$r[0].value.stdout").to_json(), json!("a-out"));
        assert_eq!(get("$r['c'].ok").to_json(), json!(true));
        assert_eq!(
            get("$r.map |$res| { $res.target }").to_json(),
            json!(["a", "b", "c"])
        );
        assert!(matches!(
            get("$r.filter |$res| { $res.ok }"),
            PlanValue::ResultSet(set) if set.names() == vec!["a", "c"]
        ));
    }

    #[test]
    fn test_unknown_variable_and_function() {
        assert!(evaluate("$nope", &scope()).is_err());
        assert!(evaluate("frobnicate(1)", &scope()).is_err());
        assert!(parse("1 +").is_err());
        assert!(parse("1 2").is_err());
    }

    #[test]
    fn test_interpolation() {
        let s = scope();
        assert_eq!(interpolate("host $name has ${$n + 1}", &s).unwrap(), "host web has 5");
        assert_eq!(interpolate("cost \\$5", &s).unwrap(), "cost $5");
        assert_eq!(interpolate("${$hash.b}", &s).unwrap(), r#"{"c":"deep"}"#);
        assert!(interpolate("${$n", &s).is_err());
    }

    #[test]
    fn test_resolve_keeps_types() {
        let s = scope();
        assert_eq!(resolve(&json!("$list"), &s).unwrap().to_json(), json!([3, 1, 2, 1]));
        assert_eq!(resolve(&json!("$name is up"), &s).unwrap().to_json(), json!("web is up"));
        assert_eq!(
            resolve(&json!({"k": ["$n", "x-${$n}"]}), &s).unwrap().to_json(),
            json!({"k": [4, "x-4"]})
        );
    }
}

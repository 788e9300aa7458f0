//! Step input expressions and their parser.
//!
//! A `reference` expression is a small, total subset of JavaScript: it can
//! read `flow_input.*` and `results.<step_id>`, combine values with boolean,
//! comparison and arithmetic operators, and apply a fixed set of array and
//! string methods. There are no loops, assignments or user functions, so
//! evaluation always terminates.

use std::collections::BTreeSet;

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ParseError;

/// A step input or predicate, as written in a flow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Expression {
    /// A literal value.
    Static {
        #[serde(default)]
        value: Value,
    },

    /// A symbolic expression over `flow_input` and `results`.
    #[serde(alias = "javascript")]
    Reference { expr: String },

    /// A Handlebars template rendered with `flow_input` and `results`.
    Template { template: String },
}

impl Expression {
    /// A literal value.
    pub fn literal<V: Into<Value>>(value: V) -> Self {
        Expression::Static {
            value: value.into(),
        }
    }

    /// A reference expression such as `results.download.rows`.
    pub fn reference(expr: &str) -> Self {
        Expression::Reference {
            expr: expr.to_string(),
        }
    }

    /// A Handlebars template such as `report_{{flow_input.date}}.csv`.
    pub fn template(template: &str) -> Self {
        Expression::Template {
            template: template.to_string(),
        }
    }

    /// Parse the expression into its executable form.
    pub fn compile(&self) -> Result<CompiledExpr, ParseError> {
        match self {
            Expression::Static { value } => Ok(CompiledExpr::Static(value.clone())),
            Expression::Reference { expr } => parse(expr).map(CompiledExpr::Reference),
            Expression::Template { template } => {
                let mut hb = Handlebars::new();
                hb.register_template_string("check", template)
                    .map_err(|e| ParseError::from(e.to_string()))?;
                Ok(CompiledExpr::Template(template.clone()))
            }
        }
    }
}

/// An expression after parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledExpr {
    Static(Value),
    Reference(Ast),
    Template(String),
}

impl CompiledExpr {
    /// Step ids this expression reads from `results`.
    pub fn references(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        match self {
            CompiledExpr::Static(_) => {}
            CompiledExpr::Reference(ast) => ast.collect_references(&mut out),
            CompiledExpr::Template(template) => template_references(template, &mut out),
        }
        out
    }
}

/// Syntax tree of a reference expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    Literal(Value),
    /// `flow_input.name`
    Input(String),
    /// `flow_input` as a whole
    InputAll,
    /// `results.step_id`
    StepResult(String),
    /// Parameter of an enclosing arrow function.
    Local(String),
    Array(Vec<Ast>),
    Object(Vec<(String, Ast)>),
    Member {
        object: Box<Ast>,
        property: String,
    },
    Index {
        object: Box<Ast>,
        index: Box<Ast>,
    },
    Method {
        object: Box<Ast>,
        method: Method,
        args: Vec<Ast>,
    },
    /// `Boolean(x)`
    ToBoolean(Box<Ast>),
    /// `Boolean` passed as a callback.
    BooleanFn,
    Lambda {
        param: String,
        body: Box<Ast>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Ast>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Ast>,
        right: Box<Ast>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Ast>,
        right: Box<Ast>,
    },
    Conditional {
        test: Box<Ast>,
        consequent: Box<Ast>,
        alternate: Box<Ast>,
    },
}

impl Ast {
    fn collect_references(&self, out: &mut BTreeSet<String>) {
        match self {
            Ast::StepResult(id) => {
                out.insert(id.clone());
            }
            Ast::Literal(_) | Ast::Input(_) | Ast::InputAll | Ast::Local(_) | Ast::BooleanFn => {}
            Ast::Array(items) => items.iter().for_each(|i| i.collect_references(out)),
            Ast::Object(fields) => fields.iter().for_each(|(_, v)| v.collect_references(out)),
            Ast::Member { object, .. } => object.collect_references(out),
            Ast::Index { object, index } => {
                object.collect_references(out);
                index.collect_references(out);
            }
            Ast::Method { object, args, .. } => {
                object.collect_references(out);
                args.iter().for_each(|a| a.collect_references(out));
            }
            Ast::ToBoolean(inner) => inner.collect_references(out),
            Ast::Lambda { body, .. } => body.collect_references(out),
            Ast::Unary { operand, .. } => operand.collect_references(out),
            Ast::Binary { left, right, .. } | Ast::Logical { left, right, .. } => {
                left.collect_references(out);
                right.collect_references(out);
            }
            Ast::Conditional {
                test,
                consequent,
                alternate,
            } => {
                test.collect_references(out);
                consequent.collect_references(out);
                alternate.collect_references(out);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Filter,
    Map,
    Some,
    Every,
    Includes,
    Join,
    ToLowerCase,
    ToUpperCase,
    Trim,
}

impl Method {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "filter" => Method::Filter,
            "map" => Method::Map,
            "some" => Method::Some,
            "every" => Method::Every,
            "includes" => Method::Includes,
            "join" => Method::Join,
            "toLowerCase" => Method::ToLowerCase,
            "toUpperCase" => Method::ToUpperCase,
            "trim" => Method::Trim,
            _ => return None,
        })
    }

    fn takes_callback(self) -> bool {
        matches!(
            self,
            Method::Filter | Method::Map | Method::Some | Method::Every
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    LooseEq,
    LooseNe,
    StrictEq,
    StrictNe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Coalesce,
}

/// Parse a reference expression.
pub fn parse(source: &str) -> Result<Ast, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        locals: Vec::new(),
    };
    let ast = parser.expression()?;
    match parser.peek() {
        Token::Eof => Ok(ast),
        other => Err(format!("unexpected {} after expression", other.describe()).into()),
    }
}

/// Collect `results.<id>` references from the mustaches of a template.
fn template_references(template: &str, out: &mut BTreeSet<String>) {
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            break;
        };
        let inner = &after[..close];
        let mut search = inner;
        while let Some(at) = search.find("results.") {
            let preceded_by_ident = search[..at]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '.');
            let tail = &search[at + "results.".len()..];
            let id: String = tail
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
                .collect();
            if !preceded_by_ident && !id.is_empty() {
                out.insert(id);
            }
            search = tail;
        }
        rest = &after[close + 2..];
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
    Eof,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Num(n) => format!("number {n}"),
            Token::Str(s) => format!("string '{s}'"),
            Token::Ident(i) => format!("`{i}`"),
            Token::Punct(p) => format!("`{p}`"),
            Token::Eof => "end of expression".to_string(),
        }
    }
}

// Longest first so that `===` wins over `==`.
const PUNCTUATION: &[&str] = &[
    "===", "!==", "...", "==", "!=", "<=", ">=", "&&", "||", "??", "?.", "=>", "(", ")", "[",
    "]", "{", "}", ",", ".", "!", "<", ">", "+", "-", "*", "/", "%", "?", ":",
];

fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()))
        {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| format!("invalid number `{text}`"))?;
            tokens.push(Token::Num(n));
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            let mut s = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err("unterminated string literal".into()),
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = chars
                            .get(i + 1)
                            .ok_or_else(|| "unterminated string literal".to_string())?;
                        s.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
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
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
        let punct = PUNCTUATION
            .iter()
            .find(|p| rest.starts_with(**p))
            .ok_or_else(|| format!("unexpected character `{c}`"))?;

        // `a?.5:b` is a conditional, not optional chaining.
        if *punct == "?." && chars.get(i + 2).is_some_and(|d| d.is_ascii_digit()) {
            tokens.push(Token::Punct("?"));
            i += 1;
            continue;
        }
        if *punct == "..." {
            return Err("spread syntax is not supported".into());
        }

        tokens.push(Token::Punct(punct));
        i += punct.len();
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    locals: Vec<String>,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Token::Punct(p) if *p == punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &str) -> Result<(), ParseError> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(format!("expected `{punct}`, found {}", self.peek().describe()).into())
        }
    }

    fn expression(&mut self) -> Result<Ast, ParseError> {
        self.conditional()
    }

    fn conditional(&mut self) -> Result<Ast, ParseError> {
        let test = self.coalesce()?;
        if !self.eat("?") {
            return Ok(test);
        }
        let consequent = self.expression()?;
        self.expect(":")?;
        let alternate = self.expression()?;
        Ok(Ast::Conditional {
            test: Box::new(test),
            consequent: Box::new(consequent),
            alternate: Box::new(alternate),
        })
    }

    fn coalesce(&mut self) -> Result<Ast, ParseError> {
        let mut left = self.or()?;
        while self.eat("??") {
            let right = self.or()?;
            left = logical(LogicalOp::Coalesce, left, right);
        }
        Ok(left)
    }

    fn or(&mut self) -> Result<Ast, ParseError> {
        let mut left = self.and()?;
        while self.eat("||") {
            let right = self.and()?;
            left = logical(LogicalOp::Or, left, right);
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Ast, ParseError> {
        let mut left = self.equality()?;
        while self.eat("&&") {
            let right = self.equality()?;
            left = logical(LogicalOp::And, left, right);
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Ast, ParseError> {
        let mut left = self.relational()?;
        loop {
            let op = match self.peek() {
                Token::Punct("===") => BinaryOp::StrictEq,
                Token::Punct("!==") => BinaryOp::StrictNe,
                Token::Punct("==") => BinaryOp::LooseEq,
                Token::Punct("!=") => BinaryOp::LooseNe,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.relational()?;
            left = binary(op, left, right);
        }
    }

    fn relational(&mut self) -> Result<Ast, ParseError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Token::Punct("<") => BinaryOp::Lt,
                Token::Punct("<=") => BinaryOp::Le,
                Token::Punct(">") => BinaryOp::Gt,
                Token::Punct(">=") => BinaryOp::Ge,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.additive()?;
            left = binary(op, left, right);
        }
    }

    fn additive(&mut self) -> Result<Ast, ParseError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Punct("+") => BinaryOp::Add,
                Token::Punct("-") => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn multiplicative(&mut self) -> Result<Ast, ParseError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Punct("*") => BinaryOp::Mul,
                Token::Punct("/") => BinaryOp::Div,
                Token::Punct("%") => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = binary(op, left, right);
        }
    }

    fn unary(&mut self) -> Result<Ast, ParseError> {
        let op = if self.eat("!") {
            UnaryOp::Not
        } else if self.eat("-") {
            UnaryOp::Neg
        } else {
            return self.postfix();
        };
        let operand = self.unary()?;
        Ok(Ast::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn postfix(&mut self) -> Result<Ast, ParseError> {
        let mut object = self.primary()?;
        loop {
            if self.eat(".") || self.eat("?.") {
                if self.eat("[") {
                    object = self.index(object)?;
                    continue;
                }
                let name = match self.advance() {
                    Token::Ident(name) => name,
                    other => {
                        let found = other.describe();
                        return Err(format!("expected property name, found {found}").into());
                    }
                };
                if matches!(self.peek(), Token::Punct("(")) {
                    object = self.method_call(object, &name)?;
                } else {
                    object = Ast::Member {
                        object: Box::new(object),
                        property: name,
                    };
                }
            } else if self.eat("[") {
                object = self.index(object)?;
            } else if matches!(self.peek(), Token::Punct("(")) {
                return Err("only methods and `Boolean` can be called".into());
            } else {
                return Ok(object);
            }
        }
    }

    fn index(&mut self, object: Ast) -> Result<Ast, ParseError> {
        let index = self.expression()?;
        self.expect("]")?;
        Ok(Ast::Index {
            object: Box::new(object),
            index: Box::new(index),
        })
    }

    fn method_call(&mut self, object: Ast, name: &str) -> Result<Ast, ParseError> {
        let method = Method::from_name(name).ok_or_else(|| format!("unsupported method `{name}`"))?;
        self.expect("(")?;
        let mut args = Vec::new();
        if !self.eat(")") {
            loop {
                args.push(self.argument()?);
                if self.eat(")") {
                    break;
                }
                self.expect(",")?;
            }
        }

        if method.takes_callback() {
            match args.as_slice() {
                [Ast::Lambda { .. }] | [Ast::BooleanFn] => {}
                _ => return Err(format!("`{name}` expects a single callback argument").into()),
            }
        } else if args
            .iter()
            .any(|a| matches!(a, Ast::Lambda { .. } | Ast::BooleanFn))
        {
            return Err(format!("`{name}` does not take a callback").into());
        }

        Ok(Ast::Method {
            object: Box::new(object),
            method,
            args,
        })
    }

    /// A call argument, which may be an arrow function.
    fn argument(&mut self) -> Result<Ast, ParseError> {
        let param = match (self.peek(), self.peek_at(1), self.peek_at(2), self.peek_at(3)) {
            (Token::Ident(p), Token::Punct("=>"), _, _) => Some((p.clone(), 2)),
            (Token::Punct("("), Token::Ident(p), Token::Punct(")"), Token::Punct("=>")) => {
                Some((p.clone(), 4))
            }
            _ => None,
        };
        let Some((param, width)) = param else {
            return self.expression();
        };
        if is_reserved(&param) {
            return Err(format!("`{param}` cannot be used as a parameter name").into());
        }
        self.pos += width;
        self.locals.push(param.clone());
        let body = self.expression();
        self.locals.pop();
        Ok(Ast::Lambda {
            param,
            body: Box::new(body?),
        })
    }

    fn primary(&mut self) -> Result<Ast, ParseError> {
        match self.advance() {
            Token::Num(n) => Ok(Ast::Literal(number(n))),
            Token::Str(s) => Ok(Ast::Literal(Value::String(s))),
            Token::Punct("(") => {
                let inner = self.expression()?;
                self.expect(")")?;
                Ok(inner)
            }
            Token::Punct("[") => {
                let mut items = Vec::new();
                if !self.eat("]") {
                    loop {
                        items.push(self.expression()?);
                        if self.eat("]") {
                            break;
                        }
                        self.expect(",")?;
                        if self.eat("]") {
                            break;
                        }
                    }
                }
                Ok(Ast::Array(items))
            }
            Token::Punct("{") => self.object(),
            Token::Ident(name) => self.identifier(name),
            other => Err(format!("unexpected {}", other.describe()).into()),
        }
    }

    fn object(&mut self) -> Result<Ast, ParseError> {
        let mut fields = Vec::new();
        if self.eat("}") {
            return Ok(Ast::Object(fields));
        }
        loop {
            let key = match self.advance() {
                Token::Ident(k) | Token::Str(k) => k,
                other => {
                    let found = other.describe();
                    return Err(format!("expected object key, found {found}").into());
                }
            };
            let value = if self.eat(":") {
                self.expression()?
            } else {
                // Shorthand `{ x }` only makes sense for arrow parameters.
                self.identifier(key.clone())?
            };
            fields.push((key, value));
            if self.eat("}") {
                break;
            }
            self.expect(",")?;
            if self.eat("}") {
                break;
            }
        }
        Ok(Ast::Object(fields))
    }

    fn identifier(&mut self, name: String) -> Result<Ast, ParseError> {
        if self.locals.contains(&name) {
            return Ok(Ast::Local(name));
        }
        match name.as_str() {
            "true" => Ok(Ast::Literal(Value::Bool(true))),
            "false" => Ok(Ast::Literal(Value::Bool(false))),
            "null" | "undefined" => Ok(Ast::Literal(Value::Null)),
            "Boolean" => {
                if self.eat("(") {
                    let inner = self.expression()?;
                    self.expect(")")?;
                    Ok(Ast::ToBoolean(Box::new(inner)))
                } else {
                    Ok(Ast::BooleanFn)
                }
            }
            "flow_input" => match self.static_key()? {
                Some(key) => Ok(Ast::Input(key)),
                None => Ok(Ast::InputAll),
            },
            "results" => match self.static_key()? {
                Some(id) => Ok(Ast::StepResult(id)),
                None => Err("`results` must be followed by a step id".into()),
            },
            other => Err(format!("unknown identifier `{other}`").into()),
        }
    }

    /// Consume `.key`, `?.key` or `['key']` if one follows.
    fn static_key(&mut self) -> Result<Option<String>, ParseError> {
        match (self.peek().clone(), self.peek_at(1).clone(), self.peek_at(2).clone()) {
            (Token::Punct("." | "?."), Token::Ident(key), next) => {
                if next == Token::Punct("(") {
                    return Ok(None);
                }
                self.pos += 2;
                Ok(Some(key))
            }
            (Token::Punct("?."), Token::Punct("["), _) => {
                self.pos += 1;
                self.bracket_key()
            }
            (Token::Punct("["), Token::Str(_), _) => self.bracket_key(),
            _ => Ok(None),
        }
    }

    fn bracket_key(&mut self) -> Result<Option<String>, ParseError> {
        match (self.peek_at(1).clone(), self.peek_at(2).clone()) {
            (Token::Str(key), Token::Punct("]")) => {
                self.pos += 3;
                Ok(Some(key))
            }
            _ => Err("step ids and input names must be static".into()),
        }
    }
}

fn is_reserved(name: &str) -> bool {
    matches!(
        name,
        "flow_input" | "results" | "true" | "false" | "null" | "undefined" | "Boolean"
    )
}

fn logical(op: LogicalOp, left: Ast, right: Ast) -> Ast {
    Ast::Logical {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn binary(op: BinaryOp, left: Ast, right: Ast) -> Ast {
    Ast::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Convert an `f64` into the most natural JSON number.
pub(crate) fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Build an object value from key/value pairs.
pub(crate) fn object(fields: Vec<(String, Value)>) -> Value {
    Value::Object(fields.into_iter().collect::<Map<String, Value>>())
}

//! Expression evaluation against a flow input and the results so far.

use serde_json::Value;

use crate::context::{FlowInput, ResultsMap};
use crate::error::EvaluationError;
use crate::expr::{number, object, Ast, BinaryOp, CompiledExpr, LogicalOp, Method, UnaryOp};

/// Evaluate an expression.
///
/// Pure: the result depends only on the three arguments.
pub fn evaluate(
    expr: &CompiledExpr,
    input: &FlowInput,
    results: &ResultsMap,
) -> Result<Value, EvaluationError> {
    match expr {
        CompiledExpr::Static(value) => Ok(value.clone()),
        CompiledExpr::Reference(ast) => Scope::new(input, results).eval(ast),
        CompiledExpr::Template(template) => crate::context::render_template(template, input, results),
    }
}

/// Evaluate a branch or `skip_if` predicate.
///
/// A missing predicate always holds.
pub fn evaluate_predicate(
    expr: Option<&CompiledExpr>,
    input: &FlowInput,
    results: &ResultsMap,
) -> Result<bool, EvaluationError> {
    match expr {
        None => Ok(true),
        Some(expr) => evaluate(expr, input, results).map(|v| is_truthy(&v)),
    }
}

/// Canonical truthiness of a value.
///
/// `null`, `false`, `0`, `""` and the string `"false"` (any case) are falsy;
/// everything else, including empty arrays and objects, is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => {
            let s = s.trim();
            !s.is_empty() && !s.eq_ignore_ascii_case("false")
        }
        Value::Array(_) | Value::Object(_) => true,
    }
}

struct Scope<'a> {
    input: &'a FlowInput,
    results: &'a ResultsMap,
    locals: Vec<(&'a str, Value)>,
}

impl<'a> Scope<'a> {
    fn new(input: &'a FlowInput, results: &'a ResultsMap) -> Self {
        Self {
            input,
            results,
            locals: Vec::new(),
        }
    }

    fn eval(&mut self, ast: &'a Ast) -> Result<Value, EvaluationError> {
        match ast {
            Ast::Literal(v) => Ok(v.clone()),
            Ast::Input(name) => self
                .input
                .get(name)
                .cloned()
                .ok_or_else(|| EvaluationError::UnknownInput(name.clone())),
            Ast::InputAll => Ok(self.input.as_json()),
            Ast::StepResult(id) => self.results.resolve(id),
            Ast::Local(name) => Ok(self
                .locals
                .iter()
                .rev()
                .find(|(n, _)| *n == name.as_str())
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null)),
            Ast::Array(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Ast::Object(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (key, value) in fields {
                    out.push((key.clone(), self.eval(value)?));
                }
                Ok(object(out))
            }
            Ast::Member { object, property } => {
                let object = self.eval(object)?;
                Ok(member(&object, property))
            }
            Ast::Index { object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                Ok(match (&object, &index) {
                    (Value::Array(items), Value::Number(n)) => n
                        .as_u64()
                        .and_then(|i| items.get(i as usize))
                        .cloned()
                        .unwrap_or(Value::Null),
                    (_, Value::String(key)) => member(&object, key),
                    _ => Value::Null,
                })
            }
            Ast::Method {
                object,
                method,
                args,
            } => {
                let target = self.eval(object)?;
                self.method(target, *method, args)
            }
            Ast::ToBoolean(inner) => Ok(Value::Bool(is_truthy(&self.eval(inner)?))),
            // Only meaningful as a callback; see `apply`.
            Ast::BooleanFn | Ast::Lambda { .. } => Ok(Value::Null),
            Ast::Unary { op, operand } => {
                let value = self.eval(operand)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!is_truthy(&value)),
                    UnaryOp::Neg => as_number(&value).map(|n| number(-n)).unwrap_or(Value::Null),
                })
            }
            Ast::Logical { op, left, right } => {
                let left = self.eval(left)?;
                match op {
                    LogicalOp::And if !is_truthy(&left) => Ok(left),
                    LogicalOp::Or if is_truthy(&left) => Ok(left),
                    LogicalOp::Coalesce if !left.is_null() => Ok(left),
                    _ => self.eval(right),
                }
            }
            Ast::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                Ok(binary(*op, &left, &right))
            }
            Ast::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if is_truthy(&self.eval(test)?) {
                    self.eval(consequent)
                } else {
                    self.eval(alternate)
                }
            }
        }
    }

    /// Call a callback argument with one element.
    fn apply(&mut self, callback: &'a Ast, item: Value) -> Result<Value, EvaluationError> {
        match callback {
            Ast::Lambda { param, body } => {
                self.locals.push((param.as_str(), item));
                let out = self.eval(body);
                self.locals.pop();
                out
            }
            Ast::BooleanFn => Ok(Value::Bool(is_truthy(&item))),
            _ => Ok(Value::Null),
        }
    }

    fn method(
        &mut self,
        target: Value,
        method: Method,
        args: &'a [Ast],
    ) -> Result<Value, EvaluationError> {
        if let (Value::Array(items), Some(callback)) = (&target, args.first()) {
            if matches!(
                method,
                Method::Filter | Method::Map | Method::Some | Method::Every
            ) {
                let mut kept = Vec::new();
                for item in items {
                    let out = self.apply(callback, item.clone())?;
                    match method {
                        Method::Filter if is_truthy(&out) => kept.push(item.clone()),
                        Method::Map => kept.push(out),
                        Method::Some if is_truthy(&out) => return Ok(Value::Bool(true)),
                        Method::Every if !is_truthy(&out) => return Ok(Value::Bool(false)),
                        _ => {}
                    }
                }
                return Ok(match method {
                    Method::Some => Value::Bool(false),
                    Method::Every => Value::Bool(true),
                    _ => Value::Array(kept),
                });
            }
        }

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }

        Ok(match (method, &target) {
            (Method::Includes, Value::Array(items)) => {
                let needle = values.first().unwrap_or(&Value::Null);
                Value::Bool(items.iter().any(|i| strict_eq(i, needle)))
            }
            (Method::Includes, Value::String(s)) => {
                let needle = values.first().map(display).unwrap_or_default();
                Value::Bool(s.contains(&needle))
            }
            (Method::Join, Value::Array(items)) => {
                let sep = values.first().map(display).unwrap_or_else(|| ",".to_string());
                Value::String(items.iter().map(display).collect::<Vec<_>>().join(&sep))
            }
            (Method::ToLowerCase, Value::String(s)) => Value::String(s.to_lowercase()),
            (Method::ToUpperCase, Value::String(s)) => Value::String(s.to_uppercase()),
            (Method::Trim, Value::String(s)) => Value::String(s.trim().to_string()),
            // Methods on absent or mismatched values resolve to null.
            _ => Value::Null,
        })
    }
}

fn member(object: &Value, property: &str) -> Value {
    match object {
        Value::Object(map) => map.get(property).cloned().unwrap_or(Value::Null),
        Value::Array(items) if property == "length" => Value::from(items.len()),
        Value::Array(items) => property
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or(Value::Null),
        Value::String(s) if property == "length" => Value::from(s.chars().count()),
        _ => Value::Null,
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Add => match (left, right) {
            (Value::String(_), _) | (_, Value::String(_)) => {
                Value::String(format!("{}{}", display(left), display(right)))
            }
            _ => arithmetic(left, right, |a, b| a + b),
        },
        BinaryOp::Sub => arithmetic(left, right, |a, b| a - b),
        BinaryOp::Mul => arithmetic(left, right, |a, b| a * b),
        BinaryOp::Div => arithmetic(left, right, |a, b| a / b),
        BinaryOp::Rem => arithmetic(left, right, |a, b| a % b),
        BinaryOp::Lt => compare(left, right, |o| o.is_lt()),
        BinaryOp::Le => compare(left, right, |o| o.is_le()),
        BinaryOp::Gt => compare(left, right, |o| o.is_gt()),
        BinaryOp::Ge => compare(left, right, |o| o.is_ge()),
        BinaryOp::StrictEq => Value::Bool(strict_eq(left, right)),
        BinaryOp::StrictNe => Value::Bool(!strict_eq(left, right)),
        BinaryOp::LooseEq => Value::Bool(loose_eq(left, right)),
        BinaryOp::LooseNe => Value::Bool(!loose_eq(left, right)),
    }
}

fn arithmetic(left: &Value, right: &Value, f: impl Fn(f64, f64) -> f64) -> Value {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => number(f(a, b)),
        _ => Value::Null,
    }
}

fn compare(left: &Value, right: &Value, f: impl Fn(std::cmp::Ordering) -> bool) -> Value {
    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    };
    Value::Bool(ordering.is_some_and(f))
}

fn strict_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if strict_eq(left, right) {
        return true;
    }
    match (left, right) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (as_number(left), as_number(right)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        (Value::Bool(b), other) | (other, Value::Bool(b)) => {
            as_number(other) == Some(if *b { 1.0 } else { 0.0 })
        }
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// String form used for concatenation and `join`.
pub(crate) fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
            _ => n.to_string(),
        },
        Value::Array(items) => items.iter().map(display).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StepResult;
    use crate::error::LeafFailure;
    use crate::expr::Expression;
    use serde_json::json;

    fn input() -> FlowInput {
        FlowInput::new(
            json!({
                "fmt": "pdf",
                "enable_x": false,
                "limit": 5,
                "tickers": ["VNM", "FPT"],
            })
            .as_object()
            .cloned()
            .unwrap(),
        )
    }

    fn results() -> ResultsMap {
        let mut results = ResultsMap::default();
        results
            .record("download", StepResult::Succeeded(json!({"rows": [1, 0, 3], "name": "x.csv"})))
            .unwrap();
        results
            .record("notify", StepResult::Tolerated(LeafFailure::new("smtp down").into()))
            .unwrap();
        results.mark_not_executed("render");
        results
    }

    fn eval(expr: &str) -> Result<Value, EvaluationError> {
        let compiled = Expression::reference(expr).compile().unwrap();
        evaluate(&compiled, &input(), &results())
    }

    #[test]
    fn test_truthiness_table() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!("false")));
        assert!(!is_truthy(&json!(" FALSE ")));
        assert!(is_truthy(&json!("0")));
        assert!(is_truthy(&json!("no")));
        assert!(is_truthy(&json!(-1)));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }

    #[test]
    fn test_static_is_verbatim() {
        let compiled = Expression::literal(json!({"a": [1, 2]})).compile().unwrap();
        assert_eq!(
            evaluate(&compiled, &input(), &results()).unwrap(),
            json!({"a": [1, 2]})
        );
    }

    #[test]
    fn test_input_lookup() {
        assert_eq!(eval("flow_input.fmt").unwrap(), json!("pdf"));
        assert_eq!(eval("flow_input.fmt != 'pdf'").unwrap(), json!(false));
        assert_eq!(
            eval("flow_input.missing"),
            Err(EvaluationError::UnknownInput("missing".into()))
        );
        assert_eq!(eval("flow_input.tickers.includes('FPT')").unwrap(), json!(true));
    }

    #[test]
    fn test_result_lookup_and_safe_navigation() {
        assert_eq!(eval("results.download.name").unwrap(), json!("x.csv"));
        // Tolerated failures and skipped steps read as null.
        assert_eq!(eval("results.notify").unwrap(), Value::Null);
        assert_eq!(eval("results.notify.message.text").unwrap(), Value::Null);
        assert_eq!(eval("results.render?.path").unwrap(), Value::Null);
        assert_eq!(
            eval("results.pending"),
            Err(EvaluationError::UnresolvedDependency("pending".into()))
        );
    }

    #[test]
    fn test_short_circuit() {
        // The right side is never evaluated, so the unknown input is fine.
        assert_eq!(eval("flow_input.enable_x && flow_input.nope").unwrap(), json!(false));
        assert_eq!(eval("flow_input.fmt || flow_input.nope").unwrap(), json!("pdf"));
        assert_eq!(eval("results.render ?? 'fallback'").unwrap(), json!("fallback"));
        assert_eq!(eval("!flow_input.enable_x").unwrap(), json!(true));
    }

    #[test]
    fn test_compact_drops_falsy_entries() {
        assert_eq!(
            eval("[results.download.name, results.notify, results.render].filter(Boolean)")
                .unwrap(),
            json!(["x.csv"])
        );
        assert_eq!(
            eval("results.download.rows.filter(r => r > 0).length").unwrap(),
            json!(2)
        );
        assert_eq!(
            eval("results.download.rows.map(r => r * 2)").unwrap(),
            json!([2, 0, 6])
        );
    }

    #[test]
    fn test_arithmetic_and_strings() {
        assert_eq!(eval("flow_input.limit * 2 + 1").unwrap(), json!(11));
        assert_eq!(eval("flow_input.limit / 2").unwrap(), json!(2.5));
        assert_eq!(eval("'top_' + flow_input.limit").unwrap(), json!("top_5"));
        assert_eq!(eval("flow_input.tickers.join('-')").unwrap(), json!("VNM-FPT"));
        assert_eq!(eval("flow_input.fmt.toUpperCase()").unwrap(), json!("PDF"));
        assert_eq!(eval("flow_input.limit == '5'").unwrap(), json!(true));
        assert_eq!(eval("flow_input.limit === '5'").unwrap(), json!(false));
    }

    #[test]
    fn test_conditional_and_objects() {
        assert_eq!(
            eval("flow_input.fmt == 'pdf' ? { kind: 'doc', n: flow_input.limit } : null")
                .unwrap(),
            json!({"kind": "doc", "n": 5})
        );
    }

    #[test]
    fn test_predicate_missing_is_true() {
        assert!(evaluate_predicate(None, &input(), &results()).unwrap());
        let compiled = Expression::reference("flow_input.enable_x").compile().unwrap();
        assert!(!evaluate_predicate(Some(&compiled), &input(), &results()).unwrap());
    }
}

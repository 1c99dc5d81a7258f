//! Loop executor: repeatedly runs a body node until an exit condition holds
//! or `max_iterations` is reached. Expression conditions go through a small
//! constrained parser over `{data, iteration}` rather than a freeform evaluator.

use async_trait::async_trait;
use serde_json::Value;

use super::{ExecutorContext, ExecutorOutput, NodeExecutor};
use crate::error::{EngineError, ErrorKind};
use crate::model::flow::{Node, NodeKind};

pub struct LoopExecutor;

#[async_trait]
impl NodeExecutor for LoopExecutor {
    async fn execute(&self, node: &Node, input: Value, ctx: &ExecutorContext) -> Result<ExecutorOutput, EngineError> {
        ctx.check_cancelled()?;
        let NodeKind::Loop { body_node_id, max_iterations } = &node.kind else {
            return Err(EngineError::execution_failed("loop executor invoked on a non-loop node"));
        };

        let condition = node
            .data
            .get("condition")
            .ok_or_else(|| EngineError::new(ErrorKind::ValidationFailed, "loop node requires a condition"))?;

        let mut current = input;
        let mut iterations = Vec::new();
        let mut exit_reason = "max_iterations";

        for iteration in 0..*max_iterations {
            ctx.check_cancelled()?;
            let output = (ctx.run_node)(body_node_id.clone(), current.clone()).await?;
            iterations.push(serde_json::json!({ "iteration": iteration, "input": current, "output": output.clone() }));

            if evaluate_condition(condition, &output, iteration)? {
                exit_reason = "condition_met";
                current = output;
                break;
            }
            current = output;
        }

        let total_iterations = iterations.len() as u32;
        Ok(ExecutorOutput::Value(serde_json::json!({
            "finalOutput": current,
            "iterations": iterations,
            "totalIterations": total_iterations,
            "exitReason": exit_reason,
        })))
    }
}

fn evaluate_condition(condition: &Value, data: &Value, iteration: u32) -> Result<bool, EngineError> {
    match condition.get("type").and_then(Value::as_str) {
        Some("field") => evaluate_field_condition(condition, data),
        Some("expression") => {
            let source = condition
                .get("expression")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::new(ErrorKind::ValidationFailed, "expression condition requires an expression string"))?;
            expr::evaluate(source, data, iteration)
        }
        other => Err(EngineError::new(ErrorKind::ValidationFailed, format!("unknown loop condition type: {other:?}"))),
    }
}

fn evaluate_field_condition(condition: &Value, data: &Value) -> Result<bool, EngineError> {
    let field = condition
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::new(ErrorKind::ValidationFailed, "field condition requires a field"))?;
    let operator = condition.get("operator").and_then(Value::as_str).unwrap_or("eq");
    let expected = condition.get("value").cloned().unwrap_or(Value::Null);
    let actual = field.split('.').try_fold(data, |cur, seg| cur.get(seg)).cloned().unwrap_or(Value::Null);
    expr::compare(&actual, operator, &expected)
}

/// A constrained boolean-expression evaluator over `data`/`iteration`. Grammar:
/// `expr := or_expr`; `or_expr := and_expr ("||" and_expr)*`;
/// `and_expr := unary ("&&" unary)*`; `unary := "!" unary | comparison | "(" expr ")"`;
/// `comparison := operand (("==" | "!=" | ">" | "<" | ">=" | "<=") operand)?`;
/// `operand := number | string | "true" | "false" | "iteration" | "data" ("." ident)*`.
/// No function calls, no assignment, no side effects.
mod expr {
    use super::*;

    pub fn evaluate(source: &str, data: &Value, iteration: u32) -> Result<bool, EngineError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0, data, iteration };
        let value = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(EngineError::new(ErrorKind::ValidationFailed, "unexpected trailing tokens in loop expression"));
        }
        value.as_bool().ok_or_else(|| EngineError::new(ErrorKind::ValidationFailed, "loop expression did not evaluate to a boolean"))
    }

    pub fn compare(actual: &Value, operator: &str, expected: &Value) -> Result<bool, EngineError> {
        let result = match operator {
            "eq" => actual == expected,
            "neq" => actual != expected,
            "gt" => numeric_cmp(actual, expected)?.is_gt(),
            "lt" => numeric_cmp(actual, expected)?.is_lt(),
            "gte" => !numeric_cmp(actual, expected)?.is_lt(),
            "lte" => !numeric_cmp(actual, expected)?.is_gt(),
            other => return Err(EngineError::new(ErrorKind::ValidationFailed, format!("unknown comparison operator: {other}"))),
        };
        Ok(result)
    }

    fn numeric_cmp(a: &Value, b: &Value) -> Result<std::cmp::Ordering, EngineError> {
        let (a, b) = (
            a.as_f64().ok_or_else(|| EngineError::new(ErrorKind::ValidationFailed, "ordered comparison requires numeric operands"))?,
            b.as_f64().ok_or_else(|| EngineError::new(ErrorKind::ValidationFailed, "ordered comparison requires numeric operands"))?,
        );
        a.partial_cmp(&b).ok_or_else(|| EngineError::new(ErrorKind::ValidationFailed, "NaN is not orderable"))
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Token {
        Ident(String),
        Number(f64),
        Str(String),
        And,
        Or,
        Not,
        Eq,
        Neq,
        Gt,
        Lt,
        Gte,
        Lte,
        Dot,
        LParen,
        RParen,
    }

    fn tokenize(source: &str) -> Result<Vec<Token>, EngineError> {
        let mut tokens = Vec::new();
        let chars: Vec<char> = source.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c.is_whitespace() {
                i += 1;
                continue;
            }
            match c {
                '(' => {
                    tokens.push(Token::LParen);
                    i += 1;
                }
                ')' => {
                    tokens.push(Token::RParen);
                    i += 1;
                }
                '.' => {
                    tokens.push(Token::Dot);
                    i += 1;
                }
                '&' if chars.get(i + 1) == Some(&'&') => {
                    tokens.push(Token::And);
                    i += 2;
                }
                '|' if chars.get(i + 1) == Some(&'|') => {
                    tokens.push(Token::Or);
                    i += 2;
                }
                '!' if chars.get(i + 1) == Some(&'=') => {
                    tokens.push(Token::Neq);
                    i += 2;
                }
                '!' => {
                    tokens.push(Token::Not);
                    i += 1;
                }
                '=' if chars.get(i + 1) == Some(&'=') => {
                    tokens.push(Token::Eq);
                    i += 2;
                }
                '>' if chars.get(i + 1) == Some(&'=') => {
                    tokens.push(Token::Gte);
                    i += 2;
                }
                '<' if chars.get(i + 1) == Some(&'=') => {
                    tokens.push(Token::Lte);
                    i += 2;
                }
                '>' => {
                    tokens.push(Token::Gt);
                    i += 1;
                }
                '<' => {
                    tokens.push(Token::Lt);
                    i += 1;
                }
                '\'' | '"' => {
                    let quote = c;
                    let mut s = String::new();
                    i += 1;
                    while i < chars.len() && chars[i] != quote {
                        s.push(chars[i]);
                        i += 1;
                    }
                    if i >= chars.len() {
                        return Err(EngineError::new(ErrorKind::ValidationFailed, "unterminated string literal in loop expression"));
                    }
                    i += 1;
                    tokens.push(Token::Str(s));
                }
                c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                    let start = i;
                    i += 1;
                    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                        i += 1;
                    }
                    let text: String = chars[start..i].iter().collect();
                    let num = text.parse::<f64>().map_err(|_| EngineError::new(ErrorKind::ValidationFailed, "invalid number literal in loop expression"))?;
                    tokens.push(Token::Number(num));
                }
                c if c.is_alphabetic() || c == '_' => {
                    let start = i;
                    while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                        i += 1;
                    }
                    let text: String = chars[start..i].iter().collect();
                    tokens.push(Token::Ident(text));
                }
                other => return Err(EngineError::new(ErrorKind::ValidationFailed, format!("unexpected character '{other}' in loop expression"))),
            }
        }
        Ok(tokens)
    }

    struct Parser<'a> {
        tokens: Vec<Token>,
        pos: usize,
        data: &'a Value,
        iteration: u32,
    }

    impl<'a> Parser<'a> {
        fn peek(&self) -> Option<&Token> {
            self.tokens.get(self.pos)
        }

        fn advance(&mut self) -> Option<Token> {
            let t = self.tokens.get(self.pos).cloned();
            self.pos += 1;
            t
        }

        fn parse_or(&mut self) -> Result<Value, EngineError> {
            let mut left = self.parse_and()?;
            while matches!(self.peek(), Some(Token::Or)) {
                self.advance();
                let right = self.parse_and()?;
                let truth = truthy(&left) || truthy(&right);
                left = Value::Bool(truth);
            }
            Ok(left)
        }

        fn parse_and(&mut self) -> Result<Value, EngineError> {
            let mut left = self.parse_unary()?;
            while matches!(self.peek(), Some(Token::And)) {
                self.advance();
                let right = self.parse_unary()?;
                let truth = truthy(&left) && truthy(&right);
                left = Value::Bool(truth);
            }
            Ok(left)
        }

        fn parse_unary(&mut self) -> Result<Value, EngineError> {
            if matches!(self.peek(), Some(Token::Not)) {
                self.advance();
                let value = self.parse_unary()?;
                return Ok(Value::Bool(!truthy(&value)));
            }
            self.parse_comparison()
        }

        fn parse_comparison(&mut self) -> Result<Value, EngineError> {
            let left = self.parse_atom()?;
            let op = match self.peek() {
                Some(Token::Eq) => Some("=="),
                Some(Token::Neq) => Some("!="),
                Some(Token::Gt) => Some(">"),
                Some(Token::Lt) => Some("<"),
                Some(Token::Gte) => Some(">="),
                Some(Token::Lte) => Some("<="),
                _ => None,
            };
            let Some(op) = op else { return Ok(left) };
            self.advance();
            let right = self.parse_atom()?;
            let result = match op {
                "==" => left == right,
                "!=" => left != right,
                ">" => numeric_cmp(&left, &right)?.is_gt(),
                "<" => numeric_cmp(&left, &right)?.is_lt(),
                ">=" => !numeric_cmp(&left, &right)?.is_lt(),
                "<=" => !numeric_cmp(&left, &right)?.is_gt(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }

        fn parse_atom(&mut self) -> Result<Value, EngineError> {
            match self.advance() {
                Some(Token::LParen) => {
                    let inner = self.parse_or()?;
                    if !matches!(self.advance(), Some(Token::RParen)) {
                        return Err(EngineError::new(ErrorKind::ValidationFailed, "unbalanced parentheses in loop expression"));
                    }
                    Ok(inner)
                }
                Some(Token::Number(n)) => Ok(serde_json::json!(n)),
                Some(Token::Str(s)) => Ok(Value::String(s)),
                Some(Token::Ident(name)) if name == "true" => Ok(Value::Bool(true)),
                Some(Token::Ident(name)) if name == "false" => Ok(Value::Bool(false)),
                Some(Token::Ident(name)) if name == "iteration" => Ok(serde_json::json!(self.iteration)),
                Some(Token::Ident(name)) if name == "data" => {
                    let mut current = self.data.clone();
                    while matches!(self.peek(), Some(Token::Dot)) {
                        self.advance();
                        match self.advance() {
                            Some(Token::Ident(field)) => {
                                current = current.get(&field).cloned().unwrap_or(Value::Null);
                            }
                            _ => return Err(EngineError::new(ErrorKind::ValidationFailed, "expected a field name after '.' in loop expression")),
                        }
                    }
                    Ok(current)
                }
                other => Err(EngineError::new(ErrorKind::ValidationFailed, format!("unexpected token in loop expression: {other:?}"))),
            }
        }
    }

    fn truthy(value: &Value) -> bool {
        value.as_bool().unwrap_or(!value.is_null())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::test_support::test_ctx;
    use std::sync::Arc;

    fn ctx_with_incrementer() -> crate::executors::ExecutorContext {
        let mut ctx = test_ctx(Value::Null);
        ctx.run_node = Arc::new(|_node_id, input| {
            Box::pin(async move {
                let n = input.get("n").and_then(Value::as_i64).unwrap_or(0);
                Ok(serde_json::json!({ "n": n + 1 }))
            })
        });
        ctx
    }

    #[tokio::test]
    async fn stops_on_condition_met() {
        let node = Node {
            node_id: "loop".into(),
            kind: NodeKind::Loop { body_node_id: "incrementer".into(), max_iterations: 10 },
            data: serde_json::json!({ "condition": { "type": "field", "field": "n", "operator": "gte", "value": 3 } }),
        };
        let ctx = ctx_with_incrementer();
        let out = LoopExecutor.execute(&node, serde_json::json!({"n": 0}), &ctx).await.unwrap().into_value();
        assert_eq!(out["exitReason"], "condition_met");
        assert_eq!(out["finalOutput"]["n"], 3);
        assert_eq!(out["totalIterations"], 3);
    }

    #[tokio::test]
    async fn stops_at_max_iterations_when_condition_never_met() {
        let node = Node {
            node_id: "loop".into(),
            kind: NodeKind::Loop { body_node_id: "incrementer".into(), max_iterations: 4 },
            data: serde_json::json!({ "condition": { "type": "field", "field": "n", "operator": "gte", "value": 999 } }),
        };
        let ctx = ctx_with_incrementer();
        let out = LoopExecutor.execute(&node, serde_json::json!({"n": 0}), &ctx).await.unwrap().into_value();
        assert_eq!(out["exitReason"], "max_iterations");
        assert_eq!(out["totalIterations"], 4);
    }

    #[tokio::test]
    async fn expression_condition_over_data_and_iteration() {
        let node = Node {
            node_id: "loop".into(),
            kind: NodeKind::Loop { body_node_id: "incrementer".into(), max_iterations: 10 },
            data: serde_json::json!({ "condition": { "type": "expression", "expression": "iteration >= 2" } }),
        };
        let ctx = ctx_with_incrementer();
        let out = LoopExecutor.execute(&node, serde_json::json!({"n": 0}), &ctx).await.unwrap().into_value();
        assert_eq!(out["exitReason"], "condition_met");
        assert_eq!(out["totalIterations"], 3);
    }
}

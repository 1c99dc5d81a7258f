//! Router executor: determines a route key and target node id but does not
//! execute downstream itself. The orchestrator gates traversal using the
//! returned `ExecutorOutput::Route`.

use async_trait::async_trait;
use serde_json::Value;

use super::{ExecutorContext, ExecutorOutput, NodeExecutor};
use crate::error::{EngineError, ErrorKind};
use crate::model::flow::Node;

pub struct RouterExecutor;

#[async_trait]
impl NodeExecutor for RouterExecutor {
    async fn execute(&self, node: &Node, input: Value, ctx: &ExecutorContext) -> Result<ExecutorOutput, EngineError> {
        ctx.check_cancelled()?;

        let route_key = if let Some(field) = node.data.get("routeField").and_then(Value::as_str) {
            get_nested_value(&input, field)
                .map(value_to_route_key)
                .ok_or_else(|| EngineError::new(ErrorKind::ValidationFailed, format!("route field '{field}' not present on input")))?
        } else if let Some(classifier_node_id) = node.data.get("classifierNodeId").and_then(Value::as_str) {
            let output = (ctx.run_node)(classifier_node_id.to_string(), input.clone()).await?;
            extract_route_from_output(&output)
        } else {
            return Err(EngineError::new(ErrorKind::ValidationFailed, "router node requires routeField or classifierNodeId"));
        };

        let routes = node.data.get("routes").and_then(Value::as_object);
        let target = routes
            .and_then(|r| r.get(&route_key))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| node.data.get("defaultRoute").and_then(Value::as_str).map(str::to_string));

        let target_node_id = target.ok_or_else(|| {
            EngineError::new(ErrorKind::ExecutionFailed, format!("no route found for key '{route_key}' and no defaultRoute configured"))
        })?;

        Ok(ExecutorOutput::Route { route_key, target_node_id, input })
    }
}

/// `output.route | output.category | output.class | toString(output)`.
fn extract_route_from_output(output: &Value) -> String {
    for key in ["route", "category", "class"] {
        if let Some(s) = output.get(key).and_then(Value::as_str) {
            return s.to_string();
        }
    }
    value_to_route_key(output)
}

fn value_to_route_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Dotted-path lookup, e.g. `a.b.c`.
fn get_nested_value<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::test_support::test_ctx;
    use crate::model::flow::NodeKind;

    #[tokio::test]
    async fn routes_by_field() {
        let node = Node {
            node_id: "r".into(),
            kind: NodeKind::Router,
            data: serde_json::json!({ "routeField": "category", "routes": { "urgent": "node-a", "normal": "node-b" } }),
        };
        let ctx = test_ctx(Value::Null);
        let input = serde_json::json!({ "category": "urgent" });
        let out = node_route(&node, input, &ctx).await;
        assert_eq!(out.0, "urgent");
        assert_eq!(out.1, "node-a");
    }

    #[tokio::test]
    async fn falls_back_to_default_route() {
        let node = Node {
            node_id: "r".into(),
            kind: NodeKind::Router,
            data: serde_json::json!({ "routeField": "category", "routes": {}, "defaultRoute": "node-default" }),
        };
        let ctx = test_ctx(Value::Null);
        let input = serde_json::json!({ "category": "unknown" });
        let out = node_route(&node, input, &ctx).await;
        assert_eq!(out.1, "node-default");
    }

    #[tokio::test]
    async fn no_match_no_default_is_fatal() {
        let node = Node {
            node_id: "r".into(),
            kind: NodeKind::Router,
            data: serde_json::json!({ "routeField": "category", "routes": {} }),
        };
        let ctx = test_ctx(Value::Null);
        let err = RouterExecutor.execute(&node, serde_json::json!({"category": "x"}), &ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExecutionFailed);
    }

    async fn node_route(node: &Node, input: Value, ctx: &crate::executors::ExecutorContext) -> (String, String) {
        match RouterExecutor.execute(node, input, ctx).await.unwrap() {
            ExecutorOutput::Route { route_key, target_node_id, .. } => (route_key, target_node_id),
            ExecutorOutput::Value(_) => panic!("expected a route"),
        }
    }
}

//! Sink executor: output | webhook | database | notification.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use once_cell_placeholder::Lazy;
use regex::Regex;
use serde_json::Value;

use super::{ExecutorContext, ExecutorOutput, NodeExecutor};
use crate::error::{EngineError, ErrorKind};
use crate::model::flow::{Node, NodeKind, SinkType};

mod once_cell_placeholder {
    //! A tiny `Lazy` so this module doesn't need an extra dependency just for
    //! one compiled regex; equivalent to `once_cell::sync::Lazy` but hand-rolled
    //! over `std::sync::OnceLock`.
    use std::sync::OnceLock;

    pub struct Lazy<T> {
        cell: OnceLock<T>,
        init: fn() -> T,
    }

    impl<T> Lazy<T> {
        pub const fn new(init: fn() -> T) -> Self {
            Self { cell: OnceLock::new(), init }
        }

        pub fn get(&self) -> &T {
            self.cell.get_or_init(self.init)
        }
    }
}

static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

pub struct SinkExecutor {
    http: reqwest::Client,
}

impl SinkExecutor {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds"),
        }
    }
}

impl Default for SinkExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutor for SinkExecutor {
    async fn execute(&self, node: &Node, input: Value, ctx: &ExecutorContext) -> Result<ExecutorOutput, EngineError> {
        ctx.check_cancelled()?;
        let sink_type = match &node.kind {
            NodeKind::Sink { sink_type } => *sink_type,
            _ => SinkType::Output,
        };

        let output = match sink_type {
            SinkType::Output => output_sink(input),
            SinkType::Webhook => self.webhook_sink(&node.data, input).await?,
            SinkType::Database => database_sink(&node.data, input)?,
            SinkType::Notification => notification_sink(input),
        };
        Ok(ExecutorOutput::Value(output))
    }
}

fn output_sink(input: Value) -> Value {
    serde_json::json!({
        "output": input,
        "completedAt": chrono::Utc::now().timestamp_millis(),
    })
}

impl SinkExecutor {
    async fn webhook_sink(&self, data: &Value, input: Value) -> Result<Value, EngineError> {
        let url_str = data
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::new(ErrorKind::ValidationFailed, "webhook sink requires a url"))?;

        let url = reqwest::Url::parse(url_str)
            .map_err(|e| EngineError::new(ErrorKind::ValidationFailed, format!("invalid webhook url: {e}")))?;

        reject_private_hostname(&url)?;

        let body = serde_json::to_vec(&input).map_err(|e| EngineError::execution_failed(e.to_string()))?;

        let mut request = self.http.post(url.clone()).header("content-type", "application/json").body(body.clone());

        if let Some(secret) = data.get("signingSecret").and_then(Value::as_str) {
            request = request.header("X-Signature", sign_hmac_sha256(secret, &body));
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::new(ErrorKind::NetworkError, format!("webhook request failed: {e}")))?;

        let status = response.status();
        Ok(serde_json::json!({ "delivered": status.is_success(), "statusCode": status.as_u16() }))
    }
}

fn reject_private_hostname(url: &reqwest::Url) -> Result<(), EngineError> {
    let Some(host) = url.host_str() else {
        return Err(EngineError::new(ErrorKind::ValidationFailed, "webhook url has no host"));
    };
    if host == "localhost" {
        return Err(EngineError::new(ErrorKind::ValidationFailed, "webhook url targets a private/internal hostname"));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        let is_private = match ip {
            IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local(),
        };
        if is_private {
            return Err(EngineError::new(ErrorKind::ValidationFailed, "webhook url targets a private/internal hostname"));
        }
    }
    Ok(())
}

fn sign_hmac_sha256(secret: &str, body: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

fn database_sink(data: &Value, input: Value) -> Result<Value, EngineError> {
    let table = data
        .get("table")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::new(ErrorKind::ValidationFailed, "database sink requires a table"))?;
    if !IDENTIFIER_RE.get().is_match(table) {
        return Err(EngineError::validation_failed(
            format!("invalid table identifier: {table}"),
            vec![crate::error::FieldIssue { field: "table".into(), message: "must match ^[A-Za-z_][A-Za-z0-9_]*$".into() }],
        ));
    }
    // Values are parameter-bound by the concrete store adapter; this reference
    // sink only validates the identifier and echoes the insert.
    Ok(serde_json::json!({ "table": table, "inserted": input }))
}

fn notification_sink(input: Value) -> Value {
    serde_json::json!({ "delivered": true, "notification": input })
}

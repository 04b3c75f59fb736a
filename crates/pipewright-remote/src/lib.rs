//! JSON-RPC client for the host gateway.
//!
//! One [`GatewayClient`] backs all three remote capabilities: generic remote
//! calls, isolated agent turns (`agent.runIsolated`) and system event
//! enqueue (`system.enqueue`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use pipewright_core::config::GatewayConfig;
use pipewright_core::error::{PipelineError, Result};
use pipewright_core::traits::{
    IsolatedExecutor, IsolatedRunRequest, IsolatedRunResponse, RemoteCall, SystemEvents,
};

pub const ISOLATED_RUN_METHOD: &str = "agent.runIsolated";
pub const ENQUEUE_METHOD: &str = "system.enqueue";

/// Extra time granted to an isolated turn over its own timeout before the
/// HTTP request is abandoned.
const ISOLATED_GRACE_SECS: u64 = 30;

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    message: String,
}

/// Gateway client. Cheap to clone; clones share the HTTP connection pool.
#[derive(Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    next_id: Arc<AtomicU64>,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/rpc", config.url.trim_end_matches('/')),
            token: config.token.clone(),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn rpc(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(method, id, "Gateway call");

        let mut req = self.client.post(&self.endpoint).json(&RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        });
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| PipelineError::external(method, format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::external(
                method,
                format!("gateway returned {status}: {body}"),
            ));
        }

        let body: RpcResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::external(method, format!("invalid response: {e}")))?;
        unwrap_response(method, body)
    }
}

fn unwrap_response(method: &str, body: RpcResponse) -> Result<Value> {
    match body.error {
        Some(err) => Err(PipelineError::external(
            method,
            format!("{} (code {})", err.message, err.code),
        )),
        None => Ok(body.result.unwrap_or(Value::Null)),
    }
}

impl RemoteCall for GatewayClient {
    fn call<'a>(&'a self, method: &'a str, params: Value) -> BoxFuture<'a, Result<Value>> {
        Box::pin(self.rpc(method, params, None))
    }
}

impl IsolatedExecutor for GatewayClient {
    fn run(&self, request: IsolatedRunRequest) -> BoxFuture<'_, Result<IsolatedRunResponse>> {
        Box::pin(async move {
            let timeout = Duration::from_secs(request.timeout_seconds + ISOLATED_GRACE_SECS);
            let params = serde_json::to_value(&request)?;
            let value = self.rpc(ISOLATED_RUN_METHOD, params, Some(timeout)).await?;
            serde_json::from_value(value).map_err(|e| {
                PipelineError::external(ISOLATED_RUN_METHOD, format!("invalid response: {e}"))
            })
        })
    }
}

impl SystemEvents for GatewayClient {
    fn enqueue(&self, text: String, session_key: Option<String>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, dropping system event");
            return;
        };
        let client = self.clone();
        runtime.spawn(async move {
            let params = serde_json::json!({ "text": text, "sessionKey": session_key });
            if let Err(e) = client.rpc(ENQUEUE_METHOD, params, None).await {
                warn!(error = %e, "Failed to enqueue system event");
            }
        });
    }
}

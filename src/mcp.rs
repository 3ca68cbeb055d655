//! MCP client: JSON-RPC 2.0 over HTTP(S), keyed by server id.
//!
//! Each configured server gets its own request-id counter and opaque header
//! set. A tool call either returns a result or a protocol error; transport
//! failures surface as provider errors. Disconnection is idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::McpServerConfig;
use crate::error::{HarnessError, Result};

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    #[allow(dead_code)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<McpError>,
}

/// Protocol-level error from a tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A tool advertised by a server's `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", alias = "input_schema", default)]
    pub input_schema: Option<Value>,
}

/// Outcome of one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<McpError>,
}

impl McpResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Flatten the standard `content: [{type: "text", text}]` payload.
    pub fn text_content(&self) -> Option<String> {
        let content = self.result.as_ref()?.get("content")?.as_array()?;
        let texts: Vec<&str> = content
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        }
    }
}

struct McpServerHandle {
    config: McpServerConfig,
    next_id: AtomicU64,
    tools: Vec<McpTool>,
}

#[derive(Default)]
pub struct McpClient {
    http: reqwest::Client,
    servers: RwLock<HashMap<String, Arc<McpServerHandle>>>,
}

impl McpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the config, perform the `initialize` handshake, and cache
    /// the server's tools.
    pub async fn connect(&self, config: McpServerConfig) -> Result<()> {
        validate_config(&config)?;

        let handle = Arc::new(McpServerHandle {
            config: config.clone(),
            next_id: AtomicU64::new(0),
            tools: Vec::new(),
        });

        let init = self
            .request(
                &handle,
                "initialize",
                Some(json!({
                    "protocolVersion": "2024-11-05",
                    "clientInfo": { "name": "answer-harness", "version": env!("CARGO_PKG_VERSION") },
                    "capabilities": {}
                })),
            )
            .await?;
        if let Some(error) = init.error {
            return Err(HarnessError::provider(format!(
                "MCP {} initialize failed: {} ({})",
                config.server_id, error.message, error.code
            )));
        }

        let tools = self.fetch_tools(&handle).await.unwrap_or_default();
        info!(server = %config.server_id, tools = tools.len(), "MCP server connected");

        let handle = Arc::new(McpServerHandle {
            config: config.clone(),
            next_id: AtomicU64::new(handle.next_id.load(Ordering::Relaxed)),
            tools,
        });
        self.servers
            .write()
            .await
            .insert(config.server_id.clone(), handle);
        Ok(())
    }

    /// Idempotent: disconnecting an unknown server is a no-op.
    pub async fn disconnect(&self, server_id: &str) {
        if self.servers.write().await.remove(server_id).is_some() {
            info!(server = server_id, "MCP server disconnected");
        }
    }

    pub async fn is_connected(&self, server_id: &str) -> bool {
        self.servers.read().await.contains_key(server_id)
    }

    pub async fn connected_servers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.servers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cached tool list from connect time; `refresh` re-queries the server.
    pub async fn discover_tools(&self, server_id: &str, refresh: bool) -> Result<Vec<McpTool>> {
        let handle = self.handle(server_id).await?;
        if !refresh {
            return Ok(handle.tools.clone());
        }
        self.fetch_tools(&handle).await
    }

    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<McpResponse> {
        let handle = self.handle(server_id).await?;
        let response = self
            .request(
                &handle,
                "tools/call",
                Some(json!({ "name": tool_name, "arguments": arguments })),
            )
            .await?;
        Ok(McpResponse {
            result: response.result,
            error: response.error,
        })
    }

    async fn handle(&self, server_id: &str) -> Result<Arc<McpServerHandle>> {
        self.servers
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| HarnessError::not_found(format!("MCP server {server_id}")))
    }

    async fn fetch_tools(&self, handle: &McpServerHandle) -> Result<Vec<McpTool>> {
        let response = self.request(handle, "tools/list", None).await?;
        if let Some(error) = response.error {
            return Err(HarnessError::provider(format!(
                "tools/list failed: {} ({})",
                error.message, error.code
            )));
        }
        let tools = response
            .result
            .and_then(|r| r.get("tools").cloned())
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        Ok(tools)
    }

    async fn request(
        &self,
        handle: &McpServerHandle,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse> {
        let id = handle.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        };
        debug!(server = %handle.config.server_id, method, id, "MCP request");

        let mut builder = self
            .http
            .post(&handle.config.endpoint)
            .timeout(Duration::from_secs(handle.config.timeout_secs))
            .json(&request);
        for (name, value) in &handle.config.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HarnessError::Timeout(Duration::from_secs(handle.config.timeout_secs))
            } else {
                HarnessError::provider(format!(
                    "MCP {} transport error: {e}",
                    handle.config.server_id
                ))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(HarnessError::provider(format!(
                "MCP {} returned HTTP {status}",
                handle.config.server_id
            )));
        }

        Ok(response.json().await.map_err(|e| {
            HarnessError::provider(format!("MCP {} invalid response: {e}", handle.config.server_id))
        })?)
    }
}

fn validate_config(config: &McpServerConfig) -> Result<()> {
    if config.server_id.trim().is_empty() {
        return Err(HarnessError::validation("MCP server_id must not be empty"));
    }
    let url = reqwest::Url::parse(&config.endpoint)
        .map_err(|e| HarnessError::validation(format!("MCP endpoint is not a URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
        return Err(HarnessError::validation(
            "MCP endpoint must be an absolute http(s) URL",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(endpoint: &str, id: &str) -> McpServerConfig {
        McpServerConfig {
            server_id: id.into(),
            endpoint: endpoint.into(),
            auto_connect: false,
            headers: HashMap::from([("x-api-key".to_string(), "secret".to_string())]),
            timeout_secs: 5,
        }
    }

    fn rpc_result(id: u64, result: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": id, "result": result })
    }

    async fn mock_initialize(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(body_partial_json(json!({ "method": "initialize" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(
                1,
                json!({ "protocolVersion": "2024-11-05", "capabilities": {} }),
            )))
            .mount(server)
            .await;
    }

    async fn mock_tools_list(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(body_partial_json(json!({ "method": "tools/list" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(
                2,
                json!({ "tools": [
                    { "name": "search", "description": "Search things",
                      "inputSchema": { "type": "object" } }
                ]}),
            )))
            .mount(server)
            .await;
    }

    #[test]
    fn test_config_validation() {
        assert!(validate_config(&config("http://localhost:9000/rpc", "srv")).is_ok());
        assert!(validate_config(&config("not a url", "srv")).is_err());
        assert!(validate_config(&config("ftp://host/rpc", "srv")).is_err());
        assert!(validate_config(&config("http://localhost/rpc", " ")).is_err());
    }

    #[tokio::test]
    async fn test_connect_discovers_tools() {
        let server = MockServer::start().await;
        mock_initialize(&server).await;
        mock_tools_list(&server).await;

        let client = McpClient::new();
        let endpoint = format!("{}/rpc", server.uri());
        client.connect(config(&endpoint, "tools")).await.unwrap();

        assert!(client.is_connected("tools").await);
        assert_eq!(client.connected_servers().await, vec!["tools".to_string()]);

        let tools = client.discover_tools("tools", false).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "search");
    }

    #[tokio::test]
    async fn test_call_tool_success_and_protocol_error() {
        let server = MockServer::start().await;
        mock_initialize(&server).await;
        mock_tools_list(&server).await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(body_partial_json(
                json!({ "method": "tools/call", "params": { "name": "search" } }),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(
                3,
                json!({ "content": [ { "type": "text", "text": "found 2 results" } ] }),
            )))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(body_partial_json(
                json!({ "method": "tools/call", "params": { "name": "broken" } }),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 4,
                "error": { "code": -32601, "message": "unknown tool" }
            })))
            .mount(&server)
            .await;

        let client = McpClient::new();
        let endpoint = format!("{}/rpc", server.uri());
        client.connect(config(&endpoint, "srv")).await.unwrap();

        let ok = client
            .call_tool("srv", "search", json!({ "query": "x" }))
            .await
            .unwrap();
        assert!(ok.is_success());
        assert_eq!(ok.text_content().unwrap(), "found 2 results");

        let bad = client.call_tool("srv", "broken", json!({})).await.unwrap();
        assert!(!bad.is_success());
        assert_eq!(bad.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let server = MockServer::start().await;
        mock_initialize(&server).await;
        mock_tools_list(&server).await;

        let client = McpClient::new();
        let endpoint = format!("{}/rpc", server.uri());
        client.connect(config(&endpoint, "srv")).await.unwrap();

        client.disconnect("srv").await;
        assert!(!client.is_connected("srv").await);
        client.disconnect("srv").await; // no-op
        client.disconnect("never-existed").await; // no-op

        let err = client.call_tool("srv", "search", json!({})).await.unwrap_err();
        assert!(matches!(err, HarnessError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_headers_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(wiremock::matchers::header("x-api-key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(1, json!({}))))
            .mount(&server)
            .await;

        let client = McpClient::new();
        let endpoint = format!("{}/rpc", server.uri());
        // initialize + tools/list both hit the header-matching mock.
        client.connect(config(&endpoint, "hdr")).await.unwrap();
        assert!(client.is_connected("hdr").await);
    }
}

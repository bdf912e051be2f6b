// Rewind - EVM State Time Machine
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use rewind_common::AdapterError;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, trace};

/// Default per-call timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Error code reported when a backend error object carries none.
const INTERNAL_ERROR: i64 = -32603;

/// JSON-RPC 2.0 client over HTTP.
///
/// Cheap to clone; clones share the connection pool and the request id counter.
#[derive(Debug, Clone)]
pub struct RpcClient {
    url: Arc<str>,
    client: reqwest::Client,
    next_id: Arc<AtomicU64>,
    timeout: Duration,
}

impl RpcClient {
    /// Client for `url` with the default timeout.
    pub fn new(url: impl AsRef<str>) -> Self {
        Self {
            url: Arc::from(url.as_ref()),
            client: reqwest::Client::new(),
            next_id: Arc::new(AtomicU64::new(1)),
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Sets the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Calls `method` and decodes the result.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, AdapterError> {
        let result = self.request_value(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| AdapterError::Decode(format!("{method} returned an unexpected shape: {e}")))
    }

    /// Calls `method` and returns the raw `result` member.
    pub async fn request_value(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id
        });
        debug!(method, id, url = %self.url, "rpc request");

        let response = self
            .client
            .post(self.url.as_ref())
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdapterError::Timeout { operation: method.to_string(), elapsed: self.timeout }
                } else {
                    AdapterError::Transport(format!("{method}: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| AdapterError::Transport(format!("{method}: {e}")))?;
        let envelope: Value = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(AdapterError::Transport(format!("{method}: HTTP {status}")))
            }
            Err(e) => return Err(AdapterError::Decode(format!("{method}: invalid JSON: {e}"))),
        };
        trace!(method, id, response = %envelope, "rpc response");

        parse_envelope(method, envelope)
    }
}

fn parse_envelope(method: &str, mut envelope: Value) -> Result<Value, AdapterError> {
    if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(INTERNAL_ERROR);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(AdapterError::Rpc { code, message });
    }

    match envelope.as_object_mut().and_then(|obj| obj.remove("result")) {
        Some(result) => Ok(result),
        None => Err(AdapterError::Decode(format!("{method}: response has neither result nor error"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_common::logging::ensure_test_logging;
    use wiremock::{
        matchers::{body_partial_json, method},
        Mock, MockServer, ResponseTemplate,
    };

    #[tokio::test]
    async fn test_request_returns_result() {
        ensure_test_logging(None);
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_blockNumber"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": "0x10"})),
            )
            .mount(&server)
            .await;

        let client = RpcClient::new(server.uri());
        let result: String = client.request("eth_blockNumber", json!([])).await.unwrap();
        assert_eq!(result, "0x10");
    }

    #[tokio::test]
    async fn test_error_object_maps_to_rpc_error() {
        ensure_test_logging(None);
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32601, "message": "method not found"}
            })))
            .mount(&server)
            .await;

        let client = RpcClient::new(server.uri());
        let err = client.request_value("anvil_setBalance", json!([])).await.unwrap_err();
        assert!(matches!(err, AdapterError::Rpc { code: -32601, .. }));
    }

    #[tokio::test]
    async fn test_http_failure_without_body_is_transport_error() {
        ensure_test_logging(None);
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(502)).mount(&server).await;

        let client = RpcClient::new(server.uri());
        let err = client.request_value("eth_chainId", json!([])).await.unwrap_err();
        assert!(matches!(err, AdapterError::Transport(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        ensure_test_logging(None);
        let client =
            RpcClient::new("http://127.0.0.1:1").with_timeout(Duration::from_millis(500));
        assert!(client.request_value("eth_chainId", json!([])).await.is_err());
    }

    #[test]
    fn test_null_result_is_a_result() {
        let value = parse_envelope("m", json!({"jsonrpc": "2.0", "id": 1, "result": null})).unwrap();
        assert!(value.is_null());
        assert!(parse_envelope("m", json!({"jsonrpc": "2.0", "id": 1})).is_err());
    }
}

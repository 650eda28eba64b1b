use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::rpc::{RpcClient, RpcClientErrors};
use crate::core::metrics::exporter_metrics::AGENT_RPC_REQUESTS;

/// Check if an HTTP status code represents a transient (retryable) error
fn is_transient_error(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || (status.as_u16() >= 500 && status.as_u16() < 600)
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorObject>,
}

///
/// JSON-RPC 2.0 over HTTP POST against a single node
///
pub struct JsonRpcHttpClient {
    url: String,
    client: Client,
    request_id: AtomicU64,
}

impl JsonRpcHttpClient {
    pub fn new(url: String, timeout: Option<Duration>) -> Result<Self, RpcClientErrors> {
        let url = url.trim_end_matches('/').to_string();
        let client = ClientBuilder::new()
            .timeout(timeout.unwrap_or(Duration::from_secs(30)))
            .build()?;

        Ok(Self {
            url,
            client,
            request_id: AtomicU64::new(1),
        })
    }

    fn record(&self, method: &str, status: &str) {
        AGENT_RPC_REQUESTS
            .with_label_values(&[&self.url, method, status])
            .inc();
    }
}

#[async_trait]
impl RpcClient for JsonRpcHttpClient {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value, RpcClientErrors> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id
        });
        debug!("(JsonRpc) Calling {} on {}", method, self.url);

        let response = match self.client.post(&self.url).json(&payload).send().await {
            Ok(res) => res,
            Err(e) => {
                self.record(method, "error");
                warn!("(JsonRpc) Network error calling {} on {}: {}", method, self.url, e);
                return Err(e.into());
            }
        };

        let status = response.status();
        self.record(method, &status.as_u16().to_string());

        if status != StatusCode::OK {
            if is_transient_error(status) {
                warn!(
                    "(JsonRpc) Transient error ({}) calling {} on {}",
                    status.as_u16(),
                    method,
                    self.url
                );
            }
            return Err(RpcClientErrors::Status {
                endpoint: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let body: JsonRpcResponse = response.json().await?;
        if let Some(error) = body.error {
            return Err(RpcClientErrors::Rpc {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            });
        }
        Ok(body.result.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_status_classification() {
        assert!(is_transient_error(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_error(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_error(StatusCode::NOT_FOUND));
        assert!(!is_transient_error(StatusCode::OK));
    }

    #[test]
    fn test_response_envelope_parsing() {
        let ok: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#).unwrap();
        assert_eq!(ok.result, Some(Value::String("0x10".to_string())));
        assert!(ok.error.is_none());

        let err: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"method not found"}}"#,
        )
        .unwrap();
        let error = err.error.unwrap();
        assert_eq!(error.code, -32601);
        assert_eq!(error.message, "method not found");

        let null: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert!(null.result.is_none());
    }

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let client = JsonRpcHttpClient::new("http://localhost:8545/".to_string(), None).unwrap();
        assert_eq!(client.endpoint(), "http://localhost:8545");
    }
}

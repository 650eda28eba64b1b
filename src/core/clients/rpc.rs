use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::utils::{parse_u64, to_hex_quantity, QuantityError};

#[derive(Debug, Error)]
pub enum RpcClientErrors {
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status} from {endpoint}")]
    Status { endpoint: String, status: u16 },

    #[error("JSON-RPC error {code} calling {method}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    #[error("Malformed response for {method}: {reason}")]
    InvalidResponse { method: String, reason: String },

    #[error("Invalid quantity in {method} response: {source}")]
    Quantity {
        method: String,
        source: QuantityError,
    },
}

///
/// JSON-RPC surface consumed by the agent. Implementors only provide `send`,
/// the typed helpers are derived from it.
///
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Name used in logs and metric labels
    fn endpoint(&self) -> &str;

    async fn send(&self, method: &str, params: Value) -> Result<Value, RpcClientErrors>;

    /// Liveness probe
    async fn get_block_number(&self) -> Result<u64, RpcClientErrors> {
        let result = self.send("eth_blockNumber", json!([])).await?;
        parse_u64(&result).map_err(|source| RpcClientErrors::Quantity {
            method: "eth_blockNumber".to_string(),
            source,
        })
    }

    /// Network id as reported by `net_version`
    async fn get_network(&self) -> Result<String, RpcClientErrors> {
        match self.send("net_version", json!([])).await? {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(RpcClientErrors::InvalidResponse {
                method: "net_version".to_string(),
                reason: format!("unexpected value {}", other),
            }),
        }
    }

    async fn get_client_version(&self) -> Result<String, RpcClientErrors> {
        match self.send("web3_clientVersion", json!([])).await? {
            Value::String(s) => Ok(s),
            other => Err(RpcClientErrors::InvalidResponse {
                method: "web3_clientVersion".to_string(),
                reason: format!("unexpected value {}", other),
            }),
        }
    }

    /// Raw gas price quantity in the chain's smallest unit
    async fn get_gas_price(&self) -> Result<Value, RpcClientErrors> {
        self.send("eth_gasPrice", json!([])).await
    }

    /// Raw peer count, `null` when the node does not report one
    async fn get_peer_count(&self) -> Result<Value, RpcClientErrors> {
        self.send("net_peerCount", json!([])).await
    }

    /// `false` or a syncing object
    async fn get_syncing(&self) -> Result<Value, RpcClientErrors> {
        self.send("eth_syncing", json!([])).await
    }

    async fn get_block_by_number(
        &self,
        number: u64,
        include_transactions: bool,
    ) -> Result<Value, RpcClientErrors> {
        self.send(
            "eth_getBlockByNumber",
            json!([to_hex_quantity(number), include_transactions]),
        )
        .await
    }
}

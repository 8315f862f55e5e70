// Chain reader over the node JSON-RPC interface

use super::{ArgFormat, ChainReader, ContractArg};
use crate::config::ChainConfig;
use crate::errors::ChainError;
use crate::models::{Block, Epoch, Identity, Transaction, TxKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, instrument};

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EpochWire {
    epoch: u64,
    next_validation: DateTime<Utc>,
    #[serde(default)]
    start_block: u64,
}

#[derive(Debug, Deserialize)]
struct TransactionWire {
    hash: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    payload: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceWire {
    balance: String,
}

/// JSON-RPC client for an Idena-compatible node
pub struct NodeClient {
    client: Client,
    url: String,
    api_key: String,
    next_id: AtomicU64,
}

impl NodeClient {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        timeout_seconds: u64,
    ) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| ChainError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn from_config(config: &ChainConfig) -> Result<Self, ChainError> {
        Self::new(
            config.node_url.clone(),
            config.api_key.clone(),
            config.request_timeout_seconds,
        )
    }

    /// Issue one RPC call; a null result comes back as `None`
    #[instrument(skip(self, params))]
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, ChainError> {
        let body = json!({
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "key": self.api_key,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let rpc: RpcResponse = response.json().await?;

        if let Some(error) = rpc.error {
            debug!(code = error.code, message = %error.message, "Node returned an error");
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        match rpc.result {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                ChainError::InvalidResponse {
                    method: method.to_string(),
                    reason: e.to_string(),
                }
            }),
        }
    }

    async fn call_required<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ChainError> {
        self.call(method, params)
            .await?
            .ok_or_else(|| ChainError::NotFound(format!("{} returned no result", method)))
    }
}

#[async_trait]
impl ChainReader for NodeClient {
    async fn current_epoch(&self) -> Result<Epoch, ChainError> {
        let wire: EpochWire = self.call_required("dna_epoch", json!([])).await?;
        Ok(Epoch {
            number: wire.epoch,
            next_validation_time: wire.next_validation,
            start_block_height: wire.start_block,
        })
    }

    async fn last_block(&self) -> Result<Block, ChainError> {
        self.call_required("bcn_lastBlock", json!([])).await
    }

    async fn block_at(&self, height: u64) -> Result<Option<Block>, ChainError> {
        match self.call("bcn_blockAt", json!([height])).await {
            Ok(block) => Ok(block),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn transaction(&self, hash: &str) -> Result<Transaction, ChainError> {
        let wire: TransactionWire = self.call_required("bcn_transaction", json!([hash])).await?;
        Ok(Transaction {
            hash: wire.hash,
            kind: TxKind::from_node_type(&wire.kind),
            to: wire.to,
            payload: wire.payload,
        })
    }

    async fn contract_read(
        &self,
        contract: &str,
        key: &str,
        format: ArgFormat,
    ) -> Result<Value, ChainError> {
        self.call_required("contract_readData", json!([contract, key, format.as_str()]))
            .await
    }

    async fn contract_readonly_call(
        &self,
        contract: &str,
        method: &str,
        format: ArgFormat,
        args: &[ContractArg],
    ) -> Result<Value, ChainError> {
        let params = json!([{
            "contract": contract,
            "method": method,
            "format": format.as_str(),
            "args": args,
        }]);
        self.call_required("contract_readonlyCall", params).await
    }

    async fn contract_read_map(
        &self,
        contract: &str,
        map: &str,
        key: &str,
        format: ArgFormat,
    ) -> Result<Value, ChainError> {
        self.call_required(
            "contract_readMap",
            json!([contract, map, key, format.as_str()]),
        )
        .await
    }

    async fn balance(&self, address: &str) -> Result<String, ChainError> {
        let wire: BalanceWire = self.call_required("dna_getBalance", json!([address])).await?;
        Ok(wire.balance)
    }

    async fn identity(&self, address: &str) -> Result<Identity, ChainError> {
        self.call_required("dna_identity", json!([address])).await
    }
}

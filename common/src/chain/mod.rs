// Read-only access to the chain node

pub mod attachment;
pub mod memory;
pub mod rpc;

use crate::errors::ChainError;
use crate::models::{Block, Epoch, Identity, Transaction};
use async_trait::async_trait;
use serde::Serialize;

pub use attachment::{decode_call_attachment, CallContractAttachment};
pub use memory::ScriptedChain;
pub use rpc::NodeClient;

/// Encoding of a contract value or argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgFormat {
    Hex,
    Byte,
    Uint64,
    Int64,
    String,
    Bigint,
    Dna,
}

impl ArgFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArgFormat::Hex => "hex",
            ArgFormat::Byte => "byte",
            ArgFormat::Uint64 => "uint64",
            ArgFormat::Int64 => "int64",
            ArgFormat::String => "string",
            ArgFormat::Bigint => "bigint",
            ArgFormat::Dna => "dna",
        }
    }
}

/// Positional argument of a read-only contract call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractArg {
    pub index: u32,
    pub format: ArgFormat,
    pub value: String,
}

impl ContractArg {
    pub fn hex(index: u32, value: impl Into<String>) -> Self {
        Self {
            index,
            format: ArgFormat::Hex,
            value: value.into(),
        }
    }
}

/// Read-only view of the chain
///
/// Contract reads fail with an error when the key or map entry is absent;
/// callers decide whether absence is meaningful.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn current_epoch(&self) -> Result<Epoch, ChainError>;

    async fn last_block(&self) -> Result<Block, ChainError>;

    /// `None` when the chain has not reached `height` yet
    async fn block_at(&self, height: u64) -> Result<Option<Block>, ChainError>;

    async fn transaction(&self, hash: &str) -> Result<Transaction, ChainError>;

    async fn contract_read(
        &self,
        contract: &str,
        key: &str,
        format: ArgFormat,
    ) -> Result<serde_json::Value, ChainError>;

    async fn contract_readonly_call(
        &self,
        contract: &str,
        method: &str,
        format: ArgFormat,
        args: &[ContractArg],
    ) -> Result<serde_json::Value, ChainError>;

    async fn contract_read_map(
        &self,
        contract: &str,
        map: &str,
        key: &str,
        format: ArgFormat,
    ) -> Result<serde_json::Value, ChainError>;

    /// Balance of an address as the decimal string the node reports
    async fn balance(&self, address: &str) -> Result<String, ChainError>;

    async fn identity(&self, address: &str) -> Result<Identity, ChainError>;
}

/// Interpret a contract value as an unsigned integer
///
/// The node returns uint64 reads either as JSON numbers or decimal strings.
pub fn value_as_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

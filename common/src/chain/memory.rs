// Scripted in-memory chain used by tests and local dry runs

use super::{ArgFormat, CallContractAttachment, ChainReader, ContractArg};
use crate::errors::ChainError;
use crate::models::{Block, Epoch, Identity, Transaction, TxKind};
use async_trait::async_trait;
use prost::Message;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct ChainState {
    epoch: Option<Epoch>,
    head: Option<Block>,
    blocks: BTreeMap<u64, Block>,
    transactions: HashMap<String, Transaction>,
    data: HashMap<(String, String), Value>,
    calls: HashMap<(String, String, Option<String>), Value>,
    maps: HashMap<(String, String, String), Value>,
    balances: HashMap<String, String>,
    identities: HashMap<String, Identity>,
    failing_heights: HashSet<u64>,
    epoch_failures: u32,
    head_failures: u32,
    requested_heights: Vec<u64>,
}

/// Chain whose contents are set up by the caller
///
/// Reads of anything not scripted fail with `ChainError::NotFound`.
#[derive(Debug, Default)]
pub struct ScriptedChain {
    state: Mutex<ChainState>,
}

impl ScriptedChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ChainState) -> R) -> R {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn set_epoch(&self, epoch: Epoch) {
        self.with_state(|s| s.epoch = Some(epoch));
    }

    pub fn set_head(&self, block: Block) {
        self.with_state(|s| s.head = Some(block));
    }

    pub fn push_block(&self, block: Block) {
        self.with_state(|s| {
            s.blocks.insert(block.height, block);
        });
    }

    /// Add empty blocks for every height in `from..=to`
    pub fn push_empty_blocks(&self, from: u64, to: u64) {
        for height in from..=to {
            self.push_block(Block {
                height,
                timestamp: 1_700_000_000 + height as i64 * 20,
                transactions: Vec::new(),
            });
        }
    }

    pub fn add_transaction(&self, tx: Transaction) {
        self.with_state(|s| {
            s.transactions.insert(tx.hash.clone(), tx);
        });
    }

    /// Register a call-contract transaction invoking `method` on `contract`
    pub fn add_contract_call(&self, hash: &str, contract: &str, method: &str) {
        let attachment = CallContractAttachment {
            method: method.to_string(),
            args: Vec::new(),
        };
        self.add_transaction(Transaction {
            hash: hash.to_string(),
            kind: TxKind::CallContract,
            to: Some(contract.to_string()),
            payload: Some(format!("0x{}", hex::encode(attachment.encode_to_vec()))),
        });
    }

    pub fn set_data(&self, contract: &str, key: &str, value: Value) {
        self.with_state(|s| {
            s.data.insert((contract.to_string(), key.to_string()), value);
        });
    }

    /// Script a read-only call result, optionally only for a given first argument
    pub fn set_call(&self, contract: &str, method: &str, first_arg: Option<&str>, value: Value) {
        self.with_state(|s| {
            s.calls.insert(
                (
                    contract.to_string(),
                    method.to_string(),
                    first_arg.map(str::to_string),
                ),
                value,
            );
        });
    }

    pub fn set_map_entry(&self, contract: &str, map: &str, key: &str, value: Value) {
        self.with_state(|s| {
            s.maps.insert(
                (contract.to_string(), map.to_string(), key.to_string()),
                value,
            );
        });
    }

    pub fn set_balance(&self, address: &str, balance: &str) {
        self.with_state(|s| {
            s.balances.insert(address.to_string(), balance.to_string());
        });
    }

    pub fn set_identity(&self, identity: Identity) {
        self.with_state(|s| {
            s.identities.insert(identity.address.clone(), identity);
        });
    }

    /// Make the next `block_at(height)` fail with a transport error
    pub fn fail_block_once(&self, height: u64) {
        self.with_state(|s| {
            s.failing_heights.insert(height);
        });
    }

    /// Make the next `times` epoch reads fail
    pub fn fail_epoch_reads(&self, times: u32) {
        self.with_state(|s| s.epoch_failures = times);
    }

    /// Make the next `times` chain head reads fail
    pub fn fail_head_reads(&self, times: u32) {
        self.with_state(|s| s.head_failures = times);
    }

    /// Heights passed to `block_at`, in call order
    pub fn requested_heights(&self) -> Vec<u64> {
        self.with_state(|s| s.requested_heights.clone())
    }
}

fn not_found(what: String) -> ChainError {
    ChainError::NotFound(what)
}

#[async_trait]
impl ChainReader for ScriptedChain {
    async fn current_epoch(&self) -> Result<Epoch, ChainError> {
        self.with_state(|s| {
            if s.epoch_failures > 0 {
                s.epoch_failures -= 1;
                return Err(ChainError::Transport("node unreachable".to_string()));
            }
            s.epoch.clone().ok_or_else(|| not_found("epoch".to_string()))
        })
    }

    async fn last_block(&self) -> Result<Block, ChainError> {
        self.with_state(|s| {
            if s.head_failures > 0 {
                s.head_failures -= 1;
                return Err(ChainError::Transport("node unreachable".to_string()));
            }
            s.head
                .clone()
                .or_else(|| s.blocks.values().next_back().cloned())
                .ok_or_else(|| not_found("last block".to_string()))
        })
    }

    async fn block_at(&self, height: u64) -> Result<Option<Block>, ChainError> {
        self.with_state(|s| {
            s.requested_heights.push(height);
            if s.failing_heights.remove(&height) {
                return Err(ChainError::Transport(format!(
                    "injected failure at height {}",
                    height
                )));
            }
            Ok(s.blocks.get(&height).cloned())
        })
    }

    async fn transaction(&self, hash: &str) -> Result<Transaction, ChainError> {
        self.with_state(|s| {
            s.transactions
                .get(hash)
                .cloned()
                .ok_or_else(|| not_found(format!("transaction {}", hash)))
        })
    }

    async fn contract_read(
        &self,
        contract: &str,
        key: &str,
        _format: ArgFormat,
    ) -> Result<Value, ChainError> {
        self.with_state(|s| {
            s.data
                .get(&(contract.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| not_found(format!("{}:{}", contract, key)))
        })
    }

    async fn contract_readonly_call(
        &self,
        contract: &str,
        method: &str,
        _format: ArgFormat,
        args: &[ContractArg],
    ) -> Result<Value, ChainError> {
        let first_arg = args.first().map(|a| a.value.clone());
        self.with_state(|s| {
            s.calls
                .get(&(contract.to_string(), method.to_string(), first_arg))
                .or_else(|| s.calls.get(&(contract.to_string(), method.to_string(), None)))
                .cloned()
                .ok_or_else(|| not_found(format!("{}.{}", contract, method)))
        })
    }

    async fn contract_read_map(
        &self,
        contract: &str,
        map: &str,
        key: &str,
        _format: ArgFormat,
    ) -> Result<Value, ChainError> {
        self.with_state(|s| {
            s.maps
                .get(&(contract.to_string(), map.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| not_found(format!("{}.{}[{}]", contract, map, key)))
        })
    }

    async fn balance(&self, address: &str) -> Result<String, ChainError> {
        self.with_state(|s| {
            s.balances
                .get(address)
                .cloned()
                .ok_or_else(|| not_found(format!("balance {}", address)))
        })
    }

    async fn identity(&self, address: &str) -> Result<Identity, ChainError> {
        self.with_state(|s| {
            s.identities
                .get(address)
                .cloned()
                .ok_or_else(|| not_found(format!("identity {}", address)))
        })
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================================================
// Epoch Models
// ============================================================================

/// Snapshot of the current validation cycle as reported by the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub number: u64,
    pub next_validation_time: DateTime<Utc>,
    pub start_block_height: u64,
}

/// Block as seen by the chain poller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    /// Unix timestamp in seconds
    pub timestamp: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub transactions: Vec<String>,
}

/// Transaction type as far as the poller cares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    CallContract,
    Other(String),
}

impl TxKind {
    pub fn from_node_type(value: &str) -> Self {
        match value {
            "callContract" | "CallContractTx" => TxKind::CallContract,
            other => TxKind::Other(other.to_string()),
        }
    }
}

/// Decoded transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub kind: TxKind,
    pub to: Option<String>,
    /// Hex encoded attachment payload
    pub payload: Option<String>,
}

// ============================================================================
// Identity Models
// ============================================================================

/// On-chain identity status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum IdentityState {
    Invite,
    Candidate,
    Newbie,
    Verified,
    Human,
    Suspended,
    Zombie,
    #[default]
    #[serde(other)]
    Undefined,
}

impl fmt::Display for IdentityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IdentityState::Undefined => "Undefined",
            IdentityState::Invite => "Invite",
            IdentityState::Candidate => "Candidate",
            IdentityState::Newbie => "Newbie",
            IdentityState::Verified => "Verified",
            IdentityState::Human => "Human",
            IdentityState::Suspended => "Suspended",
            IdentityState::Zombie => "Zombie",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitee {
    #[serde(rename = "Address", alias = "address")]
    pub address: String,
}

/// Per-subscriber snapshot of on-chain identity state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub state: IdentityState,
    #[serde(default)]
    pub age: u32,
    #[serde(default)]
    pub stake: String,
    #[serde(default)]
    pub invites: u32,
    #[serde(default)]
    pub made_flips: u32,
    #[serde(default)]
    pub required_flips: u32,
    #[serde(default)]
    pub available_flips: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub invitees: Vec<Invitee>,
}

impl Identity {
    /// Flips made cover the required amount
    pub fn is_ready_for_validation(&self) -> bool {
        self.made_flips >= self.required_flips
    }
}

/// Readiness partition used by segmented triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Readiness {
    Ready,
    NotReady,
}

impl Readiness {
    pub fn of(identity: &Identity) -> Self {
        if identity.is_ready_for_validation() {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Readiness::Ready => "ready",
            Readiness::NotReady => "not-ready",
        }
    }
}

// ============================================================================
// Subscriber Models
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub chat_id: i64,
    pub coinbase_address: String,
    #[serde(default)]
    pub identity: Option<Identity>,
}

impl Subscriber {
    pub fn new(id: impl Into<String>, chat_id: i64, coinbase_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            chat_id,
            coinbase_address: coinbase_address.into(),
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }
}

// ============================================================================
// Persistence Models
// ============================================================================

/// Idempotency marker for a `(trigger_id, epoch)` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub trigger_id: String,
    pub epoch: u64,
    pub payload: Option<serde_json::Value>,
}

/// Last processed block height of the chain poller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainCursor {
    pub block: u64,
}

impl ChainCursor {
    pub fn new(block: u64) -> Self {
        Self { block }
    }

    pub fn next_height(&self) -> u64 {
        self.block + 1
    }

    pub fn advance(self) -> Self {
        Self {
            block: self.block + 1,
        }
    }
}

/// Delayed reveal check on an oracle voting contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleVotingWatch {
    pub contract_address: String,
    pub due_block_height: u64,
}

// ============================================================================
// Notification Models
// ============================================================================

/// Inline button attached to a notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub title: String,
    pub url: String,
}

/// A message produced by a trigger for one subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub trigger_id: String,
    pub epoch: u64,
    pub subscriber_id: String,
    pub chat_id: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
}

impl Notification {
    /// Key used by the transport to drop duplicate deliveries
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.trigger_id, self.epoch, self.subscriber_id)
    }
}

/// Data Models Module
///
/// This module defines the core data structures used throughout the application.
/// These models represent decoded ledger data (blocks, operations, accounts, votes)
/// and the messages that travel between the workers and the sink writers.
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Position of a block in the chain
pub type BlockHeight = u64;

/// Unit of work handed from the height source to exactly one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTask {
    pub height: BlockHeight,
}

/// A single operation inside a block, normalised from either node encoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockOperation {
    pub trx_index: usize,
    pub trx_id: Option<String>,
    pub kind: String,
    pub payload: serde_json::Value,
}

/// All operations of one block, tagged with the originating height
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationBatch {
    pub height: BlockHeight,
    pub timestamp: NaiveDateTime,
    pub transaction_count: usize,
    pub operations: Vec<BlockOperation>,
}

/// A new account name detected in a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEvent {
    pub name: String,
    pub height: BlockHeight,
    pub trx_id: Option<String>,
    pub creator: Option<String>,
}

/// Snapshot of an account as reported by the node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub name: String,
    pub created: Option<NaiveDateTime>,
    pub mined: bool,
    pub post_count: u64,
    pub balance: String,
    pub witness_votes: Vec<String>,
    pub reputation: BTreeMap<String, String>,
    pub last_post: Option<NaiveDateTime>,
    pub voting_power: i64,
}

/// One entry of an account's operation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountHistoryEntry {
    pub sequence: u64,
    pub trx_id: String,
    pub op_type: String,
    pub op: serde_json::Value,
    pub voter: Option<String>,
    pub author: Option<String>,
    pub permlink: Option<String>,
    pub weight: Option<i64>,
    pub timestamp: NaiveDateTime,
}

/// A single vote cast by an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteEntry {
    pub authorperm: String,
    pub weight: i64,
    pub rshares: i64,
    pub percent: i64,
    pub time: NaiveDateTime,
}

impl VoteEntry {
    /// Author part of `author/permlink`
    pub fn author(&self) -> &str {
        self.authorperm.split_once('/').map(|(author, _)| author).unwrap_or(&self.authorperm)
    }
}

/// All votes of one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub account: String,
    pub votes: Vec<VoteEntry>,
}

/// Account snapshot plus history, ready for the account writer
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedAccount {
    pub event: AccountEvent,
    pub record: AccountRecord,
    pub history: Vec<AccountHistoryEntry>,
}

/// Destination role of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkRole {
    Operations,
    Accounts,
    Votes,
}

impl SinkRole {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Operations => "operations",
            Self::Accounts => "accounts",
            Self::Votes => "votes",
        }
    }
}

impl std::fmt::Display for SinkRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of payloads carried by the writer queues
#[derive(Debug, Clone, PartialEq)]
pub enum SinkMessage {
    OperationBatch(OperationBatch),
    Account(Box<EnrichedAccount>),
    Votes(VoteRecord),
}

impl SinkMessage {
    pub fn role(&self) -> SinkRole {
        match self {
            Self::OperationBatch(_) => SinkRole::Operations,
            Self::Account(_) => SinkRole::Accounts,
            Self::Votes(_) => SinkRole::Votes,
        }
    }

    /// Natural key of the message, used in logs and for upserts
    pub fn key(&self) -> String {
        match self {
            Self::OperationBatch(batch) => batch.height.to_string(),
            Self::Account(account) => account.record.name.clone(),
            Self::Votes(votes) => votes.account.clone(),
        }
    }
}

/// Per-height processing state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeightState {
    Pending,
    Fetching,
    Decoded,
    ExtractingAccounts,
    QueuedForWrite,
    Written,
    Failed,
}

impl HeightState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Written | Self::Failed)
    }
}

/// Chain properties used to bound a processing pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainProperties {
    pub head_block_number: BlockHeight,
    pub last_irreversible_block_num: BlockHeight,
}

/// Test doubles for the ledger node and the operational store
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{DecodeError, FetchError, TransportError, WriteError, INVALID_PARAMS};
use crate::etl::load::OperationalStore;
use crate::etl::transform::parse_node_time;
use crate::models::{BlockHeight, EnrichedAccount, OperationBatch, VoteEntry, VoteRecord};
use crate::rpc::LedgerApi;

pub fn empty_block() -> Value {
    json!({ "timestamp": "2016-03-24T16:05:00", "transactions": [], "transaction_ids": [] })
}

/// A block with one account creation operation per name, each in its own transaction
pub fn block_with_accounts(names: &[&str]) -> Value {
    let transactions: Vec<Value> = names
        .iter()
        .map(|name| {
            json!({
                "operations": [
                    ["account_create", { "creator": "steem", "new_account_name": name, "fee": "0.100 STEEM" }]
                ]
            })
        })
        .collect();
    let ids: Vec<String> = (0..names.len()).map(|i| format!("trx{}", i)).collect();

    json!({ "timestamp": "2016-03-24T16:05:00", "transactions": transactions, "transaction_ids": ids })
}

pub fn batch(height: BlockHeight) -> OperationBatch {
    OperationBatch {
        height,
        timestamp: parse_node_time("2016-03-24T16:05:00").unwrap(),
        transaction_count: 0,
        operations: vec![],
    }
}

/// Scripted ledger node that counts every call
#[derive(Default)]
pub struct MockLedger {
    last_irreversible: AtomicU64,
    failing_properties: AtomicUsize,
    blocks: Mutex<HashMap<BlockHeight, Value>>,
    failing_blocks: Mutex<HashSet<BlockHeight>>,
    garbled_blocks: Mutex<HashSet<BlockHeight>>,
    failing_accounts: Mutex<HashSet<String>>,
    rejected_accounts: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    fetched_heights: Mutex<Vec<BlockHeight>>,
}

impl MockLedger {
    pub fn new(last_irreversible: BlockHeight) -> Self {
        Self { last_irreversible: AtomicU64::new(last_irreversible), ..Self::default() }
    }

    /// Move the irreversible height, as a live chain does between polls
    pub fn set_last_irreversible(&self, height: BlockHeight) {
        self.last_irreversible.store(height, Ordering::SeqCst);
    }

    /// Fail the next `n` chain property reads with a transient error
    pub fn fail_next_properties(&self, n: usize) {
        self.failing_properties.store(n, Ordering::SeqCst);
    }

    /// Answer `get_block(height)` with a body that is not JSON
    pub fn garble_block(&self, height: BlockHeight) {
        self.garbled_blocks.lock().unwrap().insert(height);
    }

    /// Answer every call about `name` with an invalid-params error
    pub fn reject_account(&self, name: &str) {
        self.rejected_accounts.lock().unwrap().insert(name.to_string());
    }

    pub fn set_block(&self, height: BlockHeight, block: Value) {
        self.blocks.lock().unwrap().insert(height, block);
    }

    pub fn fail_block_always(&self, height: BlockHeight) {
        self.failing_blocks.lock().unwrap().insert(height);
    }

    pub fn fail_account_always(&self, name: &str) {
        self.failing_accounts.lock().unwrap().insert(name.to_string());
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    /// Heights passed to `get_block`, in call order (retries included)
    pub fn fetched_heights(&self) -> Vec<BlockHeight> {
        self.fetched_heights.lock().unwrap().clone()
    }

    fn record(&self, method: &'static str) {
        *self.calls.lock().unwrap().entry(method).or_default() += 1;
    }

    fn check_account(&self, method: &'static str, name: &str) -> Result<(), TransportError> {
        if self.failing_accounts.lock().unwrap().contains(name) {
            return Err(TransportError::Rpc { method, code: -32000, message: "timeout".to_string() });
        }
        if self.rejected_accounts.lock().unwrap().contains(name) {
            return Err(TransportError::Rpc { method, code: INVALID_PARAMS, message: "Invalid parameters".to_string() });
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerApi for MockLedger {
    async fn get_dynamic_global_properties(&self) -> Result<Value, FetchError> {
        self.record("get_dynamic_global_properties");
        let failing = self.failing_properties.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(TransportError::Rpc {
                method: "condenser_api.get_dynamic_global_properties",
                code: -32000,
                message: "node busy".to_string(),
            }
            .into());
        }

        let last_irreversible = self.last_irreversible.load(Ordering::SeqCst);
        Ok(json!({
            "head_block_number": last_irreversible + 20,
            "last_irreversible_block_num": last_irreversible
        }))
    }

    async fn get_block(&self, height: BlockHeight) -> Result<Value, FetchError> {
        self.record("get_block");
        self.fetched_heights.lock().unwrap().push(height);
        if self.failing_blocks.lock().unwrap().contains(&height) {
            return Err(TransportError::Rpc {
                method: "condenser_api.get_block",
                code: -32003,
                message: "connection reset".to_string(),
            }
            .into());
        }
        if self.garbled_blocks.lock().unwrap().contains(&height) {
            return Err(DecodeError::Structural("`condenser_api.get_block` response is not a JSON-RPC object".to_string())
                .into());
        }
        Ok(self.blocks.lock().unwrap().get(&height).cloned().unwrap_or_else(empty_block))
    }

    async fn get_account_history(&self, account: &str, _from: i64, _limit: u32) -> Result<Value, FetchError> {
        self.record("get_account_history");
        self.check_account("condenser_api.get_account_history", account)?;
        Ok(json!([
            [0, { "trx_id": "trx0", "timestamp": "2016-03-24T16:05:00",
                  "op": ["account_create", { "creator": "steem", "new_account_name": account }] }]
        ]))
    }

    async fn get_account_votes(&self, account: &str) -> Result<Value, FetchError> {
        self.record("get_account_votes");
        self.check_account("condenser_api.get_account_votes", account)?;
        Ok(json!([
            { "authorperm": format!("steem/welcome-{}", account), "weight": 1, "rshares": "200",
              "percent": 10000, "time": "2016-03-25T00:00:00" }
        ]))
    }

    async fn get_accounts(&self, names: &[String]) -> Result<Value, FetchError> {
        self.record("get_accounts");
        for name in names {
            self.check_account("condenser_api.get_accounts", name)?;
        }
        let accounts: Vec<Value> = names
            .iter()
            .map(|name| {
                json!({
                    "name": name, "created": "2016-03-24T16:05:00", "mined": false, "post_count": 0,
                    "sbd_balance": "0.000 SBD", "witness_votes": [], "reputation": 0,
                    "last_post": "1970-01-01T00:00:00", "voting_power": 10000
                })
            })
            .collect();
        Ok(Value::Array(accounts))
    }
}

#[derive(Default)]
struct StoreState {
    batches: BTreeMap<BlockHeight, OperationBatch>,
    accounts: BTreeMap<String, EnrichedAccount>,
    /// (account, authorperm) -> vote, mirroring the `account_votes` key
    votes: BTreeMap<(String, String), VoteEntry>,
    write_order: Vec<BlockHeight>,
    attempts: usize,
    fail_next: usize,
    unavailable_until: Option<Instant>,
}

/// Operational store kept in memory, with switchable outages
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn fail_next_writes(&self, n: usize) {
        self.state.lock().unwrap().fail_next = n;
    }

    /// Reject every write for the next `outage`
    pub fn go_down_for(&self, outage: Duration) {
        self.state.lock().unwrap().unavailable_until = Some(Instant::now() + outage);
    }

    pub fn batch_count(&self) -> usize {
        self.state.lock().unwrap().batches.len()
    }

    pub fn account_names(&self) -> Vec<String> {
        self.state.lock().unwrap().accounts.keys().cloned().collect()
    }

    /// Stored votes of one account, ordered by authorperm
    pub fn votes_of(&self, account: &str) -> Vec<VoteEntry> {
        let state = self.state.lock().unwrap();
        state.votes.iter().filter(|((owner, _), _)| owner.as_str() == account).map(|(_, vote)| vote.clone()).collect()
    }

    pub fn vote_rows(&self) -> usize {
        self.state.lock().unwrap().votes.len()
    }

    /// Heights in the order their batches were committed
    pub fn write_order(&self) -> Vec<BlockHeight> {
        self.state.lock().unwrap().write_order.clone()
    }

    pub fn write_attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    fn check_available(state: &mut StoreState) -> Result<(), WriteError> {
        state.attempts += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(WriteError::Unavailable("store offline".to_string()));
        }
        if state.unavailable_until.is_some_and(|until| Instant::now() < until) {
            return Err(WriteError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OperationalStore for MemoryStore {
    async fn upsert_operation_batch(&self, batch: &OperationBatch) -> Result<(), WriteError> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&mut state)?;
        state.batches.insert(batch.height, batch.clone());
        state.write_order.push(batch.height);
        Ok(())
    }

    async fn upsert_account(&self, account: &EnrichedAccount) -> Result<(), WriteError> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&mut state)?;
        state.accounts.insert(account.record.name.clone(), account.clone());
        Ok(())
    }

    async fn upsert_votes(&self, record: &VoteRecord) -> Result<(), WriteError> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&mut state)?;
        let keep: HashSet<&str> = record.votes.iter().map(|v| v.authorperm.as_str()).collect();
        state.votes.retain(|(owner, authorperm), _| owner != &record.account || keep.contains(authorperm.as_str()));
        for vote in &record.votes {
            state.votes.insert((record.account.clone(), vote.authorperm.clone()), vote.clone());
        }
        Ok(())
    }
}

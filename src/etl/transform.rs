/// Transform Module
///
/// Schema-validated decoding of raw node payloads into typed records.
/// Shape problems (null block, missing arrays) are reported as structural errors,
/// bad individual fields are reported with their path.
use crate::error::DecodeError;
use crate::models::{
    AccountEvent, AccountHistoryEntry, AccountRecord, BlockHeight, BlockOperation, ChainProperties, OperationBatch,
    VoteEntry, VoteRecord,
};
use chrono::NaiveDateTime;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

use super::parsers::{parse_account_creation, parse_vote_fields};

/// Timestamp format used by the node (no timezone, implicitly UTC)
pub const NODE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Operation as encoded by the node: either `[kind, payload]` or `{type, value}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawOperation {
    Pair(String, Value),
    Tagged {
        #[serde(rename = "type")]
        kind: String,
        value: Value,
    },
}

impl RawOperation {
    fn into_parts(self) -> (String, Value) {
        match self {
            Self::Pair(kind, payload) => (kind, payload),
            Self::Tagged { kind, value } => {
                let kind = kind.strip_suffix("_operation").map(|k| k.to_string()).unwrap_or(kind);
                (kind, value)
            }
        }
    }
}

/// Integer that the node may emit as a JSON number or a numeric string
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(i64),
    Str(String),
}

impl IntOrString {
    fn to_i64(&self) -> Result<i64, String> {
        match self {
            Self::Int(n) => Ok(*n),
            Self::Str(s) => s.trim().parse().map_err(|e| format!("`{}` is not an integer: {}", s, e)),
        }
    }
}

/// Result of decoding one block
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBlock {
    pub batch: OperationBatch,
    pub new_accounts: Vec<AccountEvent>,
}

/// Parse a node timestamp (`2016-03-24T16:05:00`, trailing `Z` tolerated)
pub fn parse_node_time(raw: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(raw.trim_end_matches('Z'), NODE_TIME_FORMAT)
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, DecodeError> {
    value.as_object().ok_or_else(|| DecodeError::Structural(format!("{} is not an object (got {})", what, kind_of(value))))
}

fn as_array<'a>(value: &'a Value, what: &str) -> Result<&'a Vec<Value>, DecodeError> {
    value.as_array().ok_or_else(|| DecodeError::Structural(format!("{} is not an array (got {})", what, kind_of(value))))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join(ctx: &str, key: &str) -> String {
    if ctx.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", ctx, key)
    }
}

/// Decode a required field
fn required<T: DeserializeOwned>(obj: &Map<String, Value>, ctx: &str, key: &str) -> Result<T, DecodeError> {
    let value = obj.get(key).ok_or_else(|| DecodeError::field(join(ctx, key), "missing field"))?;
    T::deserialize(value).map_err(|e| DecodeError::field(join(ctx, key), e))
}

/// Decode an optional field; missing or null yields the default
fn optional<T: DeserializeOwned + Default>(obj: &Map<String, Value>, ctx: &str, key: &str) -> Result<T, DecodeError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => T::deserialize(value).map_err(|e| DecodeError::field(join(ctx, key), e)),
    }
}

fn required_time(obj: &Map<String, Value>, ctx: &str, key: &str) -> Result<NaiveDateTime, DecodeError> {
    let raw: String = required(obj, ctx, key)?;
    parse_node_time(&raw).map_err(|e| DecodeError::field(join(ctx, key), e))
}

fn optional_time(obj: &Map<String, Value>, ctx: &str, key: &str) -> Result<Option<NaiveDateTime>, DecodeError> {
    let raw: Option<String> = optional(obj, ctx, key)?;
    raw.map(|r| parse_node_time(&r).map_err(|e| DecodeError::field(join(ctx, key), e))).transpose()
}

fn int_field(obj: &Map<String, Value>, ctx: &str, key: &str) -> Result<i64, DecodeError> {
    let raw: Option<IntOrString> = optional(obj, ctx, key)?;
    match raw {
        Some(v) => v.to_i64().map_err(|e| DecodeError::field(join(ctx, key), e)),
        None => Ok(0),
    }
}

/// Decode the dynamic global properties
pub fn decode_chain_properties(raw: &Value) -> Result<ChainProperties, DecodeError> {
    let obj = as_object(raw, "dynamic global properties")?;
    Ok(ChainProperties {
        head_block_number: required(obj, "", "head_block_number")?,
        last_irreversible_block_num: required(obj, "", "last_irreversible_block_num")?,
    })
}

/// Decode a raw block into its operation batch and the distinct new accounts it introduces
pub fn decode_block(height: BlockHeight, raw: &Value) -> Result<DecodedBlock, DecodeError> {
    if raw.is_null() {
        return Err(DecodeError::Structural(format!("block {} not found (null payload)", height)));
    }
    let obj = as_object(raw, "block")?;

    let timestamp = required_time(obj, "", "timestamp")?;
    let transactions = match obj.get("transactions") {
        Some(value) => as_array(value, "block.transactions")?,
        None => return Err(DecodeError::Structural("block has no transactions array".to_string())),
    };
    let transaction_ids: Vec<String> = optional(obj, "", "transaction_ids")?;

    let mut operations = Vec::new();
    for (trx_index, tx) in transactions.iter().enumerate() {
        let ctx = format!("transactions[{}]", trx_index);
        let tx = as_object(tx, &ctx)?;
        let raw_ops: Vec<Value> = optional(tx, &ctx, "operations")?;

        // Older nodes omit `transaction_ids` and carry the id on the transaction itself
        let trx_id = transaction_ids
            .get(trx_index)
            .cloned()
            .or_else(|| tx.get("transaction_id").and_then(|v| v.as_str()).map(|s| s.to_string()));

        for (op_index, raw_op) in raw_ops.into_iter().enumerate() {
            let op = RawOperation::deserialize(raw_op)
                .map_err(|e| DecodeError::field(format!("{}.operations[{}]", ctx, op_index), e))?;
            let (kind, payload) = op.into_parts();
            operations.push(BlockOperation { trx_index, trx_id: trx_id.clone(), kind, payload });
        }
    }

    let batch = OperationBatch { height, timestamp, transaction_count: transactions.len(), operations };
    let new_accounts = scan_new_accounts(&batch);

    Ok(DecodedBlock { batch, new_accounts })
}

/// Collect the distinct account names created in a batch, in order of first appearance
pub fn scan_new_accounts(batch: &OperationBatch) -> Vec<AccountEvent> {
    let mut seen = HashSet::new();
    let mut events = Vec::new();

    for op in &batch.operations {
        if let Some(created) = parse_account_creation(op) {
            if seen.insert(created.new_account_name.clone()) {
                events.push(AccountEvent {
                    name: created.new_account_name,
                    height: batch.height,
                    trx_id: op.trx_id.clone(),
                    creator: created.creator,
                });
            }
        }
    }

    events
}

/// Decode the `get_accounts` response and pick out the snapshot for `name`
pub fn decode_account(name: &str, raw: &Value) -> Result<AccountRecord, DecodeError> {
    let accounts = as_array(raw, "accounts response")?;

    let (index, obj) = accounts
        .iter()
        .enumerate()
        .find(|(_, a)| a.get("name").and_then(|n| n.as_str()) == Some(name))
        .ok_or_else(|| DecodeError::Structural(format!("account `{}` not present in response", name)))?;
    let ctx = format!("[{}]", index);
    let obj = as_object(obj, &ctx)?;

    Ok(AccountRecord {
        name: name.to_string(),
        created: optional_time(obj, &ctx, "created")?,
        mined: optional(obj, &ctx, "mined")?,
        post_count: optional(obj, &ctx, "post_count")?,
        balance: optional(obj, &ctx, "sbd_balance")?,
        witness_votes: optional(obj, &ctx, "witness_votes")?,
        reputation: decode_reputation(obj.get("reputation")),
        last_post: optional_time(obj, &ctx, "last_post")?,
        voting_power: int_field(obj, &ctx, "voting_power")?,
    })
}

/// Reputation comes either as a scalar score or as a keyed object
fn decode_reputation(raw: Option<&Value>) -> BTreeMap<String, String> {
    let stringify = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    match raw {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), stringify(v))).collect(),
        Some(scalar) => BTreeMap::from([("score".to_string(), stringify(scalar))]),
    }
}

/// Decode the `get_account_history` response (`[[sequence, entry], ...]`)
pub fn decode_history(raw: &Value) -> Result<Vec<AccountHistoryEntry>, DecodeError> {
    let items = as_array(raw, "account history")?;
    let mut entries = Vec::with_capacity(items.len());

    for (index, item) in items.iter().enumerate() {
        let ctx = format!("[{}]", index);
        let (sequence, body) =
            <(u64, Value)>::deserialize(item).map_err(|e| DecodeError::field(ctx.clone(), e))?;
        let obj = as_object(&body, &ctx)?;

        let op: RawOperation = required(obj, &ctx, "op")?;
        let (op_type, op) = op.into_parts();
        let fields = parse_vote_fields(&op);

        entries.push(AccountHistoryEntry {
            sequence,
            trx_id: optional(obj, &ctx, "trx_id")?,
            op_type,
            op,
            voter: fields.voter,
            author: fields.author,
            permlink: fields.permlink,
            weight: fields.weight,
            timestamp: required_time(obj, &ctx, "timestamp")?,
        });
    }

    Ok(entries)
}

/// Decode the `get_account_votes` response
pub fn decode_votes(account: &str, raw: &Value) -> Result<VoteRecord, DecodeError> {
    let items = as_array(raw, "account votes")?;
    let mut votes = Vec::with_capacity(items.len());

    for (index, item) in items.iter().enumerate() {
        let ctx = format!("[{}]", index);
        let obj = as_object(item, &ctx)?;
        votes.push(VoteEntry {
            authorperm: required(obj, &ctx, "authorperm")?,
            weight: int_field(obj, &ctx, "weight")?,
            rshares: int_field(obj, &ctx, "rshares")?,
            percent: int_field(obj, &ctx, "percent")?,
            time: required_time(obj, &ctx, "time")?,
        });
    }

    Ok(VoteRecord { account: account.to_string(), votes })
}

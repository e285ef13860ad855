/// Load Module
///
/// Handles storing data into the sinks: the PostgreSQL operational store and the
/// relationship graph. Each sink role has a writer that drains its own queue.
use async_trait::async_trait;
use sqlx::types::Json;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::db::Database;
use crate::error::WriteError;
use crate::graph::{GraphStore, Quad};
use crate::models::{EnrichedAccount, OperationBatch, SinkMessage, SinkRole, VoteRecord};
use crate::pipeline::progress::{HeightTracker, PipelineStats};
use crate::retry::RetryPolicy;

/// Record-oriented store for operation batches, account snapshots and vote records.
/// Every write is an upsert on the natural key.
#[async_trait]
pub trait OperationalStore: Send + Sync {
    async fn upsert_operation_batch(&self, batch: &OperationBatch) -> Result<(), WriteError>;

    async fn upsert_account(&self, account: &EnrichedAccount) -> Result<(), WriteError>;

    /// Replace the stored vote set of `record.account` with `record.votes`
    async fn upsert_votes(&self, record: &VoteRecord) -> Result<(), WriteError>;
}

impl WriteError {
    /// Encoding problems and rejections repeat identically; everything else may heal
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(e) => {
                !matches!(e, sqlx::Error::Encode(_) | sqlx::Error::ColumnDecode { .. } | sqlx::Error::TypeNotFound { .. })
            }
            Self::Unavailable(_) => true,
            Self::Rejected(_) => false,
        }
    }
}

/// Insert or refresh the batch for one height
///
/// Uses UPSERT logic (ON CONFLICT DO UPDATE) so a height can be re-processed without
/// creating a second row.
pub async fn upsert_operation_batch(db: &Database, batch: &OperationBatch) -> Result<(), WriteError> {
    sqlx::query(
        r#"
        INSERT INTO operation_batches (height, block_time, transaction_count, operation_count, operations)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (height)
        DO UPDATE SET
            block_time = EXCLUDED.block_time,
            transaction_count = EXCLUDED.transaction_count,
            operation_count = EXCLUDED.operation_count,
            operations = EXCLUDED.operations,
            processed_at = NOW()
        "#,
    )
    .bind(batch.height as i64)
    .bind(batch.timestamp)
    .bind(batch.transaction_count as i32)
    .bind(batch.operations.len() as i32)
    .bind(Json(&batch.operations))
    .execute(db.pool())
    .await?;

    tracing::debug!(height = batch.height, "Upserted operation batch");
    Ok(())
}

/// Insert or refresh an account snapshot and its history within a database transaction
pub async fn upsert_account(db: &Database, account: &EnrichedAccount) -> Result<(), WriteError> {
    let record = &account.record;
    let mut tx = db.pool().begin().await?;

    sqlx::query(
        r#"
        INSERT INTO accounts (
            name,
            created,
            mined,
            post_count,
            balance,
            witness_votes,
            reputation,
            last_post,
            voting_power,
            discovered_height,
            discovered_trx_id,
            creator
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (name)
        DO UPDATE SET
            created = EXCLUDED.created,
            mined = EXCLUDED.mined,
            post_count = EXCLUDED.post_count,
            balance = EXCLUDED.balance,
            witness_votes = EXCLUDED.witness_votes,
            reputation = EXCLUDED.reputation,
            last_post = EXCLUDED.last_post,
            voting_power = EXCLUDED.voting_power,
            discovered_height = LEAST(accounts.discovered_height, EXCLUDED.discovered_height),
            updated_at = NOW()
        "#,
    )
    .bind(&record.name)
    .bind(record.created)
    .bind(record.mined)
    .bind(record.post_count as i64)
    .bind(&record.balance)
    .bind(Json(&record.witness_votes))
    .bind(Json(&record.reputation))
    .bind(record.last_post)
    .bind(record.voting_power)
    .bind(account.event.height as i64)
    .bind(&account.event.trx_id)
    .bind(&account.event.creator)
    .execute(&mut *tx)
    .await?;

    for entry in &account.history {
        sqlx::query(
            r#"
            INSERT INTO account_history (
                account_name, sequence, trx_id, op_type, op, voter, author, permlink, weight, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (account_name, sequence)
            DO UPDATE SET
                trx_id = EXCLUDED.trx_id,
                op_type = EXCLUDED.op_type,
                op = EXCLUDED.op,
                voter = EXCLUDED.voter,
                author = EXCLUDED.author,
                permlink = EXCLUDED.permlink,
                weight = EXCLUDED.weight,
                occurred_at = EXCLUDED.occurred_at
            "#,
        )
        .bind(&record.name)
        .bind(entry.sequence as i64)
        .bind(&entry.trx_id)
        .bind(&entry.op_type)
        .bind(Json(&entry.op))
        .bind(&entry.voter)
        .bind(&entry.author)
        .bind(&entry.permlink)
        .bind(entry.weight)
        .bind(entry.timestamp)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    tracing::debug!(account = %record.name, history = account.history.len(), "Upserted account");
    Ok(())
}

/// Sync an account's votes, keyed by (account, authorperm), in one transaction.
/// Votes the node no longer reports for the account are removed.
pub async fn upsert_votes(db: &Database, record: &VoteRecord) -> Result<(), WriteError> {
    let mut tx = db.pool().begin().await?;
    let authorperms: Vec<String> = record.votes.iter().map(|vote| vote.authorperm.clone()).collect();

    sqlx::query("DELETE FROM account_votes WHERE account_name = $1 AND NOT (authorperm = ANY($2))")
        .bind(&record.account)
        .bind(&authorperms)
        .execute(&mut *tx)
        .await?;

    for vote in &record.votes {
        sqlx::query(
            r#"
            INSERT INTO account_votes (account_name, authorperm, weight, rshares, percent, voted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (account_name, authorperm)
            DO UPDATE SET
                weight = EXCLUDED.weight,
                rshares = EXCLUDED.rshares,
                percent = EXCLUDED.percent,
                voted_at = EXCLUDED.voted_at,
                updated_at = NOW()
            "#,
        )
        .bind(&record.account)
        .bind(&vote.authorperm)
        .bind(vote.weight)
        .bind(vote.rshares)
        .bind(vote.percent)
        .bind(vote.time)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    tracing::debug!(account = %record.account, votes = record.votes.len(), "Upserted votes");
    Ok(())
}

#[async_trait]
impl OperationalStore for Database {
    async fn upsert_operation_batch(&self, batch: &OperationBatch) -> Result<(), WriteError> {
        upsert_operation_batch(self, batch).await
    }

    async fn upsert_account(&self, account: &EnrichedAccount) -> Result<(), WriteError> {
        upsert_account(self, account).await
    }

    async fn upsert_votes(&self, record: &VoteRecord) -> Result<(), WriteError> {
        upsert_votes(self, record).await
    }
}

/// Relationships materialised for an account's votes
pub fn vote_quads(record: &VoteRecord) -> Vec<Quad> {
    let mut quads = Vec::with_capacity(record.votes.len() * 2);
    for vote in &record.votes {
        quads.push(
            Quad::new(&record.account, "voted_on", &vote.authorperm)
                .with_label(vote.time.format(crate::etl::transform::NODE_TIME_FORMAT).to_string()),
        );
        quads.push(Quad::new(&vote.authorperm, "authored_by", vote.author()));
    }
    quads
}

/// A sink role's write path. Writers only accept their own message variant.
#[async_trait]
pub trait SinkWriter: Send + Sync {
    fn role(&self) -> SinkRole;

    async fn write(&self, message: &SinkMessage) -> Result<(), WriteError>;
}

fn wrong_variant(role: SinkRole, message: &SinkMessage) -> WriteError {
    WriteError::Rejected(format!("{} writer received a {} message", role, message.role()))
}

/// Bulk-inserts operation batches into the operational store
pub struct OperationsWriter<S> {
    store: S,
}

impl<S: OperationalStore> OperationsWriter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: OperationalStore> SinkWriter for OperationsWriter<S> {
    fn role(&self) -> SinkRole {
        SinkRole::Operations
    }

    async fn write(&self, message: &SinkMessage) -> Result<(), WriteError> {
        match message {
            SinkMessage::OperationBatch(batch) => self.store.upsert_operation_batch(batch).await,
            other => Err(wrong_variant(self.role(), other)),
        }
    }
}

/// Inserts or updates account snapshots and their history
pub struct AccountWriter<S> {
    store: S,
}

impl<S: OperationalStore> AccountWriter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: OperationalStore> SinkWriter for AccountWriter<S> {
    fn role(&self) -> SinkRole {
        SinkRole::Accounts
    }

    async fn write(&self, message: &SinkMessage) -> Result<(), WriteError> {
        match message {
            SinkMessage::Account(account) => self.store.upsert_account(account).await,
            other => Err(wrong_variant(self.role(), other)),
        }
    }
}

/// Stores vote records keyed by their owning account, then projects them into the graph
pub struct VoteWriter<S, G> {
    store: S,
    graph: Arc<G>,
    stats: Arc<PipelineStats>,
}

impl<S: OperationalStore, G: GraphStore> VoteWriter<S, G> {
    pub fn new(store: S, graph: Arc<G>, stats: Arc<PipelineStats>) -> Self {
        Self { store, graph, stats }
    }
}

#[async_trait]
impl<S: OperationalStore, G: GraphStore> SinkWriter for VoteWriter<S, G> {
    fn role(&self) -> SinkRole {
        SinkRole::Votes
    }

    async fn write(&self, message: &SinkMessage) -> Result<(), WriteError> {
        match message {
            SinkMessage::Votes(record) => {
                // Both writes are idempotent, so a retry after a graph failure is safe
                self.store.upsert_votes(record).await?;
                let added = self.graph.add_quads(&vote_quads(record)).await?;
                self.stats.quads_added.fetch_add(added as u64, std::sync::atomic::Ordering::Relaxed);
                Ok(())
            }
            other => Err(wrong_variant(self.role(), other)),
        }
    }
}

/// Drain one writer queue until every producer is gone.
///
/// Each message is retried per `policy`; once the budget is spent the message is dropped
/// with an alert so the queue keeps moving. Messages are committed in enqueue order.
pub async fn run_writer<W: SinkWriter>(
    writer: W,
    mut queue: mpsc::Receiver<SinkMessage>,
    policy: RetryPolicy,
    tracker: Arc<HeightTracker>,
    stats: Arc<PipelineStats>,
) {
    let role = writer.role();
    tracing::info!(role = %role, "Sink writer started");

    while let Some(message) = queue.recv().await {
        let key = message.key();
        let what = format!("{} write for {}", role, key);

        let result = policy.run(&what, WriteError::is_retryable, || writer.write(&message)).await;

        match (&message, result) {
            (SinkMessage::OperationBatch(batch), Ok(())) => {
                tracker.mark_written(batch.height);
                tracing::info!(height = batch.height, ops = batch.operations.len(), "Block written");
            }
            (SinkMessage::Account(_), Ok(())) => PipelineStats::incr(&stats.accounts_written),
            (SinkMessage::Votes(_), Ok(())) => PipelineStats::incr(&stats.votes_written),
            (_, Err(e)) => {
                stats.record_drop();
                tracing::error!(role = %role, key = %key, "ALERT: dropping message after retries: {}", e);
                if let SinkMessage::OperationBatch(batch) = &message {
                    tracker.mark_failed(batch.height);
                }
            }
        }
    }

    tracing::info!(role = %role, "Sink writer finished");
}

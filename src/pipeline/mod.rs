/// Pipeline Module
///
/// Orchestrates the ingestion pipeline: Height Source → Worker Pool → Sink Writers,
/// with a bounded queue between every tier. A single supervisor owns every task handle,
/// propagates shutdown and joins all of them before returning the run's statistics.
pub mod progress;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::etl::extract::Extractor;
use crate::etl::load::{run_writer, AccountWriter, OperationalStore, OperationsWriter, VoteWriter};
use crate::graph::GraphStore;
use crate::models::{BlockHeight, BlockTask, HeightState, SinkMessage, SinkRole};
use crate::retry::RetryPolicy;
use crate::rpc::LedgerApi;
use progress::{HeightTracker, PipelineReport, PipelineStats};

/// Configuration for pipeline execution
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub start_height: BlockHeight,
    /// Optional cap; the last irreversible height always bounds the range
    pub end_height: Option<BlockHeight>,
    pub workers: usize,
    /// Capacity of the task queue and of each writer queue
    pub queue_capacity: usize,
    pub fetch_retry: RetryPolicy,
    pub write_retry: RetryPolicy,
    pub history_limit: u32,
    /// Keep following the irreversible height after the initial range is dispatched
    pub continuous: bool,
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            start_height: 1,
            end_height: None,
            workers: 12,
            queue_capacity: 1024,
            fetch_retry: RetryPolicy::new(3, Duration::from_millis(500)),
            write_retry: RetryPolicy::new(6, Duration::from_millis(500)),
            history_limit: 1000,
            continuous: false,
            poll_interval: Duration::from_secs(3),
        }
    }
}

impl PipelineConfig {
    fn clamp_end(&self, last_irreversible: BlockHeight) -> BlockHeight {
        self.end_height.map_or(last_irreversible, |cap| cap.min(last_irreversible))
    }
}

/// Producer side of the three writer queues
#[derive(Clone)]
pub struct Outbox {
    operations: mpsc::Sender<SinkMessage>,
    accounts: mpsc::Sender<SinkMessage>,
    votes: mpsc::Sender<SinkMessage>,
}

/// Consumer side of the three writer queues
pub struct Inboxes {
    pub operations: mpsc::Receiver<SinkMessage>,
    pub accounts: mpsc::Receiver<SinkMessage>,
    pub votes: mpsc::Receiver<SinkMessage>,
}

impl Outbox {
    pub fn channel(capacity: usize) -> (Self, Inboxes) {
        let (operations, operations_rx) = mpsc::channel(capacity);
        let (accounts, accounts_rx) = mpsc::channel(capacity);
        let (votes, votes_rx) = mpsc::channel(capacity);

        (
            Self { operations, accounts, votes },
            Inboxes { operations: operations_rx, accounts: accounts_rx, votes: votes_rx },
        )
    }

    /// Route a message to its writer queue, waiting while the queue is full.
    ///
    /// Fails only when the writer for that role is gone.
    pub async fn send(&self, message: SinkMessage) -> Result<(), SinkRole> {
        let role = message.role();
        let queue = match role {
            SinkRole::Operations => &self.operations,
            SinkRole::Accounts => &self.accounts,
            SinkRole::Votes => &self.votes,
        };
        queue.send(message).await.map_err(|_| role)
    }
}

/// Enumerates heights into the task queue
struct HeightSource {
    extractor: Extractor,
    config: PipelineConfig,
}

impl HeightSource {
    async fn run(
        self,
        mut end: BlockHeight,
        tasks: mpsc::Sender<BlockTask>,
        tracker: Arc<HeightTracker>,
        cancel: CancellationToken,
    ) {
        let mut next = self.config.start_height;

        loop {
            while next <= end {
                if !tracker.dispatch(next) {
                    next += 1;
                    continue;
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracker.release(next);
                        tracing::info!(height = next, "Height source stopping on shutdown");
                        return;
                    }
                    sent = tasks.send(BlockTask { height: next }) => {
                        if sent.is_err() {
                            tracker.release(next);
                            tracing::warn!(height = next, "Task queue closed, height source stopping");
                            return;
                        }
                    }
                }
                next += 1;
            }

            let capped = self.config.end_height.is_some_and(|cap| next > cap);
            if !self.config.continuous || capped {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            match self.extractor.chain_properties().await {
                Ok(props) => end = self.config.clamp_end(props.last_irreversible_block_num),
                Err(e) => tracing::warn!(kind = e.kind(), "Could not refresh irreversible height: {}", e),
            }
        }

        tracing::info!(last = next.saturating_sub(1), "Height source finished");
    }
}

/// Everything one worker needs, cloned per worker
#[derive(Clone)]
struct Worker {
    id: usize,
    extractor: Extractor,
    outbox: Outbox,
    tracker: Arc<HeightTracker>,
    stats: Arc<PipelineStats>,
}

impl Worker {
    async fn run(self, tasks: Arc<Mutex<mpsc::Receiver<BlockTask>>>, cancel: CancellationToken) {
        tracing::debug!(worker = self.id, "Worker started");

        loop {
            let task = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                task = next_task(&tasks) => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            // No cancellation inside a task: it runs to completion or failure
            self.process_block(task).await;
        }

        tracing::debug!(worker = self.id, "Worker finished");
    }

    /// fetch → decode → extract accounts → forward, strictly in that order
    async fn process_block(&self, task: BlockTask) {
        let height = task.height;
        self.tracker.advance(height, HeightState::Fetching);

        let block = match self.extractor.extract_block(height).await {
            Ok(block) => block,
            Err(e) => {
                tracing::error!(height, kind = e.kind(), worker = self.id, "Block failed: {}", e);
                self.tracker.mark_failed(height);
                return;
            }
        };
        self.tracker.advance(height, HeightState::Decoded);

        self.tracker.advance(height, HeightState::ExtractingAccounts);
        let mut enriched = Vec::with_capacity(block.new_accounts.len());
        for event in &block.new_accounts {
            match self.extractor.enrich_account(event).await {
                Ok(pair) => enriched.push(pair),
                Err(e) => {
                    PipelineStats::incr(&self.stats.accounts_skipped);
                    tracing::warn!(height, account = %event.name, kind = e.kind(), "Account skipped: {}", e);
                }
            }
        }

        self.tracker.advance(height, HeightState::QueuedForWrite);
        if let Err(role) = self.outbox.send(SinkMessage::OperationBatch(block.batch)).await {
            tracing::error!(height, role = %role, "Writer queue closed, block not forwarded");
            self.tracker.mark_failed(height);
            return;
        }

        for (account, votes) in enriched {
            let name = account.record.name.clone();
            let forwarded = async {
                self.outbox.send(SinkMessage::Account(Box::new(account))).await?;
                self.outbox.send(SinkMessage::Votes(votes)).await
            };
            match forwarded.await {
                Ok(()) => PipelineStats::incr(&self.stats.accounts_forwarded),
                Err(role) => {
                    self.stats.record_drop();
                    tracing::error!(height, account = %name, role = %role, "Writer queue closed, account not forwarded");
                }
            }
        }

        tracing::debug!(height, worker = self.id, "Block forwarded");
    }
}

async fn next_task(tasks: &Mutex<mpsc::Receiver<BlockTask>>) -> Option<BlockTask> {
    tasks.lock().await.recv().await
}

/// Main ingestion pipeline
pub struct Pipeline<S, G> {
    extractor: Extractor,
    store: S,
    graph: Arc<G>,
    config: PipelineConfig,
}

impl<S, G> Pipeline<S, G>
where
    S: OperationalStore + Clone + 'static,
    G: GraphStore + 'static,
{
    /// Create a new pipeline instance
    pub fn new(api: Arc<dyn LedgerApi>, store: S, graph: Arc<G>, config: PipelineConfig) -> Self {
        let extractor = Extractor::new(api, config.fetch_retry, config.history_limit);
        Self { extractor, store, graph, config }
    }

    /// Run until the range is exhausted (or forever in continuous mode) or `cancel` fires.
    ///
    /// Only failing to read the initial irreversible height is an error; every per-item
    /// failure is contained and shows up in the report.
    pub async fn run(self, cancel: CancellationToken) -> Result<PipelineReport, FetchError> {
        let start_time = Instant::now();
        let config = self.config;

        let props = self.extractor.chain_properties().await?;
        let end = config.clamp_end(props.last_irreversible_block_num);

        tracing::info!(
            start = config.start_height,
            end,
            head = props.head_block_number,
            workers = config.workers,
            "Starting pipeline"
        );

        let tracker = Arc::new(HeightTracker::new());
        let stats = Arc::new(PipelineStats::new());
        let (task_tx, task_rx) = mpsc::channel(config.queue_capacity);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (outbox, inboxes) = Outbox::channel(config.queue_capacity);

        let mut tasks = JoinSet::new();

        tasks.spawn(run_writer(
            OperationsWriter::new(self.store.clone()),
            inboxes.operations,
            config.write_retry,
            tracker.clone(),
            stats.clone(),
        ));
        tasks.spawn(run_writer(
            AccountWriter::new(self.store.clone()),
            inboxes.accounts,
            config.write_retry,
            tracker.clone(),
            stats.clone(),
        ));
        tasks.spawn(run_writer(
            VoteWriter::new(self.store, self.graph, stats.clone()),
            inboxes.votes,
            config.write_retry,
            tracker.clone(),
            stats.clone(),
        ));

        for id in 1..=config.workers.max(1) {
            let worker = Worker {
                id,
                extractor: self.extractor.clone(),
                outbox: outbox.clone(),
                tracker: tracker.clone(),
                stats: stats.clone(),
            };
            tasks.spawn(worker.run(task_rx.clone(), cancel.clone()));
        }
        // Writers finish once the last worker drops its outbox
        drop(outbox);
        drop(task_rx);

        let source = HeightSource { extractor: self.extractor, config: config.clone() };
        tasks.spawn(source.run(end, task_tx, tracker.clone(), cancel.clone()));

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Pipeline task aborted: {}", e);
            }
        }

        let report_end = tracker.highest_dispatched().map_or(end, |highest| highest.max(end));
        let report = PipelineReport::collect(config.start_height, report_end, &tracker, &stats, start_time.elapsed());

        tracing::info!(
            written = report.blocks_written,
            failed = report.failed_heights.len(),
            unfinished = report.unfinished_heights.len(),
            "Pipeline finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use crate::testing::{batch, block_with_accounts, MemoryStore, MockLedger};

    fn config(start_height: BlockHeight, workers: usize, queue_capacity: usize) -> PipelineConfig {
        PipelineConfig {
            start_height,
            end_height: None,
            workers,
            queue_capacity,
            fetch_retry: RetryPolicy::new(3, Duration::from_millis(1)),
            write_retry: RetryPolicy::new(8, Duration::from_millis(10)),
            history_limit: 100,
            continuous: false,
            poll_interval: Duration::from_millis(10),
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn run(
        ledger: &Arc<MockLedger>,
        store: &MemoryStore,
        graph: &Arc<MemoryGraph>,
        config: PipelineConfig,
    ) -> PipelineReport {
        Pipeline::new(ledger.clone(), store.clone(), graph.clone(), config)
            .run(CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_block_with_two_new_accounts() {
        let ledger = Arc::new(MockLedger::new(100));
        ledger.set_block(100, block_with_accounts(&["alice", "bob", "alice"]));
        let store = MemoryStore::default();
        let graph = Arc::new(MemoryGraph::new());

        let report = run(&ledger, &store, &graph, config(100, 4, 8)).await;

        assert_eq!(report.blocks_written, 1);
        assert_eq!(report.accounts_forwarded, 2);
        assert_eq!(report.accounts_written, 2);
        assert_eq!(report.votes_written, 2);
        assert_eq!(store.batch_count(), 1);
        assert_eq!(store.account_names(), vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(graph.objects("alice", "voted_on"), vec!["steem/welcome-alice".to_string()]);
        let alice_votes = store.votes_of("alice");
        assert_eq!(alice_votes.len(), 1);
        assert_eq!((alice_votes[0].weight, alice_votes[0].rshares, alice_votes[0].percent), (1, 200, 10000));

        // Repeated names collapse before any enrichment call
        assert_eq!(ledger.calls("get_accounts"), 2);
        assert_eq!(ledger.calls("get_account_history"), 2);
        assert_eq!(ledger.calls("get_account_votes"), 2);

        // Re-ingesting the same height is idempotent
        let quads = graph.len();
        run(&ledger, &store, &graph, config(100, 4, 8)).await;
        assert_eq!(store.batch_count(), 1);
        assert_eq!(store.account_names().len(), 2);
        assert_eq!(store.vote_rows(), 2);
        assert_eq!(graph.len(), quads);
    }

    #[tokio::test]
    async fn test_failing_height_does_not_stall_the_rest() {
        let ledger = Arc::new(MockLedger::new(60));
        ledger.fail_block_always(50);
        let store = MemoryStore::default();
        let graph = Arc::new(MemoryGraph::new());

        let report = run(&ledger, &store, &graph, config(45, 3, 4)).await;

        assert_eq!(report.failed_heights, vec![50]);
        assert_eq!(report.blocks_dispatched, 16);
        assert_eq!(report.blocks_written, 15);
        assert!(report.unfinished_heights.is_empty());
        assert_eq!(store.batch_count(), 15);

        // 16 heights, height 50 attempted three times
        assert_eq!(ledger.calls("get_block"), 18);
        let fetched_50 = ledger.fetched_heights().iter().filter(|h| **h == 50).count();
        assert_eq!(fetched_50, 3);
    }

    #[tokio::test]
    async fn test_every_height_dispatched_exactly_once() {
        let ledger = Arc::new(MockLedger::new(200));
        ledger.set_block(7, serde_json::json!({ "timestamp": "not a time", "transactions": [] }));
        let store = MemoryStore::default();
        let graph = Arc::new(MemoryGraph::new());

        let report = run(&ledger, &store, &graph, config(1, 8, 4)).await;

        let mut fetched = ledger.fetched_heights();
        fetched.sort_unstable();
        assert_eq!(fetched, (1..=200).collect::<Vec<_>>());

        // Decode failures are not retried
        assert_eq!(report.failed_heights, vec![7]);
        assert_eq!(report.blocks_written + report.failed_heights.len() as u64, 200);
    }

    #[tokio::test]
    async fn test_failed_account_does_not_drop_others() {
        let ledger = Arc::new(MockLedger::new(10));
        ledger.set_block(10, block_with_accounts(&["alice", "bob", "carol"]));
        ledger.fail_account_always("bob");
        let store = MemoryStore::default();
        let graph = Arc::new(MemoryGraph::new());

        let report = run(&ledger, &store, &graph, config(10, 2, 4)).await;

        assert_eq!(report.blocks_written, 1);
        assert_eq!(report.accounts_skipped, 1);
        assert_eq!(store.account_names(), vec!["alice".to_string(), "carol".to_string()]);
        assert!(graph.quads_for_subject("bob").is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_is_ridden_out_in_order() {
        let ledger = Arc::new(MockLedger::new(30));
        let store = MemoryStore::default();
        store.go_down_for(Duration::from_millis(200));
        let graph = Arc::new(MemoryGraph::new());

        let report = run(&ledger, &store, &graph, config(1, 1, 2)).await;

        assert_eq!(report.blocks_written, 30);
        assert_eq!(report.messages_dropped, 0);
        assert!(!report.alert_raised);
        // One worker enqueues in height order and the writer drains FIFO
        assert_eq!(store.write_order(), (1..=30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_full_queue_blocks_producer() {
        let (outbox, mut inboxes) = Outbox::channel(2);

        outbox.send(SinkMessage::OperationBatch(batch(1))).await.unwrap();
        outbox.send(SinkMessage::OperationBatch(batch(2))).await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), outbox.send(SinkMessage::OperationBatch(batch(3)))).await;
        assert!(blocked.is_err());
        assert_eq!(inboxes.operations.len(), 2);

        assert_eq!(inboxes.operations.recv().await.unwrap().key(), "1");
        outbox.send(SinkMessage::OperationBatch(batch(3))).await.unwrap();
        assert_eq!(inboxes.operations.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_accounts_for_every_height() {
        let ledger = Arc::new(MockLedger::new(1_000_000));
        let store = MemoryStore::default();
        let graph = Arc::new(MemoryGraph::new());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let report = Pipeline::new(ledger.clone(), store.clone(), graph.clone(), config(1, 2, 4))
            .run(cancel)
            .await
            .unwrap();

        assert!(report.blocks_dispatched < 1_000_000);
        assert_eq!(
            report.blocks_written + report.failed_heights.len() as u64 + report.unfinished_heights.len() as u64,
            report.blocks_dispatched
        );
        // Everything a worker picked up was written
        assert_eq!(store.batch_count() as u64, report.blocks_written);
    }

    #[tokio::test]
    async fn test_end_height_caps_range() {
        let ledger = Arc::new(MockLedger::new(500));
        let store = MemoryStore::default();
        let graph = Arc::new(MemoryGraph::new());
        let mut config = config(1, 4, 8);
        config.end_height = Some(20);

        let report = run(&ledger, &store, &graph, config).await;

        assert_eq!(report.end_height, 20);
        assert_eq!(report.blocks_written, 20);
    }

    #[tokio::test]
    async fn test_continuous_follows_irreversible_height() {
        let ledger = Arc::new(MockLedger::new(5));
        let store = MemoryStore::default();
        let graph = Arc::new(MemoryGraph::new());
        let cancel = CancellationToken::new();
        let mut config = config(1, 2, 4);
        config.continuous = true;

        let driver = {
            let (ledger, store, cancel) = (ledger.clone(), store.clone(), cancel.clone());
            tokio::spawn(async move {
                wait_until(|| store.batch_count() == 5).await;
                // One whole poll fails; the source keeps going on the next tick
                ledger.fail_next_properties(3);
                ledger.set_last_irreversible(12);
                wait_until(|| store.batch_count() == 12).await;
                cancel.cancel();
            })
        };

        let report = tokio::time::timeout(
            Duration::from_secs(10),
            Pipeline::new(ledger.clone(), store.clone(), graph, config).run(cancel),
        )
        .await
        .expect("continuous run did not stop on shutdown")
        .unwrap();
        driver.await.unwrap();

        assert_eq!(report.blocks_written, 12);
        assert!(report.failed_heights.is_empty());
        assert!(report.unfinished_heights.is_empty());
        let mut fetched = ledger.fetched_heights();
        fetched.sort_unstable();
        assert_eq!(fetched, (1..=12).collect::<Vec<_>>());
        assert!(ledger.calls("get_dynamic_global_properties") >= 5);
    }

    #[tokio::test]
    async fn test_continuous_stops_at_end_height() {
        let ledger = Arc::new(MockLedger::new(5));
        let store = MemoryStore::default();
        let graph = Arc::new(MemoryGraph::new());
        let mut config = config(1, 2, 4);
        config.continuous = true;
        config.end_height = Some(8);

        let driver = {
            let (ledger, store) = (ledger.clone(), store.clone());
            tokio::spawn(async move {
                wait_until(|| store.batch_count() == 5).await;
                ledger.set_last_irreversible(20);
            })
        };

        // No shutdown signal: reaching the cap ends the run
        let report = tokio::time::timeout(Duration::from_secs(10), run(&ledger, &store, &graph, config))
            .await
            .expect("continuous run did not stop at end_height");
        driver.await.unwrap();

        assert_eq!(report.end_height, 8);
        assert_eq!(report.blocks_written, 8);
        let mut fetched = ledger.fetched_heights();
        fetched.sort_unstable();
        assert_eq!(fetched, (1..=8).collect::<Vec<_>>());
    }
}

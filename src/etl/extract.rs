/// Extract Module
///
/// Fetches blocks and per-account detail from the ledger node. Transient transport failures are
/// retried with backoff at the call site; decode failures and request-shape errors are returned
/// immediately.
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::error::FetchError;
use crate::etl::transform::{self, DecodedBlock};
use crate::models::{AccountEvent, BlockHeight, ChainProperties, EnrichedAccount, VoteRecord};
use crate::retry::RetryPolicy;
use crate::rpc::LedgerApi;

/// Fetches and decodes ledger data on behalf of the workers
#[derive(Clone)]
pub struct Extractor {
    api: Arc<dyn LedgerApi>,
    policy: RetryPolicy,
    history_limit: u32,
}

impl Extractor {
    pub fn new(api: Arc<dyn LedgerApi>, policy: RetryPolicy, history_limit: u32) -> Self {
        Self { api, policy, history_limit }
    }

    async fn fetch<F, Fut>(&self, what: String, call: F) -> Result<Value, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, FetchError>>,
    {
        self.policy.run(what, FetchError::is_retryable, call).await
    }

    /// Current chain properties; the last irreversible height bounds a processing pass
    pub async fn chain_properties(&self) -> Result<ChainProperties, FetchError> {
        let raw = self
            .fetch("get_dynamic_global_properties".to_string(), || self.api.get_dynamic_global_properties())
            .await?;
        Ok(transform::decode_chain_properties(&raw)?)
    }

    /// Fetch and decode a single block
    pub async fn extract_block(&self, height: BlockHeight) -> Result<DecodedBlock, FetchError> {
        tracing::debug!(height, "Fetching block");

        let raw = self.fetch(format!("get_block({})", height), || self.api.get_block(height)).await?;
        let block = transform::decode_block(height, &raw)?;

        tracing::debug!(
            height,
            ops = block.batch.operations.len(),
            new_accounts = block.new_accounts.len(),
            "Decoded block"
        );
        Ok(block)
    }

    /// Fetch history, votes and snapshot for a newly created account (one call each).
    ///
    /// Stops at the first failure; the caller skips only this account.
    pub async fn enrich_account(&self, event: &AccountEvent) -> Result<(EnrichedAccount, VoteRecord), FetchError> {
        let name = event.name.as_str();

        let raw_history = self
            .fetch(format!("get_account_history({})", name), || {
                self.api.get_account_history(name, -1, self.history_limit)
            })
            .await?;
        let history = transform::decode_history(&raw_history)?;

        let raw_votes = self.fetch(format!("get_account_votes({})", name), || self.api.get_account_votes(name)).await?;
        let votes = transform::decode_votes(name, &raw_votes)?;

        let names = [event.name.clone()];
        let raw_account = self.fetch(format!("get_accounts({})", name), || self.api.get_accounts(&names)).await?;
        let record = transform::decode_account(name, &raw_account)?;

        Ok((EnrichedAccount { event: event.clone(), record, history }, votes))
    }
}

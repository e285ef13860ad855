/// Steem Block Harvester
///
/// A concurrent ingestion pipeline that harvests blocks, new accounts and votes from a ledger
/// node into a PostgreSQL operational store and an in-memory relationship graph.
mod cli;
mod db;
mod error;
mod etl;
mod graph;
mod models;
mod pipeline;
mod retry;
mod rpc;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use db::Database;
use graph::MemoryGraph;
use pipeline::{progress::PipelineReport, Pipeline};
use rpc::{LedgerApi, SteemRpcClient};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    println!("🚀 Starting Steem Block Harvester...");

    let config = cli::Cli::parse().into_config().context("Invalid configuration")?;

    // Initialize RPC client
    let rpc_client = SteemRpcClient::new(config.rpc_endpoint.clone(), config.reconnect, config.rpc_timeout)
        .context("Failed to create RPC client")?;

    // Test RPC connection
    let raw_props =
        rpc_client.get_dynamic_global_properties().await.context("Failed to connect to ledger node")?;
    let props = etl::transform::decode_chain_properties(&raw_props).context("Unexpected chain properties")?;

    println!("✅ Connected to: {}", rpc_client.endpoint());
    println!("🎯 Head block: {}", format_number(props.head_block_number));
    println!("🔒 Last irreversible block: {}", format_number(props.last_irreversible_block_num));

    // Initialize database connection
    println!("\n💾 Connecting to PostgreSQL database...");
    let database = Database::new(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to PostgreSQL database")?;

    database.test_connection().await.context("Database connection test failed")?;

    println!("✅ Database connected successfully!");

    println!("📋 Running database migrations...");
    database.migrate().await.context("Failed to run database migrations")?;

    let graph = Arc::new(MemoryGraph::new());

    // Ctrl-C stops the height source; in-flight work drains before exit
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, draining in-flight work");
            shutdown.cancel();
        }
    });

    println!("\n🔍 Entering the block processing loop");
    println!("   👷 Workers: {}", config.pipeline.workers);
    println!("   📦 Queue capacity: {}", config.pipeline.queue_capacity);
    println!("   🔄 Max retries: {}", config.pipeline.fetch_retry.max_attempts);
    println!("   ⏳ Write retry budget: {:?}", config.pipeline.write_retry.total_budget());

    let pipeline = Pipeline::new(Arc::new(rpc_client), database, graph.clone(), config.pipeline);
    let report = pipeline.run(cancel).await.context("Pipeline execution failed")?;

    print_final_stats(&report, &graph);

    Ok(())
}

/// Print final statistics
fn print_final_stats(report: &PipelineReport, graph: &MemoryGraph) {
    println!("\n📊 Pipeline Statistics:");
    println!("   ⏱️  Total time: {:.2}s", report.elapsed_time.as_secs_f64());
    println!(
        "   📦 Blocks {}..{}: {} dispatched, {} written, {} failed",
        format_number(report.start_height),
        format_number(report.end_height),
        format_number(report.blocks_dispatched),
        format_number(report.blocks_written),
        report.failed_heights.len()
    );
    println!("   ✅ Success rate: {:.1}%", report.success_rate());
    println!(
        "   👤 Accounts: {} forwarded, {} written, {} skipped",
        report.accounts_forwarded, report.accounts_written, report.accounts_skipped
    );
    println!("   🗳️  Vote records written: {}", report.votes_written);
    if !graph.is_empty() {
        println!(
            "   🕸️  Graph: {} relationships, {} voting accounts",
            graph.len(),
            graph.subjects_with_predicate("voted_on").len()
        );
    }
    println!("   ⚡ Speed: {:.2} blocks/sec", report.blocks_per_second());

    if report.alert_raised {
        println!("\n🚨 {} messages were dropped after exhausting write retries", report.messages_dropped);
    }

    if !report.failed_heights.is_empty() {
        println!("\n❌ Failed heights (replay with --start_height/--end_height):");
        for height in report.failed_heights.iter().take(10) {
            println!("   {}", height);
        }
        if report.failed_heights.len() > 10 {
            println!("   ... and {} more", report.failed_heights.len() - 10);
        }
    }

    if !report.unfinished_heights.is_empty() {
        println!(
            "\n⏸️  {} heights were still queued at shutdown, first: {}",
            report.unfinished_heights.len(),
            report.unfinished_heights[0]
        );
    }
}

/// Format a number with thousand separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();

    for (count, c) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }

    result.chars().rev().collect()
}

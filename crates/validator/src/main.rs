//! Ledger Consensus Node
//!
//! Runs an in-process consensus cluster over the in-memory network, feeds it
//! a synthetic transaction workload through the transaction batcher, relays
//! finalized blocks to the other members through the message batcher and
//! reports metrics periodically.

use anyhow::Result;
use clap::Parser;
use ledger_consensus::{
    BatchDelivery, Block, ConsensusError, FinalitySink, LocalNetwork, Majority, MessageBatcher,
    MessageBuffer, MessageSink, OutboundMessage, QuorumPolicy, RaftNode, RaftNodeBuilder,
    Transaction, TransactionBatcher, TransactionSink, TxIndex, Weighted,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::ValidatorConfig;

/// Ledger consensus node
#[derive(Parser, Debug)]
#[command(name = "ledger-node")]
#[command(about = "Replicated-state consensus with pipelined block finality", long_about = None)]
struct Args {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of consensus nodes
    #[arg(long)]
    nodes: Option<usize>,

    /// Synthetic transactions per second
    #[arg(long)]
    tx_rate: Option<u64>,

    /// Transactions per block before a forced flush
    #[arg(long)]
    batch_size: Option<usize>,

    /// Batch window in milliseconds
    #[arg(long)]
    batch_window_ms: Option<u64>,

    /// Seconds between metrics reports
    #[arg(long)]
    metrics_interval: Option<u64>,

    /// Stop after this many seconds (runs until Ctrl+C when absent)
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<(ValidatorConfig, Option<u64>)> {
        let mut config = match &self.config {
            Some(path) => ValidatorConfig::load(path)?,
            None => ValidatorConfig::default(),
        };
        if let Some(nodes) = self.nodes {
            config.cluster_size = nodes;
        }
        if let Some(rate) = self.tx_rate {
            config.workload.tx_per_sec = rate;
        }
        if let Some(size) = self.batch_size {
            config.transactions.max_batch_size = size;
        }
        if let Some(window) = self.batch_window_ms {
            config.transactions.batch_window_ms = window;
        }
        if let Some(interval) = self.metrics_interval {
            config.metrics_interval_secs = interval;
        }
        Ok((config, self.duration_secs))
    }
}

/// Hands each batch to whichever node currently leads
struct LeaderRouter {
    nodes: Vec<Arc<RaftNode>>,
}

impl TransactionSink for LeaderRouter {
    fn deliver(&self, transaction_ids: Vec<String>) -> ledger_consensus::Result<BatchDelivery> {
        let leader = self
            .nodes
            .iter()
            .find(|n| n.is_leader())
            .ok_or(ConsensusError::NotLeader { leader_hint: None })?;
        leader.deliver(transaction_ids)
    }
}

/// Announces finalized blocks to every member except the proposer
struct BlockAnnouncer {
    members: Vec<String>,
    outbound: Arc<MessageBatcher>,
}

impl FinalitySink for BlockAnnouncer {
    fn block_finalized(&self, block: &Arc<Block>) {
        let payload = match serde_json::to_vec(&block.commit()) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to encode block {}: {}", block.block_number, e);
                return;
            }
        };
        for member in self.members.iter().filter(|m| **m != block.proposer_id) {
            // delivery outcome is counted by the batcher stats
            let _ = self.outbound.queue(OutboundMessage::new(
                member.as_str(),
                "block_finalized",
                payload.clone(),
            ));
        }
    }
}

/// Stands in for the delivery layer: decodes and counts what would be sent
#[derive(Default)]
struct LoggingSink {
    frames: AtomicU64,
}

impl MessageSink for LoggingSink {
    fn send_batch(&self, peer: &str, buffer: &MessageBuffer) -> ledger_consensus::Result<()> {
        let messages = OutboundMessage::decode_frames(&buffer.bytes)?;
        self.frames.fetch_add(messages.len() as u64, Ordering::Relaxed);
        tracing::debug!(
            "Relayed {} messages ({} bytes) to {}",
            messages.len(),
            buffer.bytes.len(),
            peer
        );
        Ok(())
    }
}

#[derive(Default)]
struct WorkloadStats {
    confirmed: AtomicU64,
    failed: AtomicU64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (config, duration_secs) = args.into_config()?;
    run(config, duration_secs).await
}

async fn run(config: ValidatorConfig, duration_secs: Option<u64>) -> Result<()> {
    let ids = config.node_ids();
    tracing::info!("Starting ledger consensus cluster");
    tracing::info!("  Nodes: {}", ids.join(", "));
    tracing::info!(
        "  Election timeout: {}-{}ms, heartbeat {}ms",
        config.consensus.election_timeout_min_ms,
        config.consensus.election_timeout_max_ms,
        config.consensus.heartbeat_interval_ms
    );
    tracing::info!(
        "  Batching: {} tx or {}ms",
        config.transactions.max_batch_size,
        config.transactions.batch_window_ms
    );
    tracing::info!("  Workload: {} tx/s", config.workload.tx_per_sec);

    let quorum: Arc<dyn QuorumPolicy> = match &config.weights {
        Some(weights) => Arc::new(Weighted::new(weights.clone())),
        None => Arc::new(Majority),
    };

    let link_stats = Arc::new(LoggingSink::default());
    let outbound = Arc::new(MessageBatcher::start(
        config.messages.clone(),
        link_stats.clone(),
    )?);
    let announcer = Arc::new(BlockAnnouncer {
        members: ids.clone(),
        outbound: outbound.clone(),
    });

    // One shared index: the batcher fills it, leader pipelines resolve from it
    let index = Arc::new(TxIndex::new());
    let network = LocalNetwork::new();
    let mut nodes = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let node = RaftNodeBuilder::new()
            .config(config.node_config(id, i))
            .quorum(quorum.clone())
            .network(network.clone())
            .pipeline(config.pipeline.clone())
            .resolver(index.clone())
            .finality_sink(index.clone())
            .finality_sink(announcer.clone())
            .build()?;
        node.start()?;
        nodes.push(node);
    }

    let router = Arc::new(LeaderRouter {
        nodes: nodes.clone(),
    });
    let batcher = Arc::new(TransactionBatcher::start(
        config.transactions.clone(),
        router,
        index.clone(),
    )?);

    // Workload: submit on a timer, hand receipts to a blocking watcher
    let workload_stats = Arc::new(WorkloadStats::default());
    let (receipt_tx, mut receipt_rx) = tokio::sync::mpsc::unbounded_channel();
    let workload = {
        let batcher = batcher.clone();
        let rate = config.workload.tx_per_sec;
        let payload_bytes = config.workload.payload_bytes;
        tokio::spawn(async move {
            if rate == 0 {
                return;
            }
            let per_tick = (rate / 100).max(1);
            let mut interval = tokio::time::interval(Duration::from_millis(10));
            let mut next_id = 0u64;
            loop {
                interval.tick().await;
                for _ in 0..per_tick {
                    next_id += 1;
                    let tx = Transaction::new(format!("tx-{}", next_id), vec![0u8; payload_bytes]);
                    if receipt_tx.send(batcher.submit(tx)).is_err() {
                        return;
                    }
                }
            }
        })
    };
    let watcher = {
        let stats = workload_stats.clone();
        tokio::task::spawn_blocking(move || {
            while let Some(handle) = receipt_rx.blocking_recv() {
                match handle.wait() {
                    Ok(Ok(_)) => stats.confirmed.fetch_add(1, Ordering::Relaxed),
                    Ok(Err(e)) => {
                        tracing::debug!("Transaction failed: {}", e);
                        stats.failed.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(_) => stats.failed.fetch_add(1, Ordering::Relaxed),
                };
            }
        })
    };

    // Periodic metrics
    let reporter = {
        let nodes = nodes.clone();
        let batcher = batcher.clone();
        let outbound = outbound.clone();
        let workload_stats = workload_stats.clone();
        let link_stats = link_stats.clone();
        let period = Duration::from_secs(config.metrics_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                report(&nodes, &batcher, &outbound, &workload_stats, &link_stats);
            }
        })
    };

    tracing::info!("Cluster running. Press Ctrl+C to stop.");
    match duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                result = tokio::signal::ctrl_c() => result?,
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    tracing::info!("Shutting down...");
    workload.abort();
    reporter.abort();
    let _ = workload.await;

    // Pending batches are flushed and every handle resolves before the nodes stop
    let drain = batcher.clone();
    tokio::task::spawn_blocking(move || drain.shutdown()).await?;
    watcher.await?;
    outbound.shutdown();
    for node in &nodes {
        node.shutdown();
    }
    report(&nodes, &batcher, &outbound, &workload_stats, &link_stats);

    tracing::info!("Cluster stopped at {}", chrono::Utc::now().to_rfc3339());
    Ok(())
}

fn report(
    nodes: &[Arc<RaftNode>],
    batcher: &TransactionBatcher,
    outbound: &MessageBatcher,
    workload: &WorkloadStats,
    links: &LoggingSink,
) {
    for node in nodes {
        let metrics = node.metrics();
        let state = &metrics.state;
        tracing::info!(
            "{}: {:?} term {} commit {} applied {} log {} (snapshot {})",
            state.node_id,
            state.role,
            state.current_term,
            state.commit_index,
            state.last_applied,
            state.log_size,
            state.snapshot_index
        );
        if let Some(pipeline) = metrics.pipeline.filter(|p| p.submitted > 0) {
            tracing::info!(
                "  pipeline: {} finalized, {} rejected, {} timed out, queues {}/{}/{}",
                pipeline.finalized,
                pipeline.rejected,
                pipeline.timed_out,
                pipeline.validation_queue,
                pipeline.aggregation_queue,
                pipeline.finalization_queue
            );
        }
    }

    let stats = batcher.stats();
    let pool = batcher.pool().stats();
    tracing::info!(
        "Transactions: {} confirmed, {} failed, {} batches (avg {:.1}), context pool hit rate {:.2}",
        workload.confirmed.load(Ordering::Relaxed),
        workload.failed.load(Ordering::Relaxed),
        stats.batches_flushed.load(Ordering::Relaxed),
        stats.avg_batch_size(),
        pool.hit_rate
    );

    let stats = outbound.stats();
    tracing::info!(
        "Relay: {} messages in {} batches ({} by size, {} by timer), {} frames delivered",
        stats.items_sent.load(Ordering::Relaxed),
        stats.batches_sent.load(Ordering::Relaxed),
        stats.flushes_by_size.load(Ordering::Relaxed),
        stats.flushes_by_timer.load(Ordering::Relaxed),
        links.frames.load(Ordering::Relaxed)
    );
}

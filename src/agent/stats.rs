use std::time::Duration;

use anyhow::Context;
use tokio::time::Instant;

use crate::agent::types::{
    NodeId, OutboundMessage, ReportedStats, StatsPayload, StatsSnapshot, SyncState,
};
use crate::core::clients::rpc::RpcClient;
use crate::core::utils::{convert_hex_to_number, parse_u64};

/// Gas price is reported in the chain's smallest unit
const GAS_PRICE_DECIMALS: u32 = 0;

/// One successful poll of the node's dynamic values
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSample {
    pub peers: u64,
    pub gas_price: f64,
    pub syncing: SyncState,
}

/// Samples peers, gas price and sync state and keeps uptime accounting.
pub struct StatsSampler {
    interval: Duration,
    last_fetch: Option<Instant>,
    last_sent: String,
    total_checks: u64,
    down_count: u64,
    fetch_failures: u64,
}

impl StatsSampler {
    pub fn new(interval: Duration, initial: &StatsSnapshot) -> Self {
        Self {
            interval,
            last_fetch: None,
            last_sent: serialize(initial),
            total_checks: 0,
            down_count: 0,
            fetch_failures: 0,
        }
    }

    pub fn down_count(&self) -> u64 {
        self.down_count
    }

    pub fn fetch_failures(&self) -> u64 {
        self.fetch_failures
    }

    pub fn uptime(&self) -> Option<f64> {
        compute_uptime(self.total_checks, self.down_count)
    }

    /// Decides whether a tick at `now` fetches. Every call moves the throttle window.
    pub fn should_sample(&mut self, now: Instant, connected: bool, forced: bool) -> bool {
        let elapsed = self.last_fetch.map(|last| now.saturating_duration_since(last));
        self.last_fetch = Some(now);
        connected && (forced || elapsed.map_or(true, |elapsed| elapsed >= self.interval))
    }

    /// Fetches peers, gas price and sync state concurrently.
    /// `None` means the node answered with a null peer count.
    pub async fn fetch(rpc: &dyn RpcClient) -> anyhow::Result<Option<NodeSample>> {
        let (peers, gas_price, syncing) = tokio::try_join!(
            rpc.get_peer_count(),
            rpc.get_gas_price(),
            rpc.get_syncing()
        )?;

        if peers.is_null() {
            return Ok(None);
        }
        Ok(Some(NodeSample {
            peers: parse_u64(&peers).context("Invalid net_peerCount")?,
            gas_price: convert_hex_to_number(&gas_price, GAS_PRICE_DECIMALS)
                .context("Invalid eth_gasPrice")?,
            syncing: SyncState::from_rpc(&syncing).context("Invalid eth_syncing")?,
        }))
    }

    pub fn apply_sample(&mut self, stats: &mut StatsSnapshot, sample: NodeSample) {
        stats.active = true;
        stats.peers = sample.peers;
        stats.gas_price = sample.gas_price;
        stats.syncing = sample.syncing;
        stats.mining = false;
        self.total_checks += 1;
        stats.uptime = self.uptime();
    }

    /// A finished check that did not yield a usable sample
    pub fn record_empty_check(&mut self) {
        self.total_checks += 1;
    }

    pub fn record_failure(&mut self) {
        self.fetch_failures += 1;
        self.total_checks += 1;
    }

    pub fn apply_sync(&self, stats: &mut StatsSnapshot, syncing: SyncState) {
        stats.syncing = syncing;
    }

    /// Resets the dynamic values after the node was found unusable and returns the
    /// forced update that reports it
    pub fn mark_inactive(&mut self, stats: &mut StatsSnapshot, id: &NodeId) -> OutboundMessage {
        stats.active = false;
        stats.peers = 0;
        stats.mining = false;
        stats.hashrate = 0;
        self.down_count += 1;
        stats.uptime = self.uptime();
        self.last_sent = serialize(stats);
        stats_message(stats, id)
    }

    /// Returns an update when the snapshot changed since the previous evaluation
    /// or when `force` is set
    pub fn stats_update(
        &mut self,
        stats: &StatsSnapshot,
        id: &NodeId,
        force: bool,
    ) -> Option<OutboundMessage> {
        let serialized = serialize(stats);
        let changed = serialized != self.last_sent;
        self.last_sent = serialized;
        (changed || force).then(|| stats_message(stats, id))
    }
}

fn stats_message(stats: &StatsSnapshot, id: &NodeId) -> OutboundMessage {
    OutboundMessage::Stats(StatsPayload {
        id: id.clone(),
        stats: ReportedStats::from(stats),
    })
}

fn serialize(stats: &StatsSnapshot) -> String {
    serde_json::to_string(stats).unwrap_or_default()
}

/// Percentage of checks that did not find the node down, clamped to `[0, 100]`
pub fn compute_uptime(total_checks: u64, down_count: u64) -> Option<f64> {
    if total_checks == 0 {
        return None;
    }
    let up = total_checks.saturating_sub(down_count) as f64;
    Some((up / total_checks as f64 * 100.0).clamp(0.0, 100.0))
}

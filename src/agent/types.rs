use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;

use crate::agent::channel::TransportEvent;
use crate::core::config::AppConfig;
use crate::core::utils::{node_id, parse_u64, QuantityError};

/// Correlation key of every outbound message, derived once from the display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn from_name(name: &str) -> Self {
        Self(node_id(name))
    }
}

impl Deref for NodeId {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static description of the monitored node sent in the handshake
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeIdentity {
    pub name: String,
    pub contact: String,
    pub coinbase: Option<String>,
    pub node: String,
    pub net: Option<String>,
    pub protocol: Option<String>,
    pub api: Option<String>,
    pub port: Option<String>,
    pub os: String,
    #[serde(rename = "os_v")]
    pub os_version: String,
    pub client: String,
    #[serde(rename = "canUpdateHistory")]
    pub can_update_history: bool,
}

impl NodeIdentity {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            name: config.general.name.clone(),
            contact: config.general.contact.clone(),
            coinbase: None,
            node: config.general.node_type.clone(),
            net: None,
            protocol: None,
            api: None,
            port: None,
            os: std::env::consts::OS.to_string(),
            os_version: os_release(),
            client: env!("CARGO_PKG_VERSION").to_string(),
            can_update_history: config.history.enabled,
        }
    }
}

fn os_release() -> String {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub starting_block: u64,
    pub current_block: u64,
    pub highest_block: u64,
    pub progress: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SyncState {
    #[default]
    NotSyncing,
    Syncing(SyncProgress),
}

impl SyncState {
    /// Derives the state from an `eth_syncing` result
    pub fn from_rpc(value: &Value) -> Result<Self, QuantityError> {
        match value {
            Value::Bool(false) | Value::Null => Ok(SyncState::NotSyncing),
            Value::Object(sync) => {
                let field = |name: &str| parse_u64(sync.get(name).unwrap_or(&Value::Null));
                let starting_block = field("startingBlock")?;
                let current_block = field("currentBlock")?;
                let highest_block = field("highestBlock")?;
                Ok(SyncState::Syncing(SyncProgress {
                    starting_block,
                    current_block,
                    highest_block,
                    progress: sync_progress(starting_block, current_block, highest_block),
                }))
            }
            other => Err(QuantityError::Invalid(other.to_string())),
        }
    }
}

fn sync_progress(starting: u64, current: u64, highest: u64) -> f64 {
    if highest <= starting {
        return 1.0;
    }
    let synced = current.saturating_sub(starting) as f64;
    let total = (highest - starting) as f64;
    synced / total
}

impl Serialize for SyncState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SyncState::NotSyncing => serializer.serialize_bool(false),
            SyncState::Syncing(progress) => progress.serialize(serializer),
        }
    }
}

/// Normalised block as sent to the collector
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRecord {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub miner: String,
    pub difficulty: u128,
    pub total_difficulty: u128,
    pub timestamp: u64,
    pub size: u64,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub nonce: String,
    pub transactions: Vec<String>,
    pub uncles: Vec<String>,
}

impl Default for BlockRecord {
    fn default() -> Self {
        Self {
            number: 0,
            hash: "?".to_string(),
            parent_hash: "?".to_string(),
            miner: "?".to_string(),
            difficulty: 0,
            total_difficulty: 0,
            timestamp: 0,
            size: 0,
            gas_used: 0,
            gas_limit: 0,
            nonce: String::new(),
            transactions: Vec::new(),
            uncles: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub active: bool,
    pub mining: bool,
    pub hashrate: u64,
    pub peers: u64,
    pub pending: u64,
    pub gas_price: f64,
    pub syncing: SyncState,
    /// `None` until the first check completes
    pub uptime: Option<f64>,
    pub block: BlockRecord,
}

/// Subset of the snapshot reported in `stats` messages
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedStats {
    pub active: bool,
    pub syncing: SyncState,
    pub mining: bool,
    pub hashrate: u64,
    pub peers: u64,
    pub gas_price: f64,
    pub uptime: Option<f64>,
}

impl From<&StatsSnapshot> for ReportedStats {
    fn from(stats: &StatsSnapshot) -> Self {
        Self {
            active: stats.active,
            syncing: stats.syncing.clone(),
            mining: stats.mining,
            hashrate: stats.hashrate,
            peers: stats.peers,
            gas_price: stats.gas_price,
            uptime: stats.uptime,
        }
    }
}

#[derive(Clone, PartialEq, Serialize)]
pub struct HelloPayload {
    pub id: NodeId,
    pub info: NodeIdentity,
    pub secret: String,
}

impl fmt::Debug for HelloPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelloPayload")
            .field("id", &self.id)
            .field("info", &self.info)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingPayload {
    pub id: NodeId,
    #[serde(rename = "clientTime")]
    pub client_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsPayload {
    pub id: NodeId,
    pub stats: ReportedStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockPayload {
    pub id: NodeId,
    pub block: BlockRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPayload {
    pub id: NodeId,
    /// Newest first, rejected blocks are sent as `false`
    #[serde(serialize_with = "serialize_history")]
    pub history: Vec<Option<BlockRecord>>,
}

fn serialize_history<S: Serializer>(
    history: &[Option<BlockRecord>],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeSeq;

    let mut seq = serializer.serialize_seq(Some(history.len()))?;
    for entry in history {
        match entry {
            Some(block) => seq.serialize_element(block)?,
            None => seq.serialize_element(&false)?,
        }
    }
    seq.end()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyPayload {
    pub id: NodeId,
    pub latency: i64,
}

/// Events sent to the collector
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Hello(HelloPayload),
    Ping(PingPayload),
    Stats(StatsPayload),
    Block(BlockPayload),
    History(HistoryPayload),
    Latency(LatencyPayload),
}

impl OutboundMessage {
    pub fn event(&self) -> &'static str {
        match self {
            OutboundMessage::Hello(_) => "hello",
            OutboundMessage::Ping(_) => "node-ping",
            OutboundMessage::Stats(_) => "stats",
            OutboundMessage::Block(_) => "block",
            OutboundMessage::History(_) => "history",
            OutboundMessage::Latency(_) => "latency",
        }
    }

    pub fn payload(&self) -> serde_json::Result<Value> {
        match self {
            OutboundMessage::Hello(p) => serde_json::to_value(p),
            OutboundMessage::Ping(p) => serde_json::to_value(p),
            OutboundMessage::Stats(p) => serde_json::to_value(p),
            OutboundMessage::Block(p) => serde_json::to_value(p),
            OutboundMessage::History(p) => serde_json::to_value(p),
            OutboundMessage::Latency(p) => serde_json::to_value(p),
        }
    }

    /// Wire frame in the primus-emit layout `{"emit": [event, payload]}`
    pub fn to_frame(&self) -> serde_json::Result<Value> {
        Ok(json!({ "emit": [self.event(), self.payload()?] }))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct HistoryRequest {
    #[serde(default)]
    pub list: Option<Vec<u64>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PongPayload {
    #[serde(rename = "clientTime")]
    pub client_time: i64,
}

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("Frame is not an emit frame: {0}")]
    Malformed(String),

    #[error("Unknown inbound event: {0}")]
    UnknownEvent(String),

    #[error("Invalid payload for {event}: {reason}")]
    InvalidPayload { event: String, reason: String },
}

/// Events received from the collector
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    History(HistoryRequest),
    Pong(PongPayload),
}

impl InboundMessage {
    pub fn from_frame(frame: &Value) -> Result<Self, FrameError> {
        let parts = frame
            .get("emit")
            .and_then(Value::as_array)
            .ok_or_else(|| FrameError::Malformed(frame.to_string()))?;
        let event = parts
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| FrameError::Malformed(frame.to_string()))?;
        let payload = parts.get(1).cloned().unwrap_or(Value::Null);

        let invalid = |e: serde_json::Error| FrameError::InvalidPayload {
            event: event.to_string(),
            reason: e.to_string(),
        };
        match event {
            "history" => {
                if payload.is_null() {
                    Ok(InboundMessage::History(HistoryRequest::default()))
                } else {
                    serde_json::from_value(payload)
                        .map(InboundMessage::History)
                        .map_err(invalid)
                }
            }
            "node-pong" => serde_json::from_value(payload)
                .map(InboundMessage::Pong)
                .map_err(invalid),
            other => Err(FrameError::UnknownEvent(other.to_string())),
        }
    }
}

/// Everything the node event loop reacts to. Timer and subscription events carry
/// the connection epoch they were produced under.
#[derive(Debug)]
pub enum AgentEvent {
    Connect { epoch: u64 },
    StatsTick { epoch: u64, at: Instant },
    PingTick { epoch: u64 },
    SyncTick { epoch: u64 },
    NewBlock { epoch: u64, number: u64 },
    ReferenceBlock { epoch: u64, number: u64 },
    Transport(TransportEvent),
}

impl AgentEvent {
    pub fn epoch(&self) -> Option<u64> {
        match self {
            AgentEvent::Connect { epoch }
            | AgentEvent::StatsTick { epoch, .. }
            | AgentEvent::PingTick { epoch }
            | AgentEvent::SyncTick { epoch }
            | AgentEvent::NewBlock { epoch, .. }
            | AgentEvent::ReferenceBlock { epoch, .. } => Some(*epoch),
            AgentEvent::Transport(_) => None,
        }
    }
}

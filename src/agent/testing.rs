use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;

use crate::agent::alert::{AlertSink, DivergenceAlert};
use crate::agent::channel::{CollectorTransport, TransportError};
use crate::agent::types::{AgentEvent, OutboundMessage};
use crate::core::clients::rpc::{RpcClient, RpcClientErrors};
use crate::core::utils::parse_u64;

pub fn raw_block(number: u64, hash: &str) -> Value {
    json!({
        "number": format!("0x{:x}", number),
        "hash": hash,
        "parentHash": "0xparent",
        "miner": "0xminer",
        "difficulty": "0x2",
        "totalDifficulty": "0x10",
        "timestamp": "0x5f5e100",
        "size": "0x220",
        "gasUsed": "0x0",
        "gasLimit": "0x1c9c380",
        "nonce": "0x0000000000000000",
        "transactions": [],
        "uncles": []
    })
}

/// Scripted RPC endpoint. Unscripted methods and blocks fail.
#[derive(Default)]
pub struct FakeRpc {
    responses: Mutex<HashMap<String, Value>>,
    blocks: Mutex<HashMap<u64, Value>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    calls_by_method: Mutex<HashMap<String, usize>>,
}

impl FakeRpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// A healthy node at `head`
    pub fn healthy(head: u64) -> Self {
        Self::new()
            .with("eth_blockNumber", json!(format!("0x{:x}", head)))
            .with("net_version", json!("56"))
            .with("web3_clientVersion", json!("Geth/v1.13.0"))
            .with("net_peerCount", json!("0x19"))
            .with("eth_gasPrice", json!("0x12a05f200"))
            .with("eth_syncing", json!(false))
            .with_block(head, raw_block(head, "0xhead"))
    }

    pub fn with(self, method: &str, value: Value) -> Self {
        self.set(method, value);
        self
    }

    pub fn with_block(self, number: u64, block: Value) -> Self {
        self.blocks.lock().unwrap().insert(number, block);
        self
    }

    pub fn failing(self, method: &str) -> Self {
        self.fail(method);
        self
    }

    pub fn set(&self, method: &str, value: Value) {
        self.responses.lock().unwrap().insert(method.to_string(), value);
    }

    pub fn fail(&self, method: &str) {
        self.failing.lock().unwrap().insert(method.to_string());
    }

    pub fn recover(&self, method: &str) {
        self.failing.lock().unwrap().remove(method);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_of(&self, method: &str) -> usize {
        self.calls_by_method
            .lock()
            .unwrap()
            .get(method)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RpcClient for FakeRpc {
    fn endpoint(&self) -> &str {
        "fake"
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value, RpcClientErrors> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls_by_method
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default() += 1;
        let unavailable = || RpcClientErrors::Rpc {
            method: method.to_string(),
            code: -32000,
            message: "unavailable".to_string(),
        };

        if self.failing.lock().unwrap().contains(method) {
            return Err(unavailable());
        }
        if method == "eth_getBlockByNumber" {
            let number = parse_u64(&params[0]).map_err(|_| unavailable())?;
            return self
                .blocks
                .lock()
                .unwrap()
                .get(&number)
                .cloned()
                .ok_or_else(unavailable);
        }
        self.responses
            .lock()
            .unwrap()
            .get(method)
            .cloned()
            .ok_or_else(unavailable)
    }
}

/// Collector transport that records every message it is asked to send
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundMessage>>,
    opened: AtomicUsize,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_events(&self) -> Vec<&'static str> {
        self.sent().iter().map(OutboundMessage::event).collect()
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl CollectorTransport for RecordingTransport {
    fn open(&self, _events: UnboundedSender<AgentEvent>) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn close(&self) {}
}

#[derive(Default)]
pub struct RecordingSink {
    alerts: Mutex<Vec<DivergenceAlert>>,
}

impl RecordingSink {
    pub fn alerts(&self) -> Vec<DivergenceAlert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn send_alert(&self, alert: &DivergenceAlert) -> anyhow::Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

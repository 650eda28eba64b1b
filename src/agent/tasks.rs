use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::debug;

use crate::agent::types::AgentEvent;
use crate::core::clients::rpc::RpcClient;
use crate::core::exporter::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Stats,
    Ping,
    Sync,
}

/// Turns a timer into an event for the node loop
pub struct TickTask {
    tick: Tick,
    epoch: u64,
    events: UnboundedSender<AgentEvent>,
}

impl TickTask {
    pub fn new(tick: Tick, epoch: u64, events: UnboundedSender<AgentEvent>) -> Self {
        Self { tick, epoch, events }
    }
}

#[async_trait]
impl Task for TickTask {
    async fn run(&mut self, deadline: Instant) -> anyhow::Result<()> {
        let epoch = self.epoch;
        let event = match self.tick {
            Tick::Stats => AgentEvent::StatsTick {
                epoch,
                at: deadline,
            },
            Tick::Ping => AgentEvent::PingTick { epoch },
            Tick::Sync => AgentEvent::SyncTick { epoch },
        };
        self.events
            .send(event)
            .map_err(|_| anyhow!("Event queue closed"))
    }

    fn name(&self) -> &'static str {
        match self.tick {
            Tick::Stats => "Stats Tick",
            Tick::Ping => "Ping Tick",
            Tick::Sync => "Sync Tick",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadSource {
    Monitored,
    Reference,
}

///
/// Polls `eth_blockNumber` and reports each head above the last one seen by this
/// poller. Stands in for a new-block subscription.
///
pub struct HeadPoller {
    rpc: Arc<dyn RpcClient>,
    source: HeadSource,
    epoch: u64,
    events: UnboundedSender<AgentEvent>,
    last_head: Option<u64>,
}

impl HeadPoller {
    pub fn new(
        rpc: Arc<dyn RpcClient>,
        source: HeadSource,
        epoch: u64,
        events: UnboundedSender<AgentEvent>,
    ) -> Self {
        Self {
            rpc,
            source,
            epoch,
            events,
            last_head: None,
        }
    }
}

#[async_trait]
impl Task for HeadPoller {
    async fn run(&mut self, _deadline: Instant) -> anyhow::Result<()> {
        let head = self
            .rpc
            .get_block_number()
            .await
            .with_context(|| format!("Could not poll head of {}", self.rpc.endpoint()))?;

        if self.last_head.is_some_and(|last| head <= last) {
            return Ok(());
        }
        self.last_head = Some(head);
        debug!("({}) New head {}", self.name(), head);

        let event = match self.source {
            HeadSource::Monitored => AgentEvent::NewBlock {
                epoch: self.epoch,
                number: head,
            },
            HeadSource::Reference => AgentEvent::ReferenceBlock {
                epoch: self.epoch,
                number: head,
            },
        };
        self.events
            .send(event)
            .map_err(|_| anyhow!("Event queue closed"))
    }

    fn name(&self) -> &'static str {
        match self.source {
            HeadSource::Monitored => "Block Poller",
            HeadSource::Reference => "Reference Poller",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::FakeRpc;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_tick_task_tags_epoch() {
        let (tx, mut rx) = unbounded_channel();
        let mut task = TickTask::new(Tick::Sync, 7, tx);
        task.run(Instant::now()).await.unwrap();
        assert!(matches!(rx.try_recv(), Ok(AgentEvent::SyncTick { epoch: 7 })));
        assert_eq!(task.name(), "Sync Tick");
    }

    #[tokio::test]
    async fn test_stats_tick_carries_deadline() {
        let (tx, mut rx) = unbounded_channel();
        let mut task = TickTask::new(Tick::Stats, 3, tx);
        let deadline = Instant::now() - Duration::from_millis(7);
        task.run(deadline).await.unwrap();
        match rx.try_recv() {
            Ok(AgentEvent::StatsTick { epoch: 3, at }) => assert_eq!(at, deadline),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tick_task_fails_when_queue_closed() {
        let (tx, rx) = unbounded_channel();
        drop(rx);
        let mut task = TickTask::new(Tick::Ping, 0, tx);
        assert!(task.run(Instant::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_head_poller_reports_increasing_heads() {
        let rpc = Arc::new(FakeRpc::new().with("eth_blockNumber", json!("0x64")));
        let (tx, mut rx) = unbounded_channel();
        let mut poller = HeadPoller::new(rpc.clone(), HeadSource::Monitored, 2, tx);

        poller.run(Instant::now()).await.unwrap();
        poller.run(Instant::now()).await.unwrap();
        rpc.set("eth_blockNumber", json!("0x63"));
        poller.run(Instant::now()).await.unwrap();
        rpc.set("eth_blockNumber", json!("0x66"));
        poller.run(Instant::now()).await.unwrap();

        assert!(matches!(
            rx.try_recv(),
            Ok(AgentEvent::NewBlock { epoch: 2, number: 100 })
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(AgentEvent::NewBlock { epoch: 2, number: 102 })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reference_poller() {
        let rpc = Arc::new(FakeRpc::new().with("eth_blockNumber", json!("0x3e8")));
        let (tx, mut rx) = unbounded_channel();
        let mut poller = HeadPoller::new(rpc, HeadSource::Reference, 0, tx);
        poller.run(Instant::now()).await.unwrap();
        assert!(matches!(
            rx.try_recv(),
            Ok(AgentEvent::ReferenceBlock { number: 1000, .. })
        ));
    }

    #[tokio::test]
    async fn test_head_poller_propagates_rpc_errors() {
        let rpc = Arc::new(FakeRpc::new().failing("eth_blockNumber"));
        let (tx, _rx) = unbounded_channel();
        let mut poller = HeadPoller::new(rpc, HeadSource::Monitored, 0, tx);
        assert!(poller.run(Instant::now()).await.is_err());
    }
}

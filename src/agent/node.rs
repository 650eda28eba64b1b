use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::alert::{divergence, AlertSink, AlertThrottle};
use crate::agent::channel::{
    latency, ChannelAction, CollectorTransport, OutboundChannel, TransportEvent,
};
use crate::agent::stats::StatsSampler;
use crate::agent::supervisor::{ConnectionSupervisor, ProbeOutcome};
use crate::agent::tasks::{HeadPoller, HeadSource, Tick, TickTask};
use crate::agent::types::{
    AgentEvent, BlockPayload, HelloPayload, HistoryPayload, InboundMessage, LatencyPayload,
    NodeId, NodeIdentity, OutboundMessage, PingPayload, StatsSnapshot, SyncState,
};
use crate::agent::watcher::{BlockOutcome, BlockWatcher};
use crate::core::app_context::AppContext;
use crate::core::clients::rpc::RpcClient;
use crate::core::exporter::{ExporterTask, TaskRunner};
use crate::core::metrics::exporter_metrics::{
    AGENT_ALERTS_SENT, AGENT_NODE_ACTIVE, AGENT_NODE_GAS_PRICE, AGENT_NODE_HEAD,
    AGENT_NODE_LATENCY, AGENT_NODE_PEERS, AGENT_NODE_UPTIME, AGENT_REFERENCE_DIVERGENCE,
    AGENT_REFERENCE_HEAD, AGENT_RPC_CONNECTION_ABORTED, AGENT_RPC_RECONNECTS,
    AGENT_STATS_FETCH_FAILURES,
};
use crate::core::utils::now_millis;

#[derive(Debug, Error, PartialEq)]
pub enum AgentError {
    #[error("RPC connection failed {attempts} times, aborting")]
    ConnectionAborted { attempts: u32 },

    #[error("Agent event queue closed")]
    QueueClosed,
}

struct Alerting {
    throttle: AlertThrottle,
    sink: Arc<dyn AlertSink>,
}

///
/// The monitoring agent for one node. All state lives here and is only touched from
/// the event loop in [`Node::run`]; timers, head pollers and the collector transport
/// feed it through a single queue. Events produced under an earlier connection
/// epoch are dropped.
///
pub struct Node {
    context: Arc<AppContext>,
    identity: NodeIdentity,
    rpc: Arc<dyn RpcClient>,
    reference: Option<Arc<dyn RpcClient>>,
    supervisor: ConnectionSupervisor,
    sampler: StatsSampler,
    watcher: BlockWatcher,
    channel: OutboundChannel,
    alerting: Option<Alerting>,
    stats: StatsSnapshot,
    sync_token: Option<CancellationToken>,
    events_tx: UnboundedSender<AgentEvent>,
    events_rx: Option<UnboundedReceiver<AgentEvent>>,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(
        context: Arc<AppContext>,
        rpc: Arc<dyn RpcClient>,
        reference: Option<Arc<dyn RpcClient>>,
        transport: Arc<dyn CollectorTransport>,
        alert_sink: Option<Arc<dyn AlertSink>>,
        shutdown: CancellationToken,
    ) -> Self {
        let config = &context.config;
        let stats = StatsSnapshot::default();
        let (events_tx, events_rx) = unbounded_channel();

        // alerts need something to compare against
        let alerting = match (&reference, alert_sink) {
            (Some(_), Some(sink)) => Some(Alerting {
                throttle: AlertThrottle::new(config.alerting.threshold, config.alerting.every),
                sink,
            }),
            _ => None,
        };
        let identity = NodeIdentity::from_config(config);
        let supervisor = ConnectionSupervisor::new(
            config.connection.max_attempts,
            config.connection.base_delay(),
            shutdown.clone(),
        );
        let sampler = StatsSampler::new(config.intervals.update(), &stats);
        let watcher = BlockWatcher::new(
            config.history.max_blocks_history,
            config.history.max_history_update,
            config.history.enabled,
        );

        Self {
            identity,
            supervisor,
            sampler,
            watcher,
            channel: OutboundChannel::new(transport),
            alerting,
            stats,
            sync_token: None,
            rpc,
            reference,
            events_tx,
            events_rx: Some(events_rx),
            shutdown,
            context,
        }
    }

    fn id(&self) -> &NodeId {
        &self.context.node_id
    }

    pub fn stats(&self) -> &StatsSnapshot {
        &self.stats
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    ///
    /// Runs until shutdown is requested or the RPC connection is given up.
    ///
    pub async fn run(mut self) -> Result<(), AgentError> {
        let mut events = self.events_rx.take().ok_or(AgentError::QueueClosed)?;
        let shutdown = self.shutdown.clone();
        self.start();

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("(Node) Shutdown requested");
                    break Ok(());
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        break Err(AgentError::QueueClosed);
                    };
                    if let Err(e) = self.handle(event).await {
                        break Err(e);
                    }
                }
            }
        };

        self.stop();
        result
    }

    fn start(&mut self) {
        info!(
            "(Node) Starting agent for {} against {}",
            self.identity.name,
            self.rpc.endpoint()
        );
        self.start_reference_watch();
        self.enqueue(AgentEvent::Connect {
            epoch: self.supervisor.epoch(),
        });
    }

    fn stop(&mut self) {
        self.supervisor.shutdown();
        self.channel.close();
    }

    fn enqueue(&self, event: AgentEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("(Node) Event queue closed");
        }
    }

    pub async fn handle(&mut self, event: AgentEvent) -> Result<(), AgentError> {
        if let Some(epoch) = event.epoch() {
            if !self.supervisor.is_current(epoch) {
                debug!(
                    "(Node) Dropping {:?} from epoch {}, current is {}",
                    event,
                    epoch,
                    self.supervisor.epoch()
                );
                return Ok(());
            }
        }

        match event {
            AgentEvent::Connect { .. } => self.connect().await?,
            AgentEvent::StatsTick { at, .. } => self.get_stats(at, false).await,
            AgentEvent::PingTick { .. } => self.ping().await,
            AgentEvent::SyncTick { .. } => self.update_sync().await,
            AgentEvent::NewBlock { number, .. } => self.on_new_block(number).await,
            AgentEvent::ReferenceBlock { number, .. } => self.on_reference_block(number).await,
            AgentEvent::Transport(event) => self.on_transport_event(event).await,
        }
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), AgentError> {
        if !self.supervisor.begin_attempt() {
            return Ok(());
        }
        info!("(Supervisor) Checking RPC connection to {}", self.rpc.endpoint());

        let probe = match self.rpc.get_block_number().await {
            Ok(head) => Some(head),
            Err(e) => {
                warn!("(Supervisor) RPC probe failed: {}", e);
                None
            }
        };

        match self.supervisor.on_probe(probe) {
            ProbeOutcome::Connected => {
                info!("(Supervisor) RPC connected");
                AGENT_RPC_CONNECTION_ABORTED.set(0);
                self.init().await;
            }
            ProbeOutcome::Retry { attempt, delay } => {
                error!("(Supervisor) RPC connection attempt #{} failed", attempt);
                error!("(Supervisor) Trying again in {} ms", delay.as_millis());
                self.schedule_connect(delay);
            }
            ProbeOutcome::Abort { attempts } => {
                error!(
                    "(Supervisor) RPC connection failed {} times. Aborting...",
                    attempts
                );
                AGENT_RPC_CONNECTION_ABORTED.set(1);
                return Err(AgentError::ConnectionAborted { attempts });
            }
            ProbeOutcome::Stale => {}
        }
        Ok(())
    }

    fn schedule_connect(&self, delay: Duration) {
        let token = self.supervisor.token();
        let epoch = self.supervisor.epoch();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(AgentEvent::Connect { epoch });
                }
            }
        });
    }

    async fn init(&mut self) {
        // stats ticks are scheduled from after this instant
        let started = Instant::now();
        self.get_info().await;
        self.channel.open(self.events_tx.clone());
        self.set_watches();
        self.get_stats(started, true).await;
    }

    async fn get_info(&mut self) {
        info!("(Node) Getting info");
        match tokio::try_join!(self.rpc.get_network(), self.rpc.get_client_version()) {
            Ok((net, api)) => {
                self.identity.net = Some(net);
                self.identity.api = Some(api);
                info!(
                    "(Node) Got info: net {:?}, client {:?}",
                    self.identity.net, self.identity.api
                );
            }
            Err(e) => error!("(Node) Couldn't get version: {}", e),
        }
    }

    fn set_watches(&mut self) {
        let config = &self.context.config;
        let epoch = self.supervisor.epoch();
        let sync_token = self.supervisor.token().child_token();
        self.sync_token = Some(sync_token.clone());

        let runner = TaskRunner::new(self.supervisor.token())
            .add_task(ExporterTask::new(
                Box::new(TickTask::new(Tick::Stats, epoch, self.events_tx.clone())),
                config.intervals.update(),
            ))
            .add_task(ExporterTask::new(
                Box::new(TickTask::new(Tick::Ping, epoch, self.events_tx.clone())),
                config.intervals.ping(),
            ))
            .add_task(
                ExporterTask::new(
                    Box::new(TickTask::new(Tick::Sync, epoch, self.events_tx.clone())),
                    config.intervals.sync(),
                )
                .with_token(sync_token),
            )
            .add_task(ExporterTask::new(
                Box::new(HeadPoller::new(
                    self.rpc.clone(),
                    HeadSource::Monitored,
                    epoch,
                    self.events_tx.clone(),
                )),
                config.rpc.block_poll_interval(),
            ));
        debug!("(Node) Starting {} watches for epoch {}", runner.number_of_tasks(), epoch);
        runner.start();
    }

    fn start_reference_watch(&self) {
        let Some(reference) = &self.reference else {
            return;
        };
        info!("(Node) Watching reference RPC {}", reference.endpoint());
        TaskRunner::new(self.supervisor.token())
            .add_task(ExporterTask::new(
                Box::new(HeadPoller::new(
                    reference.clone(),
                    HeadSource::Reference,
                    self.supervisor.epoch(),
                    self.events_tx.clone(),
                )),
                self.context.config.rpc.block_poll_interval(),
            ))
            .start();
    }

    async fn get_stats(&mut self, at: Instant, forced: bool) {
        if !self
            .sampler
            .should_sample(at, self.supervisor.is_connected(), forced)
        {
            return;
        }
        debug!("(Stats) Getting stats, forced: {}", forced);

        match StatsSampler::fetch(self.rpc.as_ref()).await {
            Ok(Some(sample)) => {
                self.sampler.apply_sample(&mut self.stats, sample);
                self.publish_stats_metrics();
                if let Some(update) =
                    self.sampler
                        .stats_update(&self.stats, &self.context.node_id, forced)
                {
                    debug!(
                        "(Stats) Sending {} update",
                        if forced { "forced" } else { "changed" }
                    );
                    self.channel.emit(&update).await;
                }
            }
            Ok(None) => {
                warn!("(Stats) Node reported no peer count");
                self.sampler.record_empty_check();
                self.mark_inactive().await;
            }
            Err(e) => {
                error!("(Stats) getStats error: {:#}", e);
                self.sampler.record_failure();
                AGENT_STATS_FETCH_FAILURES.inc();
                self.mark_inactive().await;
            }
        }
    }

    fn publish_stats_metrics(&self) {
        AGENT_NODE_ACTIVE.set(i64::from(self.stats.active));
        AGENT_NODE_PEERS.set(self.stats.peers as i64);
        AGENT_NODE_GAS_PRICE.set(self.stats.gas_price);
        if let Some(uptime) = self.stats.uptime {
            AGENT_NODE_UPTIME.set(uptime);
        }
    }

    /// Reports the node as down and starts over with a fresh connection
    async fn mark_inactive(&mut self) {
        let id = self.context.node_id.clone();
        let update = self.sampler.mark_inactive(&mut self.stats, &id);
        self.publish_stats_metrics();
        self.channel.emit(&update).await;
        self.reconnect();
    }

    fn reconnect(&mut self) {
        info!("(Supervisor) Reconnecting RPC");
        if !self.supervisor.reset() {
            warn!("(Supervisor) Connection was given up, not reconnecting");
            return;
        }
        self.sync_token = None;
        AGENT_RPC_RECONNECTS.inc();
        self.start_reference_watch();
        self.enqueue(AgentEvent::Connect {
            epoch: self.supervisor.epoch(),
        });
    }

    async fn ping(&mut self) {
        let ping = OutboundMessage::Ping(PingPayload {
            id: self.id().clone(),
            client_time: now_millis(),
        });
        self.channel.emit(&ping).await;
    }

    async fn update_sync(&mut self) {
        if !self.supervisor.is_connected() {
            return;
        }
        let state = match self.rpc.get_syncing().await {
            Ok(raw) => SyncState::from_rpc(&raw).map_err(anyhow::Error::from),
            Err(e) => Err(anyhow::Error::from(e)),
        };

        match state {
            Ok(SyncState::NotSyncing) => {
                info!("(Sync) Sync stopped");
                self.sampler.apply_sync(&mut self.stats, SyncState::NotSyncing);
                if let Some(token) = self.sync_token.take() {
                    token.cancel();
                }
            }
            Ok(syncing) => {
                info!("(Sync) Sync update: {:?}", syncing);
                self.sampler.apply_sync(&mut self.stats, syncing);
            }
            Err(e) => {
                error!("(Sync) Sync error: {:#}", e);
                self.sampler.apply_sync(&mut self.stats, SyncState::NotSyncing);
            }
        }
    }

    async fn on_new_block(&mut self, number: u64) {
        if !self.supervisor.is_connected() {
            return;
        }
        debug!("(Block Watcher) Got new head {}", number);

        let raw = match self.rpc.get_block_by_number(number, true).await {
            Ok(raw) => raw,
            Err(e) => {
                error!("(Block Watcher) Couldn't fetch block {}: {}", number, e);
                self.mark_inactive().await;
                return;
            }
        };

        match self.watcher.accept(&mut self.stats, &raw) {
            BlockOutcome::Invalid(e) => {
                error!("(Block Watcher) Got bad block {}: {}", number, e);
            }
            BlockOutcome::Duplicate(number) => {
                warn!("(Block Watcher) Got same block {}", number);
            }
            BlockOutcome::Applied {
                number,
                replaced,
                backfill,
            } => {
                if replaced {
                    warn!("(Block Watcher) Block {} changed, updating block", number);
                }
                info!("(Block Watcher) Got block {}", number);
                AGENT_NODE_HEAD.set(self.watcher.last_seen_head().unwrap_or(number) as i64);

                let update = OutboundMessage::Block(BlockPayload {
                    id: self.id().clone(),
                    block: self.stats.block.clone(),
                });
                self.channel.emit(&update).await;

                if let Some(list) = backfill {
                    self.get_history(Some(list)).await;
                }
            }
        }
    }

    async fn get_history(&mut self, list: Option<Vec<u64>>) {
        if !self.supervisor.is_connected() {
            warn!("(History) RPC not connected, ignoring history request");
            return;
        }
        let list =
            list.unwrap_or_else(|| self.watcher.default_history_range(self.stats.block.number));
        let (Some(first), Some(last)) = (list.first(), list.last()) else {
            debug!("(History) Empty history request");
            return;
        };
        info!("(History) Getting history from {} to {}", first, last);

        match BlockWatcher::fetch_history(self.rpc.as_ref(), &list).await {
            Ok(history) => {
                let update = OutboundMessage::History(HistoryPayload {
                    id: self.id().clone(),
                    history,
                });
                self.channel.emit(&update).await;
            }
            Err(e) => {
                error!("(History) History fetch failed: {:#}", e);
                self.mark_inactive().await;
            }
        }
    }

    async fn on_reference_block(&mut self, reference_head: u64) {
        AGENT_REFERENCE_HEAD.set(reference_head as i64);
        let Some(node_head) = self.watcher.last_seen_head() else {
            debug!(
                "(Alert) Reference head {} seen before any block of the node",
                reference_head
            );
            return;
        };
        AGENT_REFERENCE_DIVERGENCE.set(divergence(reference_head, node_head));

        let Some(alerting) = self.alerting.as_mut() else {
            return;
        };
        let Some(alert) = alerting
            .throttle
            .observe(&self.identity.name, reference_head, node_head)
        else {
            return;
        };

        warn!(
            "(Alert) {} is {} blocks behind reference head {}, alert #{}",
            alert.node_name,
            alert.diff,
            alert.reference_head,
            alerting.throttle.retries()
        );
        match alerting.sink.send_alert(&alert).await {
            Ok(()) => AGENT_ALERTS_SENT.inc(),
            Err(e) => error!("(Alert) Slack alert send failed: {:#}", e),
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match self.channel.apply(event) {
            ChannelAction::None => {}
            ChannelAction::SendHello => {
                let hello = OutboundMessage::Hello(HelloPayload {
                    id: self.id().clone(),
                    info: self.identity.clone(),
                    secret: self.context.config.collector.secret.clone(),
                });
                self.channel.send_now(&hello).await;
            }
            ChannelAction::MarkInactive => self.mark_inactive().await,
            ChannelAction::Inbound(InboundMessage::History(request)) => {
                info!("(History) Got history request");
                if self.context.config.history.enabled {
                    self.get_history(request.list).await;
                }
            }
            ChannelAction::Inbound(InboundMessage::Pong(pong)) => {
                let latency = latency(now_millis(), pong.client_time);
                AGENT_NODE_LATENCY.set(latency);
                let update = OutboundMessage::Latency(LatencyPayload {
                    id: self.id().clone(),
                    latency,
                });
                self.channel.send_now(&update).await;
            }
        }
    }

    #[cfg(test)]
    fn next_event(&mut self) -> Option<AgentEvent> {
        self.events_rx.as_mut().and_then(|rx| rx.try_recv().ok())
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::agent::types::{AgentEvent, InboundMessage, OutboundMessage};
use crate::core::metrics::exporter_metrics::AGENT_COLLECTOR_MESSAGES;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Collector is not connected")]
    NotConnected,

    #[error("Could not encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Transport is closed")]
    Closed,
}

/// Lifecycle and inbound events reported by a collector transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Ready,
    End,
    Timeout,
    Close,
    Offline,
    ReconnectScheduled {
        attempt: u32,
        retries: u32,
        delay: Duration,
    },
    Reconnected {
        after: Duration,
    },
    ReconnectFailed {
        reason: String,
    },
    Error(String),
    Inbound(InboundMessage),
}

///
/// Duplex link to the collector. Implementations report lifecycle changes and
/// inbound messages as [`AgentEvent::Transport`] on the sender given to `open`.
///
#[async_trait]
pub trait CollectorTransport: Send + Sync {
    fn open(&self, events: UnboundedSender<AgentEvent>);

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;

    fn close(&self);
}

/// What the node has to do after a transport event
#[derive(Debug, PartialEq)]
pub enum ChannelAction {
    None,
    SendHello,
    MarkInactive,
    Inbound(InboundMessage),
}

///
/// Gates outbound traffic on the transport being usable. `hello` and `latency`
/// bypass the gate.
///
pub struct OutboundChannel {
    transport: Arc<dyn CollectorTransport>,
    usable: bool,
    opened: bool,
}

impl OutboundChannel {
    pub fn new(transport: Arc<dyn CollectorTransport>) -> Self {
        Self {
            transport,
            usable: false,
            opened: false,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.usable
    }

    /// Opens the transport once per process
    pub fn open(&mut self, events: UnboundedSender<AgentEvent>) {
        if self.opened {
            return;
        }
        info!("(Collector) Starting collector connection");
        self.transport.open(events);
        self.opened = true;
    }

    pub fn close(&mut self) {
        if self.opened {
            self.transport.close();
        }
        self.usable = false;
    }

    /// Sends when usable, drops the message otherwise
    pub async fn emit(&self, message: &OutboundMessage) {
        if !self.usable {
            debug!("(Collector) Dropping {}, connection not ready", message.event());
            AGENT_COLLECTOR_MESSAGES
                .with_label_values(&[message.event(), "dropped"])
                .inc();
            return;
        }
        self.send_now(message).await;
    }

    pub async fn send_now(&self, message: &OutboundMessage) {
        match self.transport.send(message).await {
            Ok(()) => {
                debug!("(Collector) Emitted {}", message.event());
                AGENT_COLLECTOR_MESSAGES
                    .with_label_values(&[message.event(), "sent"])
                    .inc();
            }
            Err(e) => {
                error!("(Collector) Emit of {} failed: {}", message.event(), e);
                AGENT_COLLECTOR_MESSAGES
                    .with_label_values(&[message.event(), "error"])
                    .inc();
            }
        }
    }

    pub fn apply(&mut self, event: TransportEvent) -> ChannelAction {
        match event {
            TransportEvent::Open => {
                info!("(Collector) Connection opened, logging in");
                ChannelAction::SendHello
            }
            TransportEvent::Ready => {
                self.usable = true;
                info!("(Collector) Connection established");
                ChannelAction::None
            }
            TransportEvent::End => {
                self.usable = false;
                error!("(Collector) Connection end received");
                ChannelAction::None
            }
            TransportEvent::Timeout => {
                self.usable = false;
                error!("(Collector) Connection timeout");
                ChannelAction::None
            }
            TransportEvent::Close => {
                self.usable = false;
                error!("(Collector) Connection has been closed");
                ChannelAction::None
            }
            TransportEvent::Offline => {
                self.usable = false;
                error!("(Collector) Network connection is offline");
                ChannelAction::None
            }
            TransportEvent::ReconnectScheduled {
                attempt,
                retries,
                delay,
            } => {
                self.usable = false;
                warn!(
                    "(Collector) Reconnecting in {} ms, attempt {} out of {}",
                    delay.as_millis(),
                    attempt,
                    retries
                );
                ChannelAction::None
            }
            TransportEvent::Reconnected { after } => {
                self.usable = true;
                info!(
                    "(Collector) Reconnected successfully after {} ms",
                    after.as_millis()
                );
                ChannelAction::MarkInactive
            }
            TransportEvent::ReconnectFailed { reason } => {
                self.usable = false;
                error!("(Collector) Reconnect failed: {}", reason);
                ChannelAction::None
            }
            TransportEvent::Error(e) => {
                error!("(Collector) Transport error: {}", e);
                ChannelAction::None
            }
            TransportEvent::Inbound(message) => ChannelAction::Inbound(message),
        }
    }
}

/// Half of the observed round trip, rounded up
pub fn latency(now_millis: i64, client_time: i64) -> i64 {
    ((now_millis - client_time) as f64 / 2.0).ceil() as i64
}

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::channel::{CollectorTransport, TransportError, TransportEvent};
use crate::agent::types::{AgentEvent, InboundMessage, OutboundMessage};

const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(500);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

const PRIMUS_PING: &str = "primus::ping::";
const PRIMUS_PONG: &str = "primus::pong::";
const PRIMUS_SERVER_CLOSE: &str = "primus::server::close";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

///
/// Persistent websocket link to a primus collector. Messages travel as
/// primus-emit frames (`{"emit": [event, payload]}`) in both directions and the
/// server heartbeat is answered in place.
///
/// Lifecycle changes are reported on the sender given to `open`. A lost link is
/// re-established with exponential backoff, at most `retries` times in a row.
///
pub struct WsCollector {
    link: Arc<Link>,
}

struct Link {
    url: String,
    retries: u32,
    connect_timeout: Duration,
    idle_timeout: Duration,
    events: OnceLock<UnboundedSender<AgentEvent>>,
    writer: Mutex<Option<UnboundedSender<Message>>>,
    token: CancellationToken,
}

enum LinkEnd {
    Shutdown,
    Lost(TransportEvent),
}

/// A decoded text frame from the collector
#[derive(Debug, PartialEq)]
enum Incoming {
    Heartbeat(String),
    ServerClose,
    Ready,
    Message(InboundMessage),
    Ignored,
}

impl Link {
    fn notify(&self, event: TransportEvent) {
        if let Some(events) = self.events.get() {
            if events.send(AgentEvent::Transport(event)).is_err() {
                debug!("(Collector) Event queue closed");
            }
        }
    }

    fn set_writer(&self, writer: Option<UnboundedSender<Message>>) {
        if let Ok(mut current) = self.writer.lock() {
            *current = writer;
        }
    }

    fn writer(&self) -> Option<UnboundedSender<Message>> {
        self.writer.lock().ok().and_then(|writer| writer.clone())
    }
}

impl WsCollector {
    pub fn new(url: &str, connect_timeout: Duration, idle_timeout: Duration, retries: u32) -> Self {
        Self {
            link: Arc::new(Link {
                url: socket_url(url),
                retries,
                connect_timeout,
                idle_timeout,
                events: OnceLock::new(),
                writer: Mutex::new(None),
                token: CancellationToken::new(),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.link.url
    }
}

#[async_trait]
impl CollectorTransport for WsCollector {
    fn open(&self, events: UnboundedSender<AgentEvent>) {
        if self.link.events.set(events).is_err() {
            warn!("(Collector) Transport already opened");
            return;
        }
        tokio::spawn(maintain(self.link.clone()));
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        if self.link.token.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let text = message.to_frame()?.to_string();
        let writer = self.link.writer().ok_or(TransportError::NotConnected)?;
        writer
            .send(Message::Text(text))
            .map_err(|_| TransportError::NotConnected)
    }

    fn close(&self) {
        self.link.token.cancel();
        self.link.set_writer(None);
    }
}

/// `http(s)` endpoints are mapped to `ws(s)`, a bare host gets the `/api` path
fn socket_url(url: &str) -> String {
    let url = url.trim_end_matches('/');
    let url = if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else {
        url.to_string()
    };
    let has_path = url
        .split_once("://")
        .is_some_and(|(_, rest)| rest.contains('/'));
    if has_path {
        url
    } else {
        format!("{}/api", url)
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    MIN_RECONNECT_DELAY
        .checked_mul(factor)
        .unwrap_or(MAX_RECONNECT_DELAY)
        .min(MAX_RECONNECT_DELAY)
}

fn decode(text: &str) -> Incoming {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!("(Collector) Ignoring unparsable frame: {}", e);
            return Incoming::Ignored;
        }
    };

    if let Value::String(control) = &value {
        if let Some(stamp) = control.strip_prefix(PRIMUS_PING) {
            let pong = Value::String(format!("{}{}", PRIMUS_PONG, stamp));
            return Incoming::Heartbeat(pong.to_string());
        }
        if control == PRIMUS_SERVER_CLOSE {
            return Incoming::ServerClose;
        }
        return Incoming::Ignored;
    }

    if value.pointer("/emit/0").and_then(Value::as_str) == Some("ready") {
        return Incoming::Ready;
    }
    match InboundMessage::from_frame(&value) {
        Ok(message) => Incoming::Message(message),
        Err(e) => {
            debug!("(Collector) Ignoring inbound frame: {}", e);
            Incoming::Ignored
        }
    }
}

async fn maintain(link: Arc<Link>) {
    let mut attempt = 0u32;
    let mut lost_at: Option<Instant> = None;
    let mut last_error = String::new();

    loop {
        let connected = tokio::select! {
            _ = link.token.cancelled() => return,
            result = tokio::time::timeout(link.connect_timeout, connect_async(link.url.as_str())) => result,
        };

        match connected {
            Ok(Ok((socket, _))) => {
                attempt = 0;
                info!("(Collector) Connected to {}", link.url);
                let (writer, outbound) = unbounded_channel();
                link.set_writer(Some(writer));
                link.notify(TransportEvent::Open);
                if let Some(lost) = lost_at.take() {
                    link.notify(TransportEvent::Reconnected {
                        after: lost.elapsed(),
                    });
                }

                let end = session(&link, socket, outbound).await;
                link.set_writer(None);
                match end {
                    LinkEnd::Shutdown => return,
                    LinkEnd::Lost(event) => {
                        last_error = "connection lost".to_string();
                        link.notify(event);
                        lost_at = Some(Instant::now());
                    }
                }
            }
            Ok(Err(e)) => {
                debug!("(Collector) Could not connect to {}: {}", link.url, e);
                last_error = e.to_string();
                link.notify(match &e {
                    tungstenite::Error::Io(_) => TransportEvent::Offline,
                    other => TransportEvent::Error(other.to_string()),
                });
            }
            Err(_) => {
                last_error = format!(
                    "connect timed out after {} ms",
                    link.connect_timeout.as_millis()
                );
                link.notify(TransportEvent::Timeout);
            }
        }

        attempt += 1;
        if attempt > link.retries {
            link.notify(TransportEvent::ReconnectFailed { reason: last_error });
            return;
        }
        let delay = reconnect_delay(attempt);
        link.notify(TransportEvent::ReconnectScheduled {
            attempt,
            retries: link.retries,
            delay,
        });
        tokio::select! {
            _ = link.token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Pumps one established socket until it is lost or the transport is closed
async fn session(
    link: &Link,
    socket: Socket,
    mut outbound: UnboundedReceiver<Message>,
) -> LinkEnd {
    let (mut sink, mut source) = socket.split();
    let idle = tokio::time::sleep(link.idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = link.token.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return LinkEnd::Shutdown;
            }
            _ = &mut idle => {
                warn!(
                    "(Collector) Nothing received for {} ms",
                    link.idle_timeout.as_millis()
                );
                return LinkEnd::Lost(TransportEvent::Timeout);
            }
            Some(message) = outbound.recv() => {
                if let Err(e) = sink.send(message).await {
                    warn!("(Collector) Write failed: {}", e);
                    return LinkEnd::Lost(TransportEvent::Close);
                }
            }
            received = source.next() => {
                idle.as_mut().reset(Instant::now() + link.idle_timeout);
                let text = match received {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) => return LinkEnd::Lost(TransportEvent::End),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("(Collector) Read failed: {}", e);
                        return LinkEnd::Lost(TransportEvent::Close);
                    }
                    None => return LinkEnd::Lost(TransportEvent::Close),
                };

                match decode(&text) {
                    Incoming::Heartbeat(pong) => {
                        if let Err(e) = sink.send(Message::Text(pong)).await {
                            warn!("(Collector) Heartbeat reply failed: {}", e);
                            return LinkEnd::Lost(TransportEvent::Close);
                        }
                    }
                    Incoming::ServerClose => return LinkEnd::Lost(TransportEvent::End),
                    Incoming::Ready => link.notify(TransportEvent::Ready),
                    Incoming::Message(message) => link.notify(TransportEvent::Inbound(message)),
                    Incoming::Ignored => {}
                }
            }
        }
    }
}

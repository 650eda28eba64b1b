use lazy_static::lazy_static;
use prometheus::{CounterVec, Gauge, IntCounter, IntGauge, IntGaugeVec, Opts, Registry};
use tracing::error;

lazy_static! {
    pub static ref AGENT_REGISTRY: Registry = Registry::new();
    pub static ref AGENT_NODE_ACTIVE: IntGauge = IntGauge::new(
        "netstats_agent_node_active",
        "Whether the monitored node answered the last stats sample (1=active, 0=down)"
    )
    .unwrap();
    pub static ref AGENT_NODE_PEERS: IntGauge =
        IntGauge::new("netstats_agent_node_peers", "Peer count of the monitored node").unwrap();
    pub static ref AGENT_NODE_GAS_PRICE: Gauge = Gauge::new(
        "netstats_agent_node_gas_price",
        "Gas price reported by the monitored node"
    )
    .unwrap();
    pub static ref AGENT_NODE_UPTIME: Gauge = Gauge::new(
        "netstats_agent_node_uptime_percent",
        "Share of successful checks since start"
    )
    .unwrap();
    pub static ref AGENT_NODE_HEAD: IntGauge = IntGauge::new(
        "netstats_agent_node_head_block",
        "Highest block applied from the monitored node"
    )
    .unwrap();
    pub static ref AGENT_NODE_LATENCY: IntGauge = IntGauge::new(
        "netstats_agent_node_latency_ms",
        "Collector round trip latency measured by ping"
    )
    .unwrap();
    pub static ref AGENT_RPC_REQUESTS: CounterVec = CounterVec::new(
        Opts::new("netstats_agent_rpc_requests_total", "JSON-RPC requests issued by the agent"),
        &["endpoint", "method", "status"]
    )
    .unwrap();
    pub static ref AGENT_RPC_RECONNECTS: IntCounter = IntCounter::new(
        "netstats_agent_rpc_reconnects_total",
        "Full RPC reconnect sequences started"
    )
    .unwrap();
    pub static ref AGENT_RPC_CONNECTION_ABORTED: IntGauge = IntGauge::new(
        "netstats_agent_rpc_connection_aborted",
        "Set to 1 once the connection attempt ceiling is reached"
    )
    .unwrap();
    pub static ref AGENT_STATS_FETCH_FAILURES: IntCounter = IntCounter::new(
        "netstats_agent_stats_fetch_failures_total",
        "Stats samples that failed to fetch"
    )
    .unwrap();
    pub static ref AGENT_COLLECTOR_MESSAGES: CounterVec = CounterVec::new(
        Opts::new(
            "netstats_agent_collector_messages_total",
            "Messages handed to the collector transport"
        ),
        &["event", "result"]
    )
    .unwrap();
    pub static ref AGENT_REFERENCE_HEAD: IntGauge = IntGauge::new(
        "netstats_agent_reference_head_block",
        "Latest block seen on the reference node"
    )
    .unwrap();
    pub static ref AGENT_REFERENCE_DIVERGENCE: IntGauge = IntGauge::new(
        "netstats_agent_reference_divergence_blocks",
        "Reference head minus monitored head"
    )
    .unwrap();
    pub static ref AGENT_ALERTS_SENT: IntCounter = IntCounter::new(
        "netstats_agent_alerts_sent_total",
        "Divergence alerts dispatched"
    )
    .unwrap();
    pub static ref AGENT_APP_VERSION_INFO: IntGaugeVec = IntGaugeVec::new(
        Opts::new("netstats_agent_app_version_info", "Agent build information"),
        &["version", "commit", "build_date"]
    )
    .unwrap();
}

pub fn register_agent_metrics() {
    let collectors: Vec<(&str, Box<dyn prometheus::core::Collector>)> = vec![
        ("AGENT_NODE_ACTIVE", Box::new(AGENT_NODE_ACTIVE.clone())),
        ("AGENT_NODE_PEERS", Box::new(AGENT_NODE_PEERS.clone())),
        ("AGENT_NODE_GAS_PRICE", Box::new(AGENT_NODE_GAS_PRICE.clone())),
        ("AGENT_NODE_UPTIME", Box::new(AGENT_NODE_UPTIME.clone())),
        ("AGENT_NODE_HEAD", Box::new(AGENT_NODE_HEAD.clone())),
        ("AGENT_NODE_LATENCY", Box::new(AGENT_NODE_LATENCY.clone())),
        ("AGENT_RPC_REQUESTS", Box::new(AGENT_RPC_REQUESTS.clone())),
        ("AGENT_RPC_RECONNECTS", Box::new(AGENT_RPC_RECONNECTS.clone())),
        (
            "AGENT_RPC_CONNECTION_ABORTED",
            Box::new(AGENT_RPC_CONNECTION_ABORTED.clone()),
        ),
        (
            "AGENT_STATS_FETCH_FAILURES",
            Box::new(AGENT_STATS_FETCH_FAILURES.clone()),
        ),
        (
            "AGENT_COLLECTOR_MESSAGES",
            Box::new(AGENT_COLLECTOR_MESSAGES.clone()),
        ),
        ("AGENT_REFERENCE_HEAD", Box::new(AGENT_REFERENCE_HEAD.clone())),
        (
            "AGENT_REFERENCE_DIVERGENCE",
            Box::new(AGENT_REFERENCE_DIVERGENCE.clone()),
        ),
        ("AGENT_ALERTS_SENT", Box::new(AGENT_ALERTS_SENT.clone())),
        (
            "AGENT_APP_VERSION_INFO",
            Box::new(AGENT_APP_VERSION_INFO.clone()),
        ),
    ];

    for (name, collector) in collectors {
        AGENT_REGISTRY
            .register(collector)
            .unwrap_or_else(|e| error!("(Metrics) Error registering {}: {}", name, e));
    }
}

pub fn register_app_version_info() {
    AGENT_APP_VERSION_INFO
        .with_label_values(&[
            env!("CARGO_PKG_VERSION"),
            env!("GIT_COMMIT_HASH"),
            env!("BUILD_DATE"),
        ])
        .set(1);
}

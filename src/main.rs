use std::path::Path;
use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use evm_netstats_agent::agent::alert::{AlertSink, SlackWebhook};
use evm_netstats_agent::agent::collector::WsCollector;
use evm_netstats_agent::agent::node::{AgentError, Node};
use evm_netstats_agent::core::app_context::AppContext;
use evm_netstats_agent::core::clients::http_client::JsonRpcHttpClient;
use evm_netstats_agent::core::clients::rpc::RpcClient;
use evm_netstats_agent::core::config::{AppConfig, ConfigError, LoggingConfig};
use evm_netstats_agent::core::metrics::exporter_metrics::{
    register_agent_metrics, register_app_version_info,
};
use evm_netstats_agent::core::metrics::serve_metrics::serve_metrics;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[tokio::main]
async fn main() {
    // Load environment variables from .env file if it exists
    let _ = dotenv::dotenv();

    let (config_path, explicit) = match parse_config_flag(std::env::args().skip(1)) {
        Ok(path) => path,
        Err(e) => {
            init_tracing(&LoggingConfig::default());
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let loaded = load_config(&config_path, explicit);
    let logging = match &loaded {
        Ok((config, _)) => config.logging.clone(),
        Err(_) => LoggingConfig::default(),
    };
    init_tracing(&logging);

    let config = match loaded {
        Ok((config, from_file)) => {
            if from_file {
                info!("[main] Config loaded from {}", config_path);
            } else {
                warn!(
                    "[main] {} not found, using defaults and environment",
                    config_path
                );
            }
            config
        }
        Err(e) => {
            error!("[main] {}", e);
            std::process::exit(1);
        }
    };

    println!("{}", ascii_art());

    register_agent_metrics();
    register_app_version_info();

    let context = Arc::new(AppContext::new(config));
    let config = &context.config;
    info!(
        "[main] Monitoring {} ({}) as {}",
        config.rpc.url, config.general.node_type, context.node_id
    );

    let rpc: Arc<dyn RpcClient> =
        match JsonRpcHttpClient::new(config.rpc.url.clone(), Some(config.rpc.timeout())) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                error!("[main] Could not build RPC client: {}", e);
                std::process::exit(1);
            }
        };

    let reference: Option<Arc<dyn RpcClient>> = match config.rpc.reference_url() {
        Some(url) => match JsonRpcHttpClient::new(url.to_string(), Some(config.rpc.timeout())) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                error!("[main] Could not build reference RPC client: {}", e);
                std::process::exit(1);
            }
        },
        None => None,
    };

    let alert_sink: Option<Arc<dyn AlertSink>> = match config.alerting.webhook_url() {
        Some(url) if reference.is_some() => {
            let mention = Some(config.alerting.mention.clone());
            match SlackWebhook::new(url, mention, config.rpc.timeout()) {
                Ok(sink) => Some(Arc::new(sink)),
                Err(e) => {
                    error!("[main] Could not build Slack webhook: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Some(_) => {
            warn!("[main] Slack webhook configured without a reference RPC, alerts disabled");
            None
        }
        None => None,
    };

    let transport = Arc::new(WsCollector::new(
        &config.collector.url,
        config.collector.connect_timeout(),
        config.collector.idle_timeout(),
        config.collector.reconnect_retries,
    ));
    info!("[main] Reporting to collector at {}", transport.url());

    let token = CancellationToken::new();
    let node = Node::new(
        context.clone(),
        rpc,
        reference,
        transport,
        alert_sink,
        token.clone(),
    );

    let metrics = &context.config.metrics;
    let metrics_server = {
        let enabled = metrics.enabled;
        let address = metrics.address.clone();
        let port = metrics.port;
        let path = metrics.path.clone();
        async move {
            if enabled {
                serve_metrics(address, port, path).await
            } else {
                std::future::pending().await
            }
        }
    };

    tokio::spawn(listen_for_shutdown(token.clone()));

    let exit_code = tokio::select! {
        result = node.run() => match result {
            Ok(()) => {
                info!("Gracefully shut down agent.");
                0
            }
            Err(AgentError::ConnectionAborted { attempts }) => {
                error!("[main] Giving up on RPC after {} attempts", attempts);
                1
            }
            Err(e) => {
                error!("[main] Agent stopped: {}", e);
                1
            }
        },
        result = metrics_server => {
            if let Err(e) = result {
                error!("[main] Metrics server exited: {:#}", e);
            }
            token.cancel();
            1
        }
    };

    std::process::exit(exit_code);
}

fn parse_config_flag<I>(mut args: I) -> Result<(String, bool), String>
where
    I: Iterator<Item = String>,
{
    let mut config_path = None;
    while let Some(arg) = args.next() {
        if arg == "--config" {
            match args.next() {
                Some(path) => config_path = Some(path),
                None => return Err("--config flag provided but no file specified".to_string()),
            }
        }
    }
    Ok(match config_path {
        Some(path) => (path, true),
        None => (DEFAULT_CONFIG_PATH.to_string(), false),
    })
}

/// A missing default config file is not an error, the agent can run from env alone
fn load_config(path: &str, explicit: bool) -> Result<(AppConfig, bool), ConfigError> {
    let (mut config, from_file) = if explicit || Path::new(path).exists() {
        (AppConfig::from_file(path)?, true)
    } else {
        (AppConfig::default(), false)
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok((config, from_file))
}

fn init_tracing(logging: &LoggingConfig) {
    let level = logging
        .level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE);

    if logging.json {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }
}

pub async fn listen_for_shutdown(cancel_token: CancellationToken) {
    let sigint = signal::ctrl_c();
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Could not listen for SIGTERM: {}", e);
            let _ = sigint.await;
            info!("Received SIGINT");
            cancel_token.cancel();
            return;
        }
    };

    tokio::select! {
        _ = sigint => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    cancel_token.cancel();
}

fn ascii_art() -> &'static str {
    r#"
  ___ __   ____  __   _  _ ___ _____ ___ _____ _ _____ ___
 | __|\ \ / /  \/  | | \| | __|_   _/ __|_   _/_\_   _/ __|
 | _|  \ V /| |\/| | | .` | _|  | | \__ \ | |/ _ \| | \__ \
 |___|  \_/ |_|  |_| |_|\_|___| |_| |___/ |_/_/ \_\_| |___/
    "#
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_parse_config_flag() {
        assert_eq!(
            parse_config_flag(args(&[])),
            Ok(("config.yaml".to_string(), false))
        );
        assert_eq!(
            parse_config_flag(args(&["--config", "/etc/agent.yaml"])),
            Ok(("/etc/agent.yaml".to_string(), true))
        );
        assert!(parse_config_flag(args(&["--config"])).is_err());
    }
}

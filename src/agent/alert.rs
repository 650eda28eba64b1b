use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivergenceAlert {
    pub node_name: String,
    pub reference_head: u64,
    pub node_head: u64,
    pub diff: i64,
}

///
/// Rate limits divergence alerts. Every reference head that trails the monitored
/// head by more than `threshold` counts; the 1st, (every+1)th, (2*every+1)th ... of
/// those dispatch an alert. The count is never reset.
///
#[derive(Debug)]
pub struct AlertThrottle {
    threshold: u64,
    every: u64,
    retries: u64,
}

impl AlertThrottle {
    pub fn new(threshold: u64, every: u64) -> Self {
        Self {
            threshold,
            every: every.max(1),
            retries: 0,
        }
    }

    pub fn retries(&self) -> u64 {
        self.retries
    }

    pub fn observe(
        &mut self,
        node_name: &str,
        reference_head: u64,
        node_head: u64,
    ) -> Option<DivergenceAlert> {
        let diff = divergence(reference_head, node_head);
        if diff <= self.threshold as i64 {
            return None;
        }

        let fire = self.retries % self.every == 0;
        self.retries += 1;
        fire.then(|| DivergenceAlert {
            node_name: node_name.to_string(),
            reference_head,
            node_head,
            diff,
        })
    }
}

pub fn divergence(reference_head: u64, node_head: u64) -> i64 {
    (reference_head as i128 - node_head as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, alert: &DivergenceAlert) -> anyhow::Result<()>;
}

/// Posts alerts to a Slack incoming webhook
pub struct SlackWebhook {
    client: Client,
    url: String,
    mention: Option<String>,
}

impl SlackWebhook {
    pub fn new(url: &str, mention: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Could not build Slack client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            mention: mention.filter(|m| !m.is_empty()),
        })
    }
}

pub fn alert_text(alert: &DivergenceAlert, mention: Option<&str>) -> String {
    let mut text = format!(
        ":boom: *{}* syncing error :boom: \n current block is `{}`. It doesn't reach to `{}`",
        alert.node_name, alert.node_head, alert.reference_head
    );
    if let Some(mention) = mention {
        text.push(' ');
        text.push_str(mention);
    }
    text
}

#[async_trait]
impl AlertSink for SlackWebhook {
    async fn send_alert(&self, alert: &DivergenceAlert) -> anyhow::Result<()> {
        let body = json!({
            "text": alert_text(alert, self.mention.as_deref()),
            "icon_emoji": ":bowtie:",
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("Slack webhook request failed")?;
        if !response.status().is_success() {
            bail!("Slack webhook answered {}", response.status());
        }
        Ok(())
    }
}

//! Coordinator API client for the agent.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use pv6_models::NodeReport;
use reqwest::Url;
use tracing::{debug, error};

/// Coordinator API client.
pub struct CoordinatorClient {
    client: reqwest::Client,
    base_url: Url,
}

impl CoordinatorClient {
    /// Create a new coordinator client.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;

        let base_url = base_url.into();
        let base_url = Url::parse(&base_url)
            .with_context(|| format!("invalid coordinator URL {base_url}"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("coordinator URL {base_url} cannot carry a path");
        }

        Ok(Self { client, base_url })
    }

    /// `{base}/api/nodes/{node_id}`, with the id percent-encoded as one segment.
    pub fn report_url(&self, node_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("coordinator URL {} cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(["api", "nodes", node_id]);
        Ok(url)
    }

    /// Push a full report for this node.
    pub async fn send_report(&self, report: &NodeReport) -> Result<()> {
        let url = self.report_url(&report.node_id)?;
        debug!(
            url = %url,
            proxies = report.proxies.len(),
            "Sending node report"
        );

        let response = self.client.post(url).json(report).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Coordinator rejected report");
            anyhow::bail!("Coordinator rejected report: {} - {}", status, body);
        }

        Ok(())
    }
}

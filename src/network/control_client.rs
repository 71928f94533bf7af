/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{NetworkCondition, ServerMetrics};
use crate::error::OrchestratorError;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of one call to the status route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStatus {
    Ready,
    NotReady(u16),
    Unreachable,
}

/// Body of a network update request. Absent fields are left out of the JSON entirely.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdatePayload {
    pub stream_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_kbps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<u32>,
}

impl UpdatePayload {
    /// Profile values are expanded first since the control route only understands numbers.
    pub fn new(stream_index: usize, condition: &NetworkCondition) -> Self {
        let resolved = condition.resolved();
        Self {
            stream_index,
            packet_loss: resolved.packet_loss,
            latency_ms: resolved.latency_ms,
            bandwidth_kbps: resolved.bandwidth_kbps,
            jitter_ms: resolved.jitter_ms,
        }
    }
}

/// HTTP client for one media server's control port.
#[derive(Debug, Clone)]
pub struct ControlClient {
    base_url: String,
    client: reqwest::Client,
}

impl ControlClient {
    pub fn new(host: &str, port: u16, prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: format!("http://{host}:{port}{prefix}"),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn status(&self) -> ControlStatus {
        match self.client.get(format!("{}/status", self.base_url)).send().await {
            Ok(response) if response.status().is_success() => ControlStatus::Ready,
            Ok(response) => ControlStatus::NotReady(response.status().as_u16()),
            Err(e) => {
                debug!("Status request to {} failed: {}", self.base_url, e);
                ControlStatus::Unreachable
            }
        }
    }

    pub async fn metrics(&self) -> anyhow::Result<ServerMetrics> {
        let url = format!("{}/metrics", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OrchestratorError::control_channel(format!("GET {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(OrchestratorError::control_channel(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }

        response
            .json::<ServerMetrics>()
            .await
            .map_err(|e| OrchestratorError::control_channel(format!("bad metrics from {url}: {e}")))
    }

    pub async fn update(&self, stream_index: usize, condition: &NetworkCondition) -> anyhow::Result<()> {
        let url = format!("{}/network/update", self.base_url);
        let payload = UpdatePayload::new(stream_index, condition);
        debug!("POST {} {:?}", url, payload);

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| OrchestratorError::control_channel(format!("POST {url}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(OrchestratorError::control_channel(format!(
                "POST {url} returned {status}: {body}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_expands_profiles_and_skips_absent_fields() -> anyhow::Result<()> {
        let payload = UpdatePayload::new(1, &NetworkCondition::profile("poor"));
        let json = serde_json::to_value(&payload)?;
        assert_eq!(
            json,
            serde_json::json!({
                "stream_index": 1,
                "packet_loss": 10.0,
                "latency_ms": 500,
                "bandwidth_kbps": 50
            })
        );

        let payload = UpdatePayload::new(
            0,
            &NetworkCondition {
                jitter_ms: Some(30),
                ..Default::default()
            },
        );
        let json = serde_json::to_value(&payload)?;
        assert_eq!(json, serde_json::json!({"stream_index": 0, "jitter_ms": 30}));
        Ok(())
    }

    #[test]
    fn base_url_includes_the_route_prefix() {
        assert_eq!(
            ControlClient::new("127.0.0.1", 9554, "/api/").base_url(),
            "http://127.0.0.1:9554/api"
        );
        assert_eq!(
            ControlClient::new("localhost", 9000, "").base_url(),
            "http://localhost:9000"
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_reported_not_raised() {
        // port 9 (discard) is closed on any sane test host
        let client = ControlClient::new("127.0.0.1", 9, "/api");
        assert_eq!(client.status().await, ControlStatus::Unreachable);

        let err = client.metrics().await.unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(OrchestratorError::ControlChannel(_))
        ));
    }
}

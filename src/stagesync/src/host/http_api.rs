// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The application's HTTP admin API.
//!
//! Every response is wrapped in an envelope,
//! `{"status": "OK", "data": ...}` on success and
//! `{"status": "ERROR", "message": ...}` otherwise.

use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use url::Url;

use crate::host::app_server::run_local;
use crate::services::{IndexStatus, Integration, IntegrationRegistry, SearchIndex};

pub const VERSION_PATH: &str = "/api/info/version";
pub const INTEGRATIONS_PATH: &str = "/api/admin/externalTools";
const INDEX_CLEAR_PATH: &str = "/api/admin/index/clear";
const INDEX_PATH: &str = "/api/admin/index";
const INDEX_STATUS_PATH: &str = "/api/admin/index/status";

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    message: Option<String>,
}

/// Unwraps an envelope, returning its `data`.
pub fn unwrap_envelope(body: &str) -> anyhow::Result<Value> {
    let envelope: Envelope = serde_json::from_str(body).context("decoding API response")?;
    if envelope.status != "OK" {
        bail!(
            "API returned {}: {}",
            envelope.status,
            envelope.message.as_deref().unwrap_or("no message")
        );
    }
    Ok(envelope.data)
}

pub fn parse_version(data: &Value) -> anyhow::Result<String> {
    let version = data
        .get("version")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("version missing from response"))?;
    Ok(match data.get("build").and_then(Value::as_str) {
        Some(build) if !build.is_empty() => format!("{version} build {build}"),
        _ => version.to_string(),
    })
}

pub fn parse_integrations(data: Value) -> anyhow::Result<Vec<Integration>> {
    serde_json::from_value(data).context("decoding integrations")
}

/// Sums the stale counters of an index status report.
pub fn parse_index_status(data: &Value) -> anyhow::Result<IndexStatus> {
    let stale = data
        .get("contentInDatabaseButStaleInOrMissingFromIndex")
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow!("index status missing stale counters"))?;
    Ok(IndexStatus {
        stale: stale.values().filter_map(Value::as_u64).sum(),
    })
}

/// A client for the clone's admin API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base: Url,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base: Url, timeout: Duration) -> anyhow::Result<ApiClient> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(ApiClient { base, client })
    }

    fn url(&self, path: &str) -> anyhow::Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("joining {path} onto {}", self.base))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> anyhow::Result<Value> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            // Error bodies still carry the envelope's message when there is one.
            return match unwrap_envelope(&body) {
                Err(e) => Err(e.context(format!("HTTP {status}"))),
                Ok(_) => Err(anyhow!("HTTP {status}")),
            };
        }
        unwrap_envelope(&body)
    }

    pub async fn get(&self, path: &str) -> anyhow::Result<Value> {
        let url = self.url(path)?;
        self.send(self.client.get(url)).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        let url = self.url(path)?;
        self.send(self.client.post(url).json(body)).await
    }

    pub async fn delete(&self, path: &str) -> anyhow::Result<Value> {
        let url = self.url(path)?;
        self.send(self.client.delete(url)).await
    }
}

/// The search index: content through the admin API, the service through
/// systemd.
pub struct ApiSearchIndex {
    api: ApiClient,
    service_name: String,
}

impl ApiSearchIndex {
    pub fn new(api: ApiClient, service_name: &str) -> ApiSearchIndex {
        ApiSearchIndex {
            api,
            service_name: service_name.to_string(),
        }
    }
}

#[async_trait]
impl SearchIndex for ApiSearchIndex {
    async fn restart(&self) -> anyhow::Result<()> {
        let mut cmd = Command::new("systemctl");
        cmd.arg("restart").arg(&self.service_name);
        run_local(cmd, &format!("systemctl restart {}", self.service_name)).await?;
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.api.get(INDEX_CLEAR_PATH).await?;
        Ok(())
    }

    async fn start_rebuild(&self) -> anyhow::Result<()> {
        self.api.get(INDEX_PATH).await?;
        Ok(())
    }

    async fn status(&self) -> anyhow::Result<IndexStatus> {
        parse_index_status(&self.api.get(INDEX_STATUS_PATH).await?)
    }
}

pub struct ApiIntegrations {
    api: ApiClient,
}

impl ApiIntegrations {
    pub fn new(api: ApiClient) -> ApiIntegrations {
        ApiIntegrations { api }
    }
}

#[async_trait]
impl IntegrationRegistry for ApiIntegrations {
    async fn list(&self) -> anyhow::Result<Vec<Integration>> {
        parse_integrations(self.api.get(INTEGRATIONS_PATH).await?)
    }

    async fn register(&self, integration: &Integration) -> anyhow::Result<()> {
        let body = serde_json::to_value(integration)?;
        self.api.post_json(INTEGRATIONS_PATH, &body).await?;
        Ok(())
    }

    async fn remove(&self, id: i64) -> anyhow::Result<()> {
        self.api
            .delete(&format!("{INTEGRATIONS_PATH}/{id}"))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_errors_carry_the_message() {
        let err = unwrap_envelope(r#"{"status":"ERROR","message":"Tool not found"}"#).unwrap_err();
        assert_eq!(err.to_string(), "API returned ERROR: Tool not found");
        assert!(unwrap_envelope("<html>").is_err());
    }

    #[test]
    fn parses_version_and_index_status() {
        let data = unwrap_envelope(r#"{"status":"OK","data":{"version":"6.2","build":"1234"}}"#)
            .unwrap();
        assert_eq!(parse_version(&data).unwrap(), "6.2 build 1234");

        let status = serde_json::json!({
            "contentInDatabaseButStaleInOrMissingFromIndex": {"dataverses": 2, "datasets": 5},
            "contentInIndexButNotDatabase": {"dataverses": 0}
        });
        assert_eq!(parse_index_status(&status).unwrap(), IndexStatus { stale: 7 });
        assert!(parse_index_status(&serde_json::json!({})).is_err());
    }

    #[test]
    fn parses_integration_listing() {
        let data = unwrap_envelope(
            r#"{"status":"OK","data":[{"id":3,"displayName":"Explorer","toolUrl":"https://x"}]}"#,
        )
        .unwrap();
        let integrations = parse_integrations(data).unwrap();
        assert_eq!(integrations.len(), 1);
        assert_eq!(integrations[0].id, Some(3));
    }
}

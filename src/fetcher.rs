//! Control plane API client.
//!
//! Fetches the desired networks and machines and posts health reports.
//! Every call carries the configured request timeout, so an unreachable
//! control plane costs one tick and nothing more.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::health::HealthReport;
use crate::types::{index_records, Indexed, MachineSpec, NetworkSpec};

pub const NETWORKS_PATH: &str = "/api/network";
pub const MACHINES_PATH: &str = "/api/cubicle";
pub const HEALTH_PATH: &str = "/api/health";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}")]
    Status { url: String, status: StatusCode },

    #[error("{url} returned no data")]
    EmptyBody { url: String },

    #[error("{url} returned a malformed body: {source}")]
    Malformed {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// `{"result": [...]}`
#[derive(Debug, Deserialize)]
struct Envelope {
    result: Vec<Value>,
}

/// Where the reconciler reads desired state from.
///
/// An `Ok` with an empty mapping means the control plane explicitly wants
/// nothing; any doubt is an `Err`.
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    async fn fetch_networks(&self) -> Result<Indexed<NetworkSpec>, ApiError>;
    async fn fetch_machines(&self) -> Result<Indexed<MachineSpec>, ApiError>;
}

pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
}

impl ControlPlaneClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        source_address: Option<IpAddr>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .local_address(source_address)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch_records(&self, path: &str) -> Result<Vec<Value>, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Fetching {}", url);

        let transport = |source: reqwest::Error| ApiError::Transport {
            url: url.clone(),
            source,
        };
        let response = self.client.get(&url).send().await.map_err(&transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                url: url.clone(),
                status,
            });
        }

        let body = response.bytes().await.map_err(&transport)?;
        if body.is_empty() {
            return Err(ApiError::EmptyBody { url });
        }
        let envelope: Envelope =
            serde_json::from_slice(&body).map_err(|source| ApiError::Malformed {
                url: url.clone(),
                source,
            })?;
        debug!("{} returned {} records", url, envelope.result.len());
        Ok(envelope.result)
    }

    /// Post a health report.  Returns the status the control plane answered with.
    pub async fn report_health(&self, report: &HealthReport) -> Result<StatusCode, ApiError> {
        let url = format!("{}{}", self.base_url, HEALTH_PATH);
        let response = self
            .client
            .post(&url)
            .json(report)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status { url, status });
        }
        Ok(status)
    }
}

#[async_trait]
impl DesiredStateSource for ControlPlaneClient {
    async fn fetch_networks(&self) -> Result<Indexed<NetworkSpec>, ApiError> {
        let records = self.fetch_records(NETWORKS_PATH).await?;
        Ok(index_records("network", records))
    }

    async fn fetch_machines(&self) -> Result<Indexed<MachineSpec>, ApiError> {
        let records = self.fetch_records(MACHINES_PATH).await?;
        Ok(index_records("machine", records))
    }
}

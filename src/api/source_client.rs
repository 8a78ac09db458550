//! Source terminal client: reads open positions from an MT5 bridge.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::models::SourcePosition;

use super::error::SourceError;
use super::types::BridgePosition;

/// Capability to list currently open source positions.
#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn fetch_open_positions(&self) -> Result<Vec<SourcePosition>, SourceError>;
}

/// HTTP client for the MT5 bridge (read-only).
pub struct HttpSourceClient {
    client: Client,
    base_url: String,
}

impl HttpSourceClient {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.bridge_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn fetch_open_positions(&self) -> Result<Vec<SourcePosition>, SourceError> {
        let url = format!("{}/positions", self.base_url);
        debug!(url = %url, "Fetching source positions");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Unavailable(format!("{} - {}", status, body)));
        }

        let raw: Vec<BridgePosition> = response
            .json()
            .await
            .map_err(|e| SourceError::Unavailable(format!("bad positions payload: {}", e)))?;

        let mut positions = Vec::with_capacity(raw.len());
        for bridge in raw {
            let ticket = bridge.ticket;
            match bridge.into_position() {
                Some(p) => positions.push(p),
                None => warn!(ticket = ticket, "Skipping position with unknown type"),
            }
        }

        Ok(positions)
    }
}

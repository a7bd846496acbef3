//! Batch configuration and request documents loaded from YAML (or JSON, which YAML accepts).

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::dispatch::{DispatchOptions, InvocationRequest, DEFAULT_ENDPOINT};

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

#[derive(Debug, Clone, Deserialize)]
/// Top-level configuration.
pub struct FanoutConfig {
    #[serde(default)]
    /// Region for requests that do not name one.
    pub default_region: Option<String>,

    #[serde(default = "default_endpoint")]
    /// Endpoint template; `{region}` is replaced per request.
    pub endpoint: String,

    #[serde(default)]
    /// Maximum number of concurrent invocations per batch. Unbounded when absent.
    pub max_concurrency: Option<usize>,

    #[serde(default)]
    /// Per-invocation deadline. No deadline when absent.
    pub invoke_timeout_ms: Option<u64>,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            default_region: None,
            endpoint: default_endpoint(),
            max_concurrency: None,
            invoke_timeout_ms: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl FanoutConfig {
    /// Parse a YAML config from bytes.
    pub fn from_yaml_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let cfg: Self = serde_yaml::from_slice(bytes)?;
        if cfg.max_concurrency == Some(0) {
            anyhow::bail!("max_concurrency must be at least 1");
        }
        Ok(cfg)
    }

    pub fn invoke_timeout(&self) -> Option<Duration> {
        self.invoke_timeout_ms.map(Duration::from_millis)
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            endpoint: self.endpoint.clone(),
            max_concurrency: self.max_concurrency,
        }
    }

    /// HTTP client shared by every invocation of one batch.
    pub fn http_client(&self) -> anyhow::Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .build()
            .context("build HTTP client")
    }
}

/// Parse a list of invocation requests from a YAML or JSON document.
pub fn load_requests(bytes: &[u8]) -> anyhow::Result<Vec<InvocationRequest>> {
    serde_yaml::from_slice(bytes).context("parse invocation requests")
}

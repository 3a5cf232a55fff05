use std::{collections::BTreeMap, time::Duration};

use serde::Deserialize;

use ipxarray::Result;

/// Where and how to talk to an IPFS node
///
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct IpfsConfig {
    /// HTTP gateway used for reads
    pub gateway_url: String,

    /// Kubo RPC endpoint used for writes. Without one the store is read-only.
    pub rpc_url: Option<String>,

    /// RPC endpoint used for pin management. Without one pinning is not supported.
    pub pin_url: Option<String>,

    /// Added to every request, usually for authentication
    pub headers: BTreeMap<String, String>,

    /// Most requests in flight at once, across all operations
    pub max_concurrent_requests: usize,

    pub timeout_ms: u64,

    pub retry: RetryPolicy,
}

impl Default for IpfsConfig {
    fn default() -> Self {
        Self {
            gateway_url: String::from("http://127.0.0.1:8080"),
            rpc_url: None,
            pin_url: None,
            headers: BTreeMap::new(),
            max_concurrent_requests: 32,
            timeout_ms: 60_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl IpfsConfig {
    /// Read a configuration from JSON. Missing fields take their default values.
    ///
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Configuration for a local node serving both the gateway and the RPC API
    ///
    pub fn local() -> Self {
        let rpc = String::from("http://127.0.0.1:5001");
        Self {
            rpc_url: Some(rpc.clone()),
            pin_url: Some(rpc),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Capped exponential backoff for transient failures
///
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: usize,

    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// How long to wait after failed attempt number `attempt`, counting from 1.
    ///
    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);

        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

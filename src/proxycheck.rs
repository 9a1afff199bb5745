//! Thin client for the external proxy-reputation API.
//!
//! One HTTP GET per check; any transport error, timeout, or malformed
//! body collapses to `None` so the resolver can substitute its
//! conservative default. Retry scheduling belongs to the resolver's
//! freshness windows, not here.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::addr::Address;
use crate::config::ProxyCheckConfig;

/// Result of a proxy-reputation check for one address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCheckResult {
    pub is_proxy: bool,
    /// Provider's classification ("VPN", "TOR", "Residential Proxy", ...).
    pub kind: Option<String>,
    /// Operator of the proxy/VPN service, when known.
    pub operator: Option<String>,
    pub city: Option<String>,
    /// Devices seen behind this exact address.
    pub devices: Option<i64>,
    /// Devices seen across the surrounding subnet.
    pub subnet_devices: Option<i64>,
}

/// Proxy-reputation API client.
#[derive(Debug, Clone)]
pub struct ProxyCheckClient {
    config: ProxyCheckConfig,
    http_client: reqwest::Client,
}

impl ProxyCheckClient {
    /// Create a client from configuration.
    pub fn new(config: ProxyCheckConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent("ipintel/0.4")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            config,
            http_client,
        }
    }

    /// Whether checking is enabled at all.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Query the reputation service for one address.
    ///
    /// `None` means "unknown": unreachable service, timeout, or a body we
    /// cannot interpret. The caller treats all three identically.
    pub async fn check_ip(&self, addr: Address) -> Option<ProxyCheckResult> {
        if !self.config.enabled {
            return None;
        }

        let ip = addr.canonical();
        let mut url = format!("{}/{}?vpn=1&asn=1&risk=1", self.config.base_url, ip);
        if let Some(key) = &self.config.api_key {
            url.push_str("&key=");
            url.push_str(key);
        }

        let response = match self.http_client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(ip = %ip, error = %e, "Proxy check request failed");
                return None;
            }
        };

        let json: serde_json::Value = match response.json().await {
            Ok(j) => j,
            Err(e) => {
                warn!(ip = %ip, error = %e, "Failed to parse proxy check response");
                return None;
            }
        };

        // Response shape: { "status": "ok", "<ip>": { "proxy": "yes",
        // "type": "VPN", "operator": {...}, "city": ..., "devices": {...} } }
        if json.get("status").and_then(|v| v.as_str()) != Some("ok") {
            warn!(ip = %ip, "Proxy check returned non-ok status");
            return None;
        }
        let data = json.get(&ip)?;

        let is_proxy = data.get("proxy").and_then(|v| v.as_str()) == Some("yes");
        let kind = data
            .get("type")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let operator = data
            .get("operator")
            .and_then(|op| op.get("name"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let city = data
            .get("city")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let devices = data
            .get("devices")
            .and_then(|d| d.get("address"))
            .and_then(|v| v.as_i64());
        let subnet_devices = data
            .get("devices")
            .and_then(|d| d.get("subnet"))
            .and_then(|v| v.as_i64());

        Some(ProxyCheckResult {
            is_proxy,
            kind,
            operator,
            city,
            devices,
            subnet_devices,
        })
    }
}

//! Configuration for the IP intelligence resolver.
//!
//! All knobs have defaults tuned for production; a TOML file can override
//! any subset. Sections: `[whois]`, `[proxycheck]`, `[cache]`, `[bus]`.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::IntelError;

/// Top-level resolver configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntelConfig {
    /// Whois client configuration.
    #[serde(default)]
    pub whois: WhoisConfig,
    /// Proxy-reputation client configuration.
    #[serde(default)]
    pub proxycheck: ProxyCheckConfig,
    /// Cache and freshness-window configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Inter-process bus configuration.
    #[serde(default)]
    pub bus: BusConfig,
}

impl IntelConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IntelError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| IntelError::Config(format!("read {}: {}", path.as_ref().display(), e)))?;
        toml::from_str(&raw).map_err(|e| IntelError::Config(e.to_string()))
    }
}

/// Whois client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WhoisConfig {
    /// Registry host queried when no referral hint is cached
    /// (default: "whois.iana.org").
    #[serde(default = "default_whois_host")]
    pub default_host: String,
    /// Per-attempt socket timeout in seconds (default: 10).
    #[serde(default = "default_whois_timeout")]
    pub timeout_secs: u64,
    /// Maximum referral hops to follow (default: 5).
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    /// Host queried for ASN fallback when the walked registries omit it.
    /// APNIC/AFRINIC delegate ASN data here in practice.
    #[serde(default = "default_asn_fallback_host")]
    pub asn_fallback_host: String,
}

impl Default for WhoisConfig {
    fn default() -> Self {
        Self {
            default_host: default_whois_host(),
            timeout_secs: default_whois_timeout(),
            max_hops: default_max_hops(),
            asn_fallback_host: default_asn_fallback_host(),
        }
    }
}

impl WhoisConfig {
    /// Per-attempt timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_whois_host() -> String {
    "whois.iana.org".to_string()
}

fn default_whois_timeout() -> u64 {
    10
}

fn default_max_hops() -> u32 {
    5
}

fn default_asn_fallback_host() -> String {
    "whois.ripe.net".to_string()
}

/// Proxy-reputation client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyCheckConfig {
    /// Enable proxy checking (default: false). When disabled the resolver
    /// treats proxy status as always-fresh with `is_proxy = false`.
    #[serde(default)]
    pub enabled: bool,
    /// Base URL of the reputation API (default: "https://proxycheck.io/v2").
    #[serde(default = "default_proxycheck_url")]
    pub base_url: String,
    /// API key. Required by most providers for real traffic volumes.
    pub api_key: Option<String>,
    /// Per-attempt HTTP timeout in seconds (default: 10).
    #[serde(default = "default_proxycheck_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProxyCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_proxycheck_url(),
            api_key: None,
            timeout_secs: default_proxycheck_timeout(),
        }
    }
}

impl ProxyCheckConfig {
    /// Per-attempt timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_proxycheck_url() -> String {
    "https://proxycheck.io/v2".to_string()
}

fn default_proxycheck_timeout() -> u64 {
    10
}

/// Freshness windows and volatile cache TTLs.
///
/// Address verdicts cache long (bans are rare); user verdicts cache short
/// (moderation of logged-in users is more frequent).
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Lifetime of a whois range record in days (default: 14).
    #[serde(default = "default_whois_ttl_days")]
    pub whois_ttl_days: i64,
    /// Lifetime of a proxy-check record in days (default: 3).
    #[serde(default = "default_proxy_ttl_days")]
    pub proxy_ttl_days: i64,
    /// Lifetime of a synthesized placeholder range in hours (default: 24).
    /// Bounds retry frequency for addresses no registry knows about.
    #[serde(default = "default_placeholder_ttl_hours")]
    pub placeholder_ttl_hours: i64,
    /// Volatile cache TTL for address verdicts in seconds (default: 10800).
    #[serde(default = "default_address_verdict_ttl")]
    pub address_verdict_ttl_secs: u64,
    /// Volatile cache TTL for user verdicts in seconds (default: 600).
    #[serde(default = "default_user_verdict_ttl")]
    pub user_verdict_ttl_secs: u64,
    /// Grace period in milliseconds a settled de-duplicated result stays
    /// available to absorb request bursts (default: 200).
    #[serde(default = "default_dedup_grace_ms")]
    pub dedup_grace_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            whois_ttl_days: default_whois_ttl_days(),
            proxy_ttl_days: default_proxy_ttl_days(),
            placeholder_ttl_hours: default_placeholder_ttl_hours(),
            address_verdict_ttl_secs: default_address_verdict_ttl(),
            user_verdict_ttl_secs: default_user_verdict_ttl(),
            dedup_grace_ms: default_dedup_grace_ms(),
        }
    }
}

impl CacheConfig {
    /// Volatile cache TTL for address verdicts.
    pub fn address_verdict_ttl(&self) -> Duration {
        Duration::from_secs(self.address_verdict_ttl_secs)
    }

    /// Volatile cache TTL for user verdicts.
    pub fn user_verdict_ttl(&self) -> Duration {
        Duration::from_secs(self.user_verdict_ttl_secs)
    }

    /// De-duplication grace period.
    pub fn dedup_grace(&self) -> Duration {
        Duration::from_millis(self.dedup_grace_ms)
    }
}

fn default_whois_ttl_days() -> i64 {
    14
}

fn default_proxy_ttl_days() -> i64 {
    3
}

fn default_placeholder_ttl_hours() -> i64 {
    24
}

fn default_address_verdict_ttl() -> u64 {
    10800 // 3 hours
}

fn default_user_verdict_ttl() -> u64 {
    600 // 10 minutes
}

fn default_dedup_grace_ms() -> u64 {
    200
}

/// Inter-process bus configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// How long a forwarded intelligence request may wait for the primary
    /// shard before falling back to placeholder data, in seconds
    /// (default: 45 — two whois attempts plus a proxy check).
    #[serde(default = "default_bus_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_bus_timeout(),
        }
    }
}

impl BusConfig {
    /// Forwarded request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_bus_timeout() -> u64 {
    45
}

//! Shard forwarding: routing external lookups to one elected process.
//!
//! Registries rate-limit aggressively, so in a horizontally-scaled
//! deployment only the primary shard talks to the network. Every shard -
//! the primary included - sends its intelligence requests over the
//! inter-process bus and awaits the reply, keeping one code path and
//! ruling out two shards walking the same whois chain concurrently. The
//! real message bus is an external collaborator behind [`IntelBus`];
//! [`LocalBus`] plus [`AlwaysPrimary`] make a single-process deployment
//! trivially correct.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::addr::Address;
use crate::config::IntelConfig;
use crate::dedup::Dedup;
use crate::error::IntelError;
use crate::proxycheck::{ProxyCheckClient, ProxyCheckResult};
use crate::whois::{WhoisClient, WhoisResult};

/// Bus request type for intelligence lookups.
pub const INTEL_REQUEST: &str = "ip-intel";

/// A handler for one bus request type.
#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> serde_json::Value;
}

/// Request/response messaging between shards.
#[async_trait]
pub trait IntelBus: Send + Sync {
    /// Install the handler for a request type on this shard.
    fn register(&self, kind: &str, handler: Arc<dyn BusHandler>);

    /// Send a request and await the reply, bounded by `timeout`.
    async fn request(
        &self,
        kind: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, IntelError>;
}

/// Pluggable "am I the elected primary shard?" strategy.
pub trait ShardRole: Send + Sync {
    fn is_primary(&self) -> bool;
}

/// Single-process deployments are always primary.
#[derive(Debug, Default)]
pub struct AlwaysPrimary;

impl ShardRole for AlwaysPrimary {
    fn is_primary(&self) -> bool {
        true
    }
}

/// In-process bus: requests dispatch straight to the local handler.
#[derive(Default)]
pub struct LocalBus {
    handlers: DashMap<String, Arc<dyn BusHandler>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IntelBus for LocalBus {
    fn register(&self, kind: &str, handler: Arc<dyn BusHandler>) {
        self.handlers.insert(kind.to_string(), handler);
    }

    async fn request(
        &self,
        kind: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, IntelError> {
        let handler = self
            .handlers
            .get(kind)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| IntelError::BusNoHandler(kind.to_string()))?;

        tokio::time::timeout(timeout, handler.handle(payload))
            .await
            .map_err(|_| IntelError::BusTimeout)
    }
}

/// Forwarded lookup request payload.
#[derive(Debug, Serialize, Deserialize)]
struct IntelRequest {
    ip: String,
    whois: bool,
    proxy: bool,
    hint_host: Option<String>,
}

/// Forwarded lookup reply. `handled == false` is the non-primary
/// sentinel: nobody performed the lookup.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IntelResponse {
    pub handled: bool,
    pub whois: Option<WhoisResult>,
    pub proxy: Option<ProxyCheckResult>,
}

/// The primary shard's lookup executor, installed as the bus handler.
struct IntelHandler {
    role: Arc<dyn ShardRole>,
    whois: WhoisClient,
    proxy: ProxyCheckClient,
    whois_dedup: Dedup<WhoisResult>,
    proxy_dedup: Dedup<ProxyCheckResult>,
}

#[async_trait]
impl BusHandler for IntelHandler {
    async fn handle(&self, payload: serde_json::Value) -> serde_json::Value {
        let request: IntelRequest = match serde_json::from_value(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Malformed ip-intel request");
                return sentinel();
            }
        };
        if !self.role.is_primary() {
            return sentinel();
        }
        let addr = match Address::parse(&request.ip) {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "Unparseable address in ip-intel request");
                return sentinel();
            }
        };

        let whois = if request.whois {
            let key = format!("whois:{}", addr.hex());
            let hint = request.hint_host.clone();
            self.whois_dedup
                .run(&key, || self.whois.query(addr, hint.as_deref()))
                .await
        } else {
            None
        };

        let proxy = if request.proxy {
            let key = format!("proxy:{}", addr.hex());
            self.proxy_dedup
                .run(&key, || self.proxy.check_ip(addr))
                .await
        } else {
            None
        };

        serde_json::to_value(IntelResponse {
            handled: true,
            whois,
            proxy,
        })
        .unwrap_or_else(|_| sentinel())
    }
}

fn sentinel() -> serde_json::Value {
    serde_json::to_value(IntelResponse::default()).unwrap_or(serde_json::Value::Null)
}

/// Routes intelligence lookups over the bus to the primary shard.
pub struct ShardForwarder {
    bus: Arc<dyn IntelBus>,
    timeout: Duration,
}

impl ShardForwarder {
    /// Install this shard's handler and return the forwarder callers use.
    ///
    /// Every shard registers; only the primary's handler does real work.
    pub fn register(
        bus: Arc<dyn IntelBus>,
        role: Arc<dyn ShardRole>,
        config: &IntelConfig,
    ) -> Self {
        let handler = IntelHandler {
            role,
            whois: WhoisClient::new(config.whois.clone()),
            proxy: ProxyCheckClient::new(config.proxycheck.clone()),
            whois_dedup: Dedup::with_grace(config.cache.dedup_grace()),
            proxy_dedup: Dedup::with_grace(config.cache.dedup_grace()),
        };
        bus.register(INTEL_REQUEST, Arc::new(handler));

        Self {
            bus,
            timeout: config.bus.request_timeout(),
        }
    }

    /// Forward one lookup request and await the reply.
    ///
    /// Unreachable primary, timeout, or a sentinel reply all come back as
    /// an unhandled response; the resolver degrades to placeholders.
    pub async fn fetch(
        &self,
        addr: Address,
        need_whois: bool,
        need_proxy: bool,
        hint_host: Option<String>,
    ) -> IntelResponse {
        let payload = match serde_json::to_value(IntelRequest {
            ip: addr.canonical(),
            whois: need_whois,
            proxy: need_proxy,
            hint_host,
        }) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Failed to encode ip-intel request");
                return IntelResponse::default();
            }
        };

        match self.bus.request(INTEL_REQUEST, payload, self.timeout).await {
            Ok(reply) => serde_json::from_value(reply).unwrap_or_else(|e| {
                warn!(error = %e, "Malformed ip-intel reply");
                IntelResponse::default()
            }),
            Err(e) => {
                debug!(ip = %addr, error = %e, "Forwarded lookup failed");
                IntelResponse::default()
            }
        }
    }
}

//! Top-level allowance resolution.
//!
//! `AllowanceResolver` is the one entry point request handlers call: give
//! it a client address (and optionally a user id) and get back a verdict
//! saying whether the client may place pixels or chat, plus the country
//! and proxy facts the decision rests on. Internally it layers the
//! volatile verdict cache over the durable store over forwarded network
//! lookups, and degrades through placeholders rather than failing: a
//! client is never blocked because a registry was slow.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::addr::Address;
use crate::cache::{MemoryVerdictCache, VerdictCache, VerdictKey};
use crate::config::IntelConfig;
use crate::proxycheck::ProxyCheckResult;
use crate::range::cidr_of;
use crate::shard::{AlwaysPrimary, IntelBus, LocalBus, ShardForwarder};
use crate::store::{Database, IpRange, ProxyRecord, RangeFacts};
use crate::whois::WhoisResult;

/// The outcome of resolving one client.
///
/// `is_banned` gates pixel placement, `is_muted` gates chat; the two are
/// independent. Expiry timestamps let consumers schedule their own
/// refreshes without re-deriving TTL policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceVerdict {
    pub is_banned: bool,
    pub is_proxy: bool,
    pub is_muted: bool,
    /// ISO 3166-1 alpha-2 country code, lowercase.
    pub country: Option<String>,
    pub whois_expires_at: i64,
    pub proxy_check_expires_at: i64,
}

impl AllowanceVerdict {
    /// Whether this client may place pixels.
    pub fn allows_placement(&self) -> bool {
        !self.is_banned && !self.is_proxy
    }

    /// Whether this client may chat.
    pub fn allows_chat(&self) -> bool {
        !self.is_muted
    }

    /// Fail-open verdict for an address nothing is known about. Expires
    /// immediately so the next resolution tries again.
    fn unknown(now: i64) -> Self {
        Self {
            is_banned: false,
            is_proxy: false,
            is_muted: false,
            country: None,
            whois_expires_at: now,
            proxy_check_expires_at: now,
        }
    }
}

/// Ownership and reputation facts for one address, for moderation tooling.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RangeInfo {
    pub address: String,
    pub country: Option<String>,
    pub org: Option<String>,
    pub asn: Option<u32>,
    pub cidr: Option<String>,
    pub is_proxy: bool,
    pub is_whitelisted: bool,
}

/// Upper bound on addresses answered per [`AllowanceResolver::get_range_info`]
/// call. Moderation views paginate beyond this.
const RANGE_INFO_LIMIT: usize = 300;

/// Resolves client addresses to allowance verdicts.
pub struct AllowanceResolver {
    db: Database,
    cache: Arc<dyn VerdictCache>,
    forwarder: Arc<ShardForwarder>,
    config: IntelConfig,
}

impl AllowanceResolver {
    pub fn new(
        db: Database,
        cache: Arc<dyn VerdictCache>,
        forwarder: Arc<ShardForwarder>,
        config: IntelConfig,
    ) -> Self {
        Self {
            db,
            cache,
            forwarder,
            config,
        }
    }

    /// Wire up a resolver for a single-process deployment: in-memory
    /// verdict cache, local bus, this process as the primary shard.
    pub fn single_process(db: Database, config: IntelConfig) -> Self {
        let bus: Arc<dyn IntelBus> = Arc::new(LocalBus::new());
        let forwarder = Arc::new(ShardForwarder::register(
            bus,
            Arc::new(AlwaysPrimary),
            &config,
        ));
        Self::new(db, Arc::new(MemoryVerdictCache::new()), forwarder, config)
    }

    /// Resolve one client to a verdict.
    ///
    /// When `user_id` is given the verdict is cached under the user (short
    /// TTL); otherwise under the address (long TTL). `force` bypasses both
    /// the verdict cache and stored-record freshness, for moderator
    /// re-checks. Never returns an error: on any internal failure the
    /// verdict degrades toward fail-open placeholder data.
    pub async fn resolve(&self, ip: &str, user_id: Option<i64>, force: bool) -> AllowanceVerdict {
        let now = Utc::now().timestamp();
        let addr = match Address::parse(ip) {
            Ok(a) => a,
            Err(e) => {
                warn!(ip, error = %e, "Unparseable client address, allowing");
                return AllowanceVerdict::unknown(now);
            }
        };

        // User verdicts and address verdicts live in separate namespaces;
        // a user verdict is never answered from an address entry, since
        // the address entry was computed without that user's bans.
        let key = match user_id {
            Some(id) => VerdictKey::User(id),
            None => VerdictKey::Address(addr),
        };
        if !force && let Some(verdict) = self.cache.get(&key).await {
            return verdict;
        }

        let verdict = self.resolve_uncached(addr, user_id, force, now).await;

        let ttl = match key {
            VerdictKey::User(_) => self.config.cache.user_verdict_ttl(),
            VerdictKey::Address(_) => self.config.cache.address_verdict_ttl(),
        };
        self.cache.set(&key, verdict.clone(), ttl).await;
        verdict
    }

    /// Drop the cached verdict for an address. Ban mutations call this.
    pub async fn invalidate_address(&self, ip: &str) {
        if let Ok(addr) = Address::parse(ip) {
            self.cache.invalidate(&VerdictKey::Address(addr)).await;
        }
    }

    /// Drop the cached verdict for a user. Ban mutations call this.
    pub async fn invalidate_user(&self, user_id: i64) {
        self.cache.invalidate(&VerdictKey::User(user_id)).await;
    }

    /// Store-only facts for a batch of addresses, for moderation views.
    /// Never triggers network lookups; unknown addresses come back empty.
    /// Capped at [`RANGE_INFO_LIMIT`] entries.
    pub async fn get_range_info(&self, ips: &[String]) -> Vec<RangeInfo> {
        let tasks = ips.iter().take(RANGE_INFO_LIMIT).map(|ip| async move {
            let mut info = RangeInfo {
                address: ip.clone(),
                ..RangeInfo::default()
            };
            let Ok(addr) = Address::parse(ip) else {
                return info;
            };
            let repo = self.db.intel();
            match repo.get_range_of(addr).await {
                Ok(RangeFacts {
                    range: Some(range), ..
                }) => {
                    info.cidr = Some(range.cidr_text());
                    info.country = range.country;
                    info.org = range.org;
                    info.asn = range.asn;
                }
                Ok(_) => {}
                Err(e) => debug!(ip, error = %e, "Range info read failed"),
            }
            if let Ok(Some(proxy)) = repo.get_proxy_record_of(addr).await {
                info.is_proxy = proxy.is_proxy;
            }
            if let Ok(whitelisted) = repo.is_whitelisted(addr).await {
                info.is_whitelisted = whitelisted;
            }
            info
        });
        futures_util::future::join_all(tasks).await
    }

    /// The cache-miss path: stored facts, forwarded refresh of whatever is
    /// stale, write-back, ban overlay.
    async fn resolve_uncached(
        &self,
        addr: Address,
        user_id: Option<i64>,
        force: bool,
        now: i64,
    ) -> AllowanceVerdict {
        let repo = self.db.intel();
        let proxy_enabled = self.config.proxycheck.enabled;

        let facts = match repo.get_range_of(addr).await {
            Ok(facts) => facts,
            Err(e) => {
                warn!(ip = %addr, error = %e, "Range read failed");
                RangeFacts::default()
            }
        };
        let stored_proxy = if proxy_enabled {
            match repo.get_proxy_record_of(addr).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(ip = %addr, error = %e, "Proxy record read failed");
                    None
                }
            }
        } else {
            None
        };

        // Each fact ages independently; refresh only what is stale.
        let whois_fresh = !force && facts.range.as_ref().is_some_and(|r| r.is_fresh(now));
        let proxy_fresh =
            !proxy_enabled || (!force && stored_proxy.as_ref().is_some_and(|p| p.is_fresh(now)));

        let (range, proxy) = if whois_fresh && proxy_fresh {
            if let Err(e) = repo.touch_address(addr, facts.range.as_ref().map(|r| r.id)).await {
                debug!(ip = %addr, error = %e, "Address touch failed");
            }
            (facts.range, stored_proxy)
        } else {
            self.refresh(addr, &facts, stored_proxy, whois_fresh, proxy_fresh, now)
                .await
        };

        let mut is_banned = false;
        let mut is_muted = false;
        let range_id = range.as_ref().map(|r| r.id);
        match repo.get_ban_infos_for(addr, range_id, user_id).await {
            Ok(bans) => {
                for ban in &bans {
                    is_banned |= ban.bans_placement();
                    is_muted |= ban.bans_chat();
                }
            }
            Err(e) => warn!(ip = %addr, error = %e, "Ban read failed, allowing"),
        }

        let placeholder_expiry = now + self.config.cache.placeholder_ttl_hours * 3600;
        AllowanceVerdict {
            is_banned,
            is_muted,
            is_proxy: proxy_enabled && proxy.as_ref().is_some_and(|p| p.is_proxy),
            country: range.as_ref().and_then(|r| r.country.clone()),
            whois_expires_at: range
                .as_ref()
                .map(|r| r.expires_at)
                .unwrap_or(placeholder_expiry),
            proxy_check_expires_at: if proxy_enabled {
                proxy
                    .as_ref()
                    .map(|p| p.expires_at)
                    .unwrap_or(placeholder_expiry)
            } else {
                // Disabled means never stale.
                i64::MAX
            },
        }
    }

    /// Forward a lookup for the stale facts and persist the outcome.
    /// Failed lookups persist placeholders so retry frequency stays
    /// bounded. Returns the post-refresh view of the store.
    async fn refresh(
        &self,
        addr: Address,
        facts: &RangeFacts,
        stored_proxy: Option<ProxyRecord>,
        whois_fresh: bool,
        proxy_fresh: bool,
        now: i64,
    ) -> (Option<IpRange>, Option<ProxyRecord>) {
        let hint_host = facts
            .hint
            .as_ref()
            .filter(|h| h.is_fresh(now))
            .map(|h| h.host.clone());
        let reply = self
            .forwarder
            .fetch(addr, !whois_fresh, !proxy_fresh, hint_host)
            .await;

        let placeholder_expiry = now + self.config.cache.placeholder_ttl_hours * 3600;

        let whois_save: Option<(WhoisResult, i64)> = if whois_fresh {
            None
        } else {
            match reply.whois {
                Some(result) => {
                    Some((result, now + self.config.cache.whois_ttl_days * 86_400))
                }
                None => {
                    // Total whois failure. Re-pin the stale record if one
                    // exists, else synthesize a coarse placeholder block.
                    let result = match &facts.range {
                        Some(range) => range_to_whois(range),
                        None => placeholder_whois(addr),
                    };
                    Some((result, placeholder_expiry))
                }
            }
        };

        let proxy_save: Option<(ProxyCheckResult, i64)> = if proxy_fresh {
            None
        } else {
            match reply.proxy {
                Some(result) => {
                    Some((result, now + self.config.cache.proxy_ttl_days * 86_400))
                }
                None => {
                    // Fail open: keep the stale answer if there is one,
                    // otherwise record not-a-proxy for the placeholder TTL.
                    let result = stored_proxy
                        .as_ref()
                        .map(record_to_result)
                        .unwrap_or_default();
                    Some((result, placeholder_expiry))
                }
            }
        };

        let repo = self.db.intel();
        if let Err(e) = repo
            .save_whois_and_proxy(
                addr,
                whois_save.as_ref().map(|(w, exp)| (w, *exp)),
                proxy_save.as_ref().map(|(p, exp)| (p, *exp)),
            )
            .await
        {
            warn!(ip = %addr, error = %e, "Lookup write-back failed");
        }

        // Re-read so the verdict reflects exactly what the store now
        // holds, whatever subset of the write-back succeeded.
        let range = match repo.get_range_of(addr).await {
            Ok(facts) => facts.range,
            Err(e) => {
                warn!(ip = %addr, error = %e, "Post-refresh range read failed");
                None
            }
        };
        let proxy = if self.config.proxycheck.enabled {
            repo.get_proxy_record_of(addr).await.ok().flatten()
        } else {
            None
        };
        (range, proxy)
    }
}

/// Rebuild the save payload for an existing stored range.
fn range_to_whois(range: &IpRange) -> WhoisResult {
    WhoisResult {
        start: range.start,
        end: range.end,
        mask_bits: range.mask_bits,
        country: range.country.clone(),
        org: range.org.clone(),
        descr: range.descr.clone(),
        asn: range.asn,
        referral: None,
    }
}

/// Coarse block around an address nothing is known about: /24 for IPv4,
/// /56 for IPv6.
fn placeholder_whois(addr: Address) -> WhoisResult {
    let block = cidr_of(addr.num(), addr.width(), addr.family().placeholder_mask());
    WhoisResult {
        start: block.start,
        end: block.end,
        mask_bits: block.mask_bits,
        country: None,
        org: None,
        descr: None,
        asn: None,
        referral: None,
    }
}

fn record_to_result(record: &ProxyRecord) -> ProxyCheckResult {
    ProxyCheckResult {
        is_proxy: record.is_proxy,
        kind: record.kind.clone(),
        operator: record.operator.clone(),
        city: record.city.clone(),
        devices: record.devices,
        subnet_devices: record.subnet_devices,
    }
}

//! Volatile allow/ban verdict cache.
//!
//! Consulted before the durable store on every resolution. The cache is
//! eventually-consistent and non-authoritative: it is always safe to
//! bypass, entries are last-writer-wins, and ban mutations delete the
//! entry rather than updating it in place. The production deployment puts
//! a shared key-value server behind [`VerdictCache`]; the in-memory
//! implementation here serves single-process deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::addr::Address;
use crate::resolver::AllowanceVerdict;

/// Key of a cached verdict. Address and user verdicts live in distinct
/// namespaces with different TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerdictKey {
    Address(Address),
    User(i64),
}

impl VerdictKey {
    /// Namespaced cache key string.
    pub fn cache_key(&self) -> String {
        match self {
            VerdictKey::Address(addr) => format!("ip:{}", addr.hex()),
            VerdictKey::User(id) => format!("uid:{}", id),
        }
    }
}

/// Short-TTL verdict cache, keyed by address or user id.
#[async_trait]
pub trait VerdictCache: Send + Sync {
    /// Fetch a fresh verdict, if one is cached.
    async fn get(&self, key: &VerdictKey) -> Option<AllowanceVerdict>;

    /// Store a verdict for `ttl`.
    async fn set(&self, key: &VerdictKey, verdict: AllowanceVerdict, ttl: Duration);

    /// Drop a cached verdict. Ban/unban mutators call this; the entry is
    /// deleted rather than rewritten to avoid racing a concurrent refresh.
    async fn invalidate(&self, key: &VerdictKey);
}

/// A cached verdict with expiry.
#[derive(Debug, Clone)]
struct CachedVerdict {
    verdict: AllowanceVerdict,
    expires_at: Instant,
}

/// In-process [`VerdictCache`] with lazy TTL expiration.
#[derive(Debug, Default)]
pub struct MemoryVerdictCache {
    entries: DashMap<String, CachedVerdict>,
}

impl MemoryVerdictCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Called opportunistically; correctness never
    /// depends on it because reads check expiry themselves.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl VerdictCache for MemoryVerdictCache {
    async fn get(&self, key: &VerdictKey) -> Option<AllowanceVerdict> {
        let entry = self.entries.get(&key.cache_key())?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        debug!(key = %key.cache_key(), "Verdict cache hit");
        Some(entry.verdict.clone())
    }

    async fn set(&self, key: &VerdictKey, verdict: AllowanceVerdict, ttl: Duration) {
        self.entries.insert(
            key.cache_key(),
            CachedVerdict {
                verdict,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn invalidate(&self, key: &VerdictKey) {
        self.entries.remove(&key.cache_key());
    }
}

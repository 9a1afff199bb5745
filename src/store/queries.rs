//! Query methods for the intelligence store.

use sqlx::SqlitePool;

use crate::addr::Address;
use crate::error::IntelError;
use crate::proxycheck::ProxyCheckResult;
use crate::store::models::{
    BanRecord, IpRange, ProxyRecord, RangeFacts, ReferralHint, span_key, span_num,
};
use crate::whois::WhoisResult;

/// Repository for intelligence records.
pub struct IntelRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> IntelRepository<'a> {
    /// Create a new repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch the stored ownership facts for an address: the most specific
    /// range covering it (fresh or stale - staleness is the caller's
    /// decision) and a fresh referral hint if one exists.
    pub async fn get_range_of(&self, addr: Address) -> Result<RangeFacts, IntelError> {
        let key = addr.key_bytes();
        let key_len = key.len() as i64;
        let now = chrono::Utc::now().timestamp();

        let range_row = sqlx::query_as::<
            _,
            (
                i64,
                Vec<u8>,
                Vec<u8>,
                i64,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<i64>,
                i64,
            ),
        >(
            r#"
            SELECT id, min_key, max_key, mask_bits, country, org, descr, asn, expires_at
            FROM ip_ranges
            WHERE length(min_key) = ? AND min_key <= ? AND max_key >= ?
            ORDER BY mask_bits DESC
            LIMIT 1
            "#,
        )
        .bind(key_len)
        .bind(&key)
        .bind(&key)
        .fetch_optional(self.pool)
        .await?;

        let range = range_row.map(
            |(id, min_key, max_key, mask_bits, country, org, descr, asn, expires_at)| IpRange {
                id,
                family: addr.family(),
                start: span_num(&min_key),
                end: span_num(&max_key),
                mask_bits: mask_bits as u8,
                country,
                org,
                descr,
                asn: asn.map(|a| a as u32),
                expires_at,
            },
        );

        let hint_row = sqlx::query_as::<_, (Vec<u8>, Vec<u8>, i64, String, i64)>(
            r#"
            SELECT min_key, max_key, mask_bits, host, expires_at
            FROM referral_hints
            WHERE length(min_key) = ? AND min_key <= ? AND max_key >= ? AND expires_at > ?
            ORDER BY mask_bits DESC
            LIMIT 1
            "#,
        )
        .bind(key_len)
        .bind(&key)
        .bind(&key)
        .bind(now)
        .fetch_optional(self.pool)
        .await?;

        let hint = hint_row.map(|(min_key, max_key, mask_bits, host, expires_at)| ReferralHint {
            start: span_num(&min_key),
            end: span_num(&max_key),
            mask_bits: mask_bits as u8,
            host,
            expires_at,
        });

        Ok(RangeFacts { range, hint })
    }

    /// Fetch the proxy record for an address, fresh or stale.
    pub async fn get_proxy_record_of(&self, addr: Address) -> Result<Option<ProxyRecord>, IntelError> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<i64>,
                Option<i64>,
                i64,
            ),
        >(
            r#"
            SELECT is_proxy, proxy_type, operator, city, devices, subnet_devices, expires_at
            FROM proxy_records
            WHERE address_key = ?
            "#,
        )
        .bind(addr.key_bytes())
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(
            |(is_proxy, kind, operator, city, devices, subnet_devices, expires_at)| ProxyRecord {
                is_proxy: is_proxy != 0,
                kind,
                operator,
                city,
                devices,
                subnet_devices,
                expires_at,
            },
        ))
    }

    /// Persist the outcome of a lookup as one transaction: upsert the
    /// range by its (min,max) key, upsert the proxy record by address
    /// key, upsert the referral hint, and link the address to its range
    /// with a last-seen touch. All-or-nothing, so a concurrent resolution
    /// never reads a half-applied record.
    ///
    /// Returns the id of the linked range row, when a range was written.
    pub async fn save_whois_and_proxy(
        &self,
        addr: Address,
        whois: Option<(&WhoisResult, i64)>,
        proxy: Option<(&ProxyCheckResult, i64)>,
    ) -> Result<Option<i64>, IntelError> {
        let now = chrono::Utc::now().timestamp();
        let family = addr.family();
        let mut tx = self.pool.begin().await?;

        let mut range_id = None;
        if let Some((result, expires_at)) = whois {
            let id = sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO ip_ranges (min_key, max_key, mask_bits, country, org, descr, asn, expires_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (min_key, max_key) DO UPDATE SET
                    mask_bits = excluded.mask_bits,
                    country = excluded.country,
                    org = excluded.org,
                    descr = excluded.descr,
                    asn = excluded.asn,
                    expires_at = excluded.expires_at
                RETURNING id
                "#,
            )
            .bind(span_key(result.start, family))
            .bind(span_key(result.end, family))
            .bind(result.mask_bits as i64)
            .bind(&result.country)
            .bind(&result.org)
            .bind(&result.descr)
            .bind(result.asn.map(|a| a as i64))
            .bind(expires_at)
            .fetch_one(&mut *tx)
            .await?;
            range_id = Some(id);

            if let Some(referral) = &result.referral {
                sqlx::query(
                    r#"
                    INSERT INTO referral_hints (min_key, max_key, mask_bits, host, expires_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT (min_key, max_key) DO UPDATE SET
                        mask_bits = excluded.mask_bits,
                        host = excluded.host,
                        expires_at = excluded.expires_at
                    "#,
                )
                .bind(span_key(referral.start, family))
                .bind(span_key(referral.end, family))
                .bind(referral.mask_bits as i64)
                .bind(&referral.host)
                .bind(expires_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        if let Some((result, expires_at)) = proxy {
            sqlx::query(
                r#"
                INSERT INTO proxy_records
                    (address_key, is_proxy, proxy_type, operator, city, devices, subnet_devices, expires_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (address_key) DO UPDATE SET
                    is_proxy = excluded.is_proxy,
                    proxy_type = excluded.proxy_type,
                    operator = excluded.operator,
                    city = excluded.city,
                    devices = excluded.devices,
                    subnet_devices = excluded.subnet_devices,
                    expires_at = excluded.expires_at
                "#,
            )
            .bind(addr.key_bytes())
            .bind(result.is_proxy as i64)
            .bind(&result.kind)
            .bind(&result.operator)
            .bind(&result.city)
            .bind(result.devices)
            .bind(result.subnet_devices)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO ip_addresses (address_key, range_id, last_seen)
            VALUES (?, ?, ?)
            ON CONFLICT (address_key) DO UPDATE SET
                range_id = COALESCE(excluded.range_id, range_id),
                last_seen = excluded.last_seen
            "#,
        )
        .bind(addr.key_bytes())
        .bind(range_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(range_id)
    }

    /// Update an address's last-seen timestamp (and range link when known)
    /// without touching intelligence records.
    pub async fn touch_address(
        &self,
        addr: Address,
        range_id: Option<i64>,
    ) -> Result<(), IntelError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO ip_addresses (address_key, range_id, last_seen)
            VALUES (?, ?, ?)
            ON CONFLICT (address_key) DO UPDATE SET
                range_id = COALESCE(excluded.range_id, range_id),
                last_seen = excluded.last_seen
            "#,
        )
        .bind(addr.key_bytes())
        .bind(range_id)
        .bind(now)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Active bans applying to an address, its range, or a user -
    /// OR-combined, with expiry filtered at read time. Expired rows stay
    /// in place for the periodic sweep.
    pub async fn get_ban_infos_for(
        &self,
        addr: Address,
        range_id: Option<i64>,
        user_id: Option<i64>,
    ) -> Result<Vec<BanRecord>, IntelError> {
        let now = chrono::Utc::now().timestamp();
        let rows = sqlx::query_as::<_, (i64, i64, Option<String>, Option<i64>)>(
            r#"
            SELECT id, flags, reason, expires_at
            FROM bans
            WHERE (address_key = ? OR range_id = ? OR user_id = ?)
              AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(addr.key_bytes())
        .bind(range_id)
        .bind(user_id)
        .bind(now)
        .fetch_all(self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, flags, reason, expires_at)| BanRecord {
                id,
                flags,
                reason,
                expires_at,
            })
            .collect())
    }

    /// Record a ban. Owned by the moderation subsystem; exposed here so it
    /// (and tests) share one write path.
    pub async fn add_ban(
        &self,
        addr: Option<Address>,
        range_id: Option<i64>,
        user_id: Option<i64>,
        flags: i64,
        reason: Option<&str>,
        duration: Option<i64>,
    ) -> Result<i64, IntelError> {
        let now = chrono::Utc::now().timestamp();
        let expires_at = duration.map(|d| now + d);
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO bans (address_key, range_id, user_id, flags, reason, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(addr.map(|a| a.key_bytes()))
        .bind(range_id)
        .bind(user_id)
        .bind(flags)
        .bind(reason)
        .bind(expires_at)
        .fetch_one(self.pool)
        .await?;
        Ok(id)
    }

    /// Remove a ban by id.
    pub async fn remove_ban(&self, id: i64) -> Result<bool, IntelError> {
        let result = sqlx::query("DELETE FROM bans WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Whether an address is exempt from rate limits.
    pub async fn is_whitelisted(&self, addr: Address) -> Result<bool, IntelError> {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT EXISTS (SELECT 1 FROM whitelist WHERE address_key = ?)",
        )
        .bind(addr.key_bytes())
        .fetch_one(self.pool)
        .await?;
        Ok(exists != 0)
    }

    /// Add an address to the rate-limit whitelist.
    pub async fn add_whitelist(&self, addr: Address) -> Result<(), IntelError> {
        sqlx::query("INSERT OR IGNORE INTO whitelist (address_key) VALUES (?)")
            .bind(addr.key_bytes())
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Delete expired bans, referral hints, and proxy records. Range rows
    /// are never swept; they are replaced in place on refresh.
    pub async fn cleanup_expired(&self) -> Result<u64, IntelError> {
        let now = chrono::Utc::now().timestamp();
        let mut removed = 0;

        for sql in [
            "DELETE FROM bans WHERE expires_at IS NOT NULL AND expires_at <= ?",
            "DELETE FROM referral_hints WHERE expires_at <= ?",
            "DELETE FROM proxy_records WHERE expires_at <= ?",
        ] {
            removed += sqlx::query(sql).bind(now).execute(self.pool).await?.rows_affected();
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use crate::whois::Referral;

    fn whois_result() -> WhoisResult {
        WhoisResult {
            start: 0xc000_0200,
            end: 0xc000_02ff,
            mask_bits: 24,
            country: Some("nl".to_string()),
            org: Some("Example B.V.".to_string()),
            descr: Some("Example Networks".to_string()),
            asn: Some(64500),
            referral: Some(Referral {
                host: "whois.ripe.net".to_string(),
                start: 0xc000_0000,
                end: 0xc0ff_ffff,
                mask_bits: 8,
            }),
        }
    }

    fn proxy_result() -> ProxyCheckResult {
        ProxyCheckResult {
            is_proxy: true,
            kind: Some("VPN".to_string()),
            operator: Some("ExampleVPN".to_string()),
            city: Some("Amsterdam".to_string()),
            devices: Some(3),
            subnet_devices: Some(17),
        }
    }

    #[tokio::test]
    async fn test_save_and_read_back() {
        let db = Database::new(":memory:").await.unwrap();
        let addr = Address::parse("192.0.2.5").unwrap();
        let future = chrono::Utc::now().timestamp() + 3600;

        let range_id = db
            .intel()
            .save_whois_and_proxy(addr, Some((&whois_result(), future)), Some((&proxy_result(), future)))
            .await
            .unwrap();
        assert!(range_id.is_some());

        let facts = db.intel().get_range_of(addr).await.unwrap();
        let range = facts.range.unwrap();
        assert_eq!(range.start, 0xc000_0200);
        assert_eq!(range.end, 0xc000_02ff);
        assert_eq!(range.country.as_deref(), Some("nl"));
        assert_eq!(range.asn, Some(64500));
        assert!(range.is_fresh(chrono::Utc::now().timestamp()));

        let hint = facts.hint.unwrap();
        assert_eq!(hint.host, "whois.ripe.net");
        assert_eq!(hint.mask_bits, 8);

        let proxy = db.intel().get_proxy_record_of(addr).await.unwrap().unwrap();
        assert!(proxy.is_proxy);
        assert_eq!(proxy.subnet_devices, Some(17));
    }

    #[tokio::test]
    async fn test_upsert_replaces_in_place() {
        let db = Database::new(":memory:").await.unwrap();
        let addr = Address::parse("192.0.2.5").unwrap();
        let future = chrono::Utc::now().timestamp() + 3600;

        let first = db
            .intel()
            .save_whois_and_proxy(addr, Some((&whois_result(), future)), None)
            .await
            .unwrap()
            .unwrap();

        let mut updated = whois_result();
        updated.country = Some("de".to_string());
        let second = db
            .intel()
            .save_whois_and_proxy(addr, Some((&updated, future + 100)), None)
            .await
            .unwrap()
            .unwrap();

        // Same (min,max) span keeps the same row id, fields refreshed.
        assert_eq!(first, second);
        let facts = db.intel().get_range_of(addr).await.unwrap();
        let range = facts.range.unwrap();
        assert_eq!(range.country.as_deref(), Some("de"));
        assert_eq!(range.expires_at, future + 100);
    }

    #[tokio::test]
    async fn test_most_specific_range_wins() {
        let db = Database::new(":memory:").await.unwrap();
        let addr = Address::parse("192.0.2.5").unwrap();
        let future = chrono::Utc::now().timestamp() + 3600;

        let wide = WhoisResult {
            start: 0xc000_0000,
            end: 0xc0ff_ffff,
            mask_bits: 8,
            country: Some("eu".to_string()),
            org: None,
            descr: None,
            asn: None,
            referral: None,
        };
        let narrow = whois_result();

        db.intel()
            .save_whois_and_proxy(addr, Some((&wide, future)), None)
            .await
            .unwrap();
        db.intel()
            .save_whois_and_proxy(addr, Some((&narrow, future)), None)
            .await
            .unwrap();

        let facts = db.intel().get_range_of(addr).await.unwrap();
        assert_eq!(facts.range.unwrap().mask_bits, 24);
    }

    #[tokio::test]
    async fn test_families_do_not_mix() {
        let db = Database::new(":memory:").await.unwrap();
        let v4 = Address::parse("192.0.2.5").unwrap();
        let v6 = Address::parse("2001:db8::1").unwrap();
        let future = chrono::Utc::now().timestamp() + 3600;

        db.intel()
            .save_whois_and_proxy(v4, Some((&whois_result(), future)), None)
            .await
            .unwrap();

        // An IPv6 key must never match an IPv4 span, whatever the bytes say.
        let facts = db.intel().get_range_of(v6).await.unwrap();
        assert!(facts.range.is_none());
    }

    #[tokio::test]
    async fn test_ban_or_combination() {
        let db = Database::new(":memory:").await.unwrap();
        let addr = Address::parse("192.0.2.5").unwrap();
        let other = Address::parse("198.51.100.1").unwrap();
        let future = chrono::Utc::now().timestamp() + 3600;

        let range_id = db
            .intel()
            .save_whois_and_proxy(addr, Some((&whois_result(), future)), None)
            .await
            .unwrap();

        let repo = db.intel();
        repo.add_ban(Some(addr), None, None, 0b01, Some("spam"), None)
            .await
            .unwrap();
        repo.add_ban(None, range_id, None, 0b10, None, None)
            .await
            .unwrap();
        repo.add_ban(None, None, Some(7), 0b11, None, None)
            .await
            .unwrap();
        // Expired ban must not surface.
        repo.add_ban(Some(addr), None, None, 0b01, None, Some(-10))
            .await
            .unwrap();

        let bans = repo.get_ban_infos_for(addr, range_id, Some(7)).await.unwrap();
        assert_eq!(bans.len(), 3);

        let none = repo.get_ban_infos_for(other, None, None).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_expired_sweeps_rows() {
        let db = Database::new(":memory:").await.unwrap();
        let addr = Address::parse("192.0.2.5").unwrap();
        let past = chrono::Utc::now().timestamp() - 10;

        db.intel()
            .save_whois_and_proxy(addr, Some((&whois_result(), past)), Some((&proxy_result(), past)))
            .await
            .unwrap();
        db.intel()
            .add_ban(Some(addr), None, None, 1, None, Some(-10))
            .await
            .unwrap();

        // Hint + proxy + ban are expired; the range row stays.
        let removed = db.intel().cleanup_expired().await.unwrap();
        assert_eq!(removed, 3);
        let facts = db.intel().get_range_of(addr).await.unwrap();
        assert!(facts.range.is_some());
        assert!(facts.hint.is_none());
    }

    #[tokio::test]
    async fn test_whitelist() {
        let db = Database::new(":memory:").await.unwrap();
        let addr = Address::parse("192.0.2.5").unwrap();

        assert!(!db.intel().is_whitelisted(addr).await.unwrap());
        db.intel().add_whitelist(addr).await.unwrap();
        assert!(db.intel().is_whitelisted(addr).await.unwrap());
        // Idempotent.
        db.intel().add_whitelist(addr).await.unwrap();
        assert!(db.intel().is_whitelisted(addr).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_ban() {
        let db = Database::new(":memory:").await.unwrap();
        let addr = Address::parse("192.0.2.5").unwrap();

        let id = db
            .intel()
            .add_ban(Some(addr), None, None, 1, None, None)
            .await
            .unwrap();
        assert!(db.intel().remove_ban(id).await.unwrap());
        assert!(!db.intel().remove_ban(id).await.unwrap());
        let bans = db.intel().get_ban_infos_for(addr, None, None).await.unwrap();
        assert!(bans.is_empty());
    }
}

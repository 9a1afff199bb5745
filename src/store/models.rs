//! Row models for the intelligence store.

use crate::addr::{Address, Family};

/// A whois-derived ownership block.
///
/// `start`/`end` are numeric keys in the family's width; rows are unique
/// on their (min,max) key pair and replaced in place on refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRange {
    pub id: i64,
    pub family: Family,
    pub start: u64,
    pub end: u64,
    pub mask_bits: u8,
    pub country: Option<String>,
    pub org: Option<String>,
    pub descr: Option<String>,
    pub asn: Option<u32>,
    /// Unix timestamp after which this record is stale.
    pub expires_at: i64,
}

impl IpRange {
    /// Whether the record is still fresh at `now`.
    pub fn is_fresh(&self, now: i64) -> bool {
        self.expires_at > now
    }

    /// CIDR text for moderation tooling.
    pub fn cidr_text(&self) -> String {
        let addr = match self.family {
            Family::V4 => Address::parse(&std::net::Ipv4Addr::from(self.start as u32).to_string()),
            Family::V6 => Address::from_key_bytes(&self.start.to_be_bytes()),
        };
        match addr {
            Ok(a) => format!("{}/{}", a.canonical(), self.mask_bits),
            Err(_) => format!("{:x}/{}", self.start, self.mask_bits),
        }
    }
}

/// Cached "ask this whois host first" hint for a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferralHint {
    pub start: u64,
    pub end: u64,
    pub mask_bits: u8,
    pub host: String,
    pub expires_at: i64,
}

impl ReferralHint {
    /// Whether the hint is still usable at `now`.
    pub fn is_fresh(&self, now: i64) -> bool {
        self.expires_at > now
    }
}

/// Per-address proxy-reputation record. Host-specific, not block-specific.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRecord {
    pub is_proxy: bool,
    pub kind: Option<String>,
    pub operator: Option<String>,
    pub city: Option<String>,
    pub devices: Option<i64>,
    pub subnet_devices: Option<i64>,
    pub expires_at: i64,
}

impl ProxyRecord {
    /// Whether the record is still fresh at `now`.
    pub fn is_fresh(&self, now: i64) -> bool {
        self.expires_at > now
    }
}

/// A ban row, written by the moderation subsystem and read here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRecord {
    pub id: i64,
    /// bit 0 = placement ban, bit 1 = chat ban.
    pub flags: i64,
    pub reason: Option<String>,
    /// `None` means permanent.
    pub expires_at: Option<i64>,
}

impl BanRecord {
    /// Whether the ban is active at `now`.
    pub fn is_active(&self, now: i64) -> bool {
        match self.expires_at {
            Some(expires) => expires > now,
            None => true,
        }
    }

    /// Placement ban flag (bit 0).
    pub fn bans_placement(&self) -> bool {
        self.flags & 0b01 != 0
    }

    /// Chat ban flag (bit 1).
    pub fn bans_chat(&self) -> bool {
        self.flags & 0b10 != 0
    }
}

/// What the store knows about an address's ownership block.
#[derive(Debug, Clone, Default)]
pub struct RangeFacts {
    /// Most specific stored range covering the address, fresh or stale.
    pub range: Option<IpRange>,
    /// Fresh referral hint covering the address, if any.
    pub hint: Option<ReferralHint>,
}

/// Big-endian key bytes for a numeric value in a family's key width.
pub(crate) fn span_key(num: u64, family: Family) -> Vec<u8> {
    match family {
        Family::V4 => (num as u32).to_be_bytes().to_vec(),
        Family::V6 => num.to_be_bytes().to_vec(),
    }
}

/// Decode a stored span key back to its numeric value.
pub(crate) fn span_num(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let offset = 8 - key.len().min(8);
    buf[offset..].copy_from_slice(&key[..key.len().min(8)]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ban_flags() {
        let ban = |flags| BanRecord {
            id: 1,
            flags,
            reason: None,
            expires_at: None,
        };
        assert!(ban(0b01).bans_placement());
        assert!(!ban(0b01).bans_chat());
        assert!(!ban(0b10).bans_placement());
        assert!(ban(0b10).bans_chat());
        assert!(ban(0b11).bans_placement());
        assert!(ban(0b11).bans_chat());
    }

    #[test]
    fn test_ban_expiry() {
        let now = 1_000_000;
        let permanent = BanRecord {
            id: 1,
            flags: 1,
            reason: None,
            expires_at: None,
        };
        assert!(permanent.is_active(now));

        let expired = BanRecord {
            expires_at: Some(now - 1),
            ..permanent.clone()
        };
        assert!(!expired.is_active(now));

        let active = BanRecord {
            expires_at: Some(now + 1),
            ..permanent
        };
        assert!(active.is_active(now));
    }

    #[test]
    fn test_span_key_round_trip() {
        assert_eq!(span_num(&span_key(0xcb00_7105, Family::V4)), 0xcb00_7105);
        assert_eq!(
            span_num(&span_key(0x2001_0db8_0000_0000, Family::V6)),
            0x2001_0db8_0000_0000
        );
        assert_eq!(span_key(1, Family::V4).len(), 4);
        assert_eq!(span_key(1, Family::V6).len(), 8);
    }

    #[test]
    fn test_cidr_text() {
        let range = IpRange {
            id: 1,
            family: Family::V4,
            start: 0xc000_0200,
            end: 0xc000_02ff,
            mask_bits: 24,
            country: None,
            org: None,
            descr: None,
            asn: None,
            expires_at: 0,
        };
        assert_eq!(range.cidr_text(), "192.0.2.0/24");
    }
}

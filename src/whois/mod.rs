//! Whois client: registry lookups for IP ownership blocks.
//!
//! Talks the classic port-43 text protocol, follows server-to-server
//! referrals, and normalizes the freeform replies into a
//! [`WhoisResult`]. Parsing lives in [`parser`], the socket work and the
//! referral state machine in [`client`].

mod client;
pub(crate) mod parser;

pub use client::WhoisClient;

use serde::{Deserialize, Serialize};

use crate::addr::Family;
use crate::range::parse_cidr_or_range;
use parser::Reply;

/// Range fields checked in priority order; the first present wins.
const RANGE_FIELDS: &[&str] = &[
    "inetnum",
    "inet6num",
    "cidr",
    "netrange",
    "route",
    "route6",
    "ip-network",
    "auth-area",
];

/// ASN fields checked in priority order.
const ASN_FIELDS: &[&str] = &["origin", "originas", "origin-as", "aut-num", "asn"];

/// Organization fields checked in priority order.
const ORG_FIELDS: &[&str] = &["org-name", "orgname", "organization", "org", "owner"];

/// Description fields checked in priority order.
const DESCR_FIELDS: &[&str] = &["descr", "netname", "owner"];

/// Normalized result of a whois walk for one address.
///
/// `start`/`end` span the owning block in the address family's key space;
/// every other field is best-effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhoisResult {
    pub start: u64,
    pub end: u64,
    pub mask_bits: u8,
    pub country: Option<String>,
    pub org: Option<String>,
    pub descr: Option<String>,
    pub asn: Option<u32>,
    /// Which registry to ask first next time, learned from the walk.
    pub referral: Option<Referral>,
}

/// A cached-referral candidate: "ask `host` directly for this block".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Referral {
    pub host: String,
    pub start: u64,
    pub end: u64,
    pub mask_bits: u8,
}

/// Fields extracted from a single hop's reply. The range may be missing;
/// the client decides whether a previous hop can supply it.
#[derive(Debug, Default, Clone)]
pub(crate) struct Extracted {
    pub range: Option<(u64, u64, u8)>,
    pub country: Option<String>,
    pub org: Option<String>,
    pub descr: Option<String>,
    pub asn: Option<u32>,
}

/// Pull the normalized fields out of a parsed reply.
pub(crate) fn extract(reply: &Reply, family: Family) -> Extracted {
    let range = RANGE_FIELDS.iter().find_map(|field| {
        reply
            .all(field)
            .iter()
            .find_map(|value| parse_cidr_or_range(value, family))
    });

    let asn = ASN_FIELDS
        .iter()
        .find_map(|field| reply.all(field).iter().find_map(|v| parse_asn(v)));

    let org = ORG_FIELDS
        .iter()
        .find_map(|field| reply.first(field))
        .map(str::to_string)
        // Contact blocks carry the org name when the network block doesn't.
        .or_else(|| reply.roles.keys().next().cloned());

    let descr = DESCR_FIELDS
        .iter()
        .find_map(|field| reply.first(field))
        .map(str::to_string);

    let country = reply.first("country").and_then(parse_country);

    Extracted {
        range,
        country,
        org,
        descr,
        asn,
    }
}

/// Parse an AS number in asplain (`64500`) or asdot (`1.200`) notation,
/// with or without a leading `AS`.
pub(crate) fn parse_asn(raw: &str) -> Option<u32> {
    let token = raw.split_whitespace().next()?;
    let token = token
        .strip_prefix("AS")
        .or_else(|| token.strip_prefix("as"))
        .unwrap_or(token);

    if let Some((high, low)) = token.split_once('.') {
        let high: u32 = high.parse().ok()?;
        let low: u32 = low.parse().ok()?;
        if high > u16::MAX as u32 || low > u16::MAX as u32 {
            return None;
        }
        return Some((high << 16) | low);
    }

    token.parse().ok()
}

/// Lowercase two-letter country code, or nothing.
fn parse_country(raw: &str) -> Option<String> {
    let code: String = raw.chars().take(2).collect();
    if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(code.to_ascii_lowercase())
    } else {
        None
    }
}

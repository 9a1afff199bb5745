//! Address codec: canonical binary keys for client addresses.
//!
//! An [`Address`] is the caching/banning identity of a client IP. IPv4
//! addresses keep all 32 bits; IPv6 addresses are coarsened to their first
//! 64 bits (the ISP-assigned prefix), so every host in a /64 shares one
//! identity. Two addresses with equal keys are the same entity.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::IntelError;

/// Address family of a parsed client address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Key width in bits (32 for IPv4, 64 for IPv6).
    pub fn width(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 64,
        }
    }

    /// Key width in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Family::V4 => 4,
            Family::V6 => 8,
        }
    }

    /// Mask bits of the synthesized placeholder block for this family
    /// (/24 for IPv4, /56 for IPv6).
    pub fn placeholder_mask(self) -> u8 {
        match self {
            Family::V4 => 24,
            Family::V6 => 56,
        }
    }
}

/// An immutable client address, reduced to its binary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    family: Family,
    num: u64,
}

impl Address {
    /// Parse a textual IPv4 or IPv6 address.
    ///
    /// Malformed input returns a distinguished failure, never a panic:
    /// this runs once per incoming request. IPv4-mapped IPv6 addresses
    /// (`::ffff:a.b.c.d`) are folded into their IPv4 form.
    pub fn parse(text: &str) -> Result<Self, IntelError> {
        let ip: IpAddr = text
            .trim()
            .parse()
            .map_err(|_| IntelError::InvalidAddress(text.to_string()))?;
        Ok(Self::from_ip(ip))
    }

    /// Build from an already-parsed [`IpAddr`].
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self {
                family: Family::V4,
                num: u64::from(u32::from(v4)),
            },
            IpAddr::V6(v6) => {
                if let Some(v4) = v6.to_ipv4_mapped() {
                    return Self::from_ip(IpAddr::V4(v4));
                }
                let seg = v6.segments();
                // First 4 of 8 groups: the ISP-assigned /64.
                let num = (u64::from(seg[0]) << 48)
                    | (u64::from(seg[1]) << 32)
                    | (u64::from(seg[2]) << 16)
                    | u64::from(seg[3]);
                Self {
                    family: Family::V6,
                    num,
                }
            }
        }
    }

    /// Reconstruct an address from a stored binary key.
    ///
    /// Accepts the two key widths this crate writes (4 or 8 bytes).
    pub fn from_key_bytes(key: &[u8]) -> Result<Self, IntelError> {
        match key.len() {
            4 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(key);
                Ok(Self {
                    family: Family::V4,
                    num: u64::from(u32::from_be_bytes(buf)),
                })
            }
            8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(key);
                Ok(Self {
                    family: Family::V6,
                    num: u64::from_be_bytes(buf),
                })
            }
            n => Err(IntelError::Internal(format!("bad key length: {}", n))),
        }
    }

    /// Address family.
    pub fn family(self) -> Family {
        self.family
    }

    /// Key width in bits.
    pub fn width(self) -> u8 {
        self.family.width()
    }

    /// Numeric key value (fits the family's width).
    pub fn num(self) -> u64 {
        self.num
    }

    /// Big-endian binary key: 4 bytes for IPv4, 8 for IPv6.
    pub fn key_bytes(self) -> Vec<u8> {
        match self.family {
            Family::V4 => (self.num as u32).to_be_bytes().to_vec(),
            Family::V6 => self.num.to_be_bytes().to_vec(),
        }
    }

    /// Lowercase hex key: 8 chars for IPv4, 16 for IPv6.
    pub fn hex(self) -> String {
        match self.family {
            Family::V4 => format!("{:08x}", self.num as u32),
            Family::V6 => format!("{:016x}", self.num),
        }
    }

    /// Canonical text form. For IPv6 this is the /64 prefix with zeroed
    /// host bits, so re-parsing it yields the same key.
    pub fn canonical(self) -> String {
        match self.family {
            Family::V4 => Ipv4Addr::from(self.num as u32).to_string(),
            Family::V6 => {
                let v6 = Ipv6Addr::new(
                    (self.num >> 48) as u16,
                    (self.num >> 32) as u16,
                    (self.num >> 16) as u16,
                    self.num as u16,
                    0,
                    0,
                    0,
                    0,
                );
                v6.to_string()
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

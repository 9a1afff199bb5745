//! Range algebra: minimal aligned CIDR covers of arbitrary address spans.
//!
//! One implementation serves both families: values are carried in `u64`
//! with an explicit bit width (32 or 64), and every shift is guarded so a
//! full-width span cannot overflow. Pure functions, no I/O.

use crate::addr::{Address, Family};

/// An aligned CIDR block within a `width`-bit address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub start: u64,
    pub end: u64,
    pub mask_bits: u8,
}

impl Cidr {
    /// Whether `num` falls inside this block.
    pub fn contains(&self, num: u64) -> bool {
        self.start <= num && num <= self.end
    }
}

/// Mask covering the low `bits` bits, safe for `bits == 64`.
fn low_mask(bits: u8) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Decompose `[start, end]` into the minimal set of aligned CIDR blocks.
///
/// When `containing` is supplied, only the half holding that address is
/// recursed into and a single block is returned: the one that would cover
/// `containing` in the full decomposition.
pub fn merge_to_cidrs(start: u64, end: u64, width: u8, containing: Option<u64>) -> Vec<Cidr> {
    debug_assert!(width == 32 || width == 64);
    debug_assert!(start <= end);
    debug_assert!(width == 64 || end <= low_mask(width));

    let mut out = Vec::new();
    split(start, end, width, containing, &mut out);
    out
}

fn split(start: u64, end: u64, width: u8, containing: Option<u64>, out: &mut Vec<Cidr>) {
    if start == end {
        out.push(Cidr {
            start,
            end,
            mask_bits: width,
        });
        return;
    }

    // Highest bit where start and end differ fixes the maximal aligned
    // block that could cover both.
    let high = 63 - (start ^ end).leading_zeros() as u8;
    let span = low_mask(high + 1);
    let block_start = start & !span;

    if start == block_start && end == block_start | span {
        out.push(Cidr {
            start,
            end,
            mask_bits: width - (high + 1),
        });
        return;
    }

    // Not aligned: split at the midpoint implied by the differing bit.
    let mid = block_start | (1u64 << high);
    match containing {
        Some(x) if x < mid => split(start, mid - 1, width, containing, out),
        Some(_) => split(mid, end, width, containing, out),
        None => {
            split(start, mid - 1, width, None, out);
            split(mid, end, width, None, out);
        }
    }
}

/// The aligned `mask_bits` block containing `num`.
pub fn cidr_of(num: u64, width: u8, mask_bits: u8) -> Cidr {
    debug_assert!(mask_bits <= width);
    let span = low_mask(width - mask_bits);
    let start = num & !span;
    Cidr {
        start,
        end: start | span,
        mask_bits,
    }
}

/// Mask bits of the smallest aligned block enclosing `[start, end]`.
fn enclosing_mask(start: u64, end: u64, width: u8) -> u8 {
    if start == end {
        return width;
    }
    let high = 63 - (start ^ end).leading_zeros() as u8;
    width - (high + 1)
}

/// Parse either `prefix/mask` or `start - end` into a numeric span.
///
/// Both sides must belong to `family`; anything else is `None`. Whois
/// registries emit both forms, so the caller never knows which it gets.
pub fn parse_cidr_or_range(text: &str, family: Family) -> Option<(u64, u64, u8)> {
    let text = text.trim();
    let width = family.width();

    if let Some((prefix, mask)) = text.split_once('/') {
        let addr = Address::parse(prefix.trim()).ok()?;
        if addr.family() != family {
            return None;
        }
        let mask_bits: u8 = mask.trim().parse().ok()?;
        // IPv6 masks finer than our /64 key space collapse to it.
        let mask_bits = mask_bits.min(width);
        let block = cidr_of(addr.num(), width, mask_bits);
        return Some((block.start, block.end, mask_bits));
    }

    if let Some((lo, hi)) = text.split_once('-') {
        let lo = Address::parse(lo.trim()).ok()?;
        let hi = Address::parse(hi.trim()).ok()?;
        if lo.family() != family || hi.family() != family || lo.num() > hi.num() {
            return None;
        }
        let mask_bits = enclosing_mask(lo.num(), hi.num(), width);
        return Some((lo.num(), hi.num(), mask_bits));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_cover(start: u64, end: u64, width: u8, blocks: &[Cidr]) {
        // Exact cover, in order, pairwise disjoint.
        let mut cursor = start;
        for block in blocks {
            assert_eq!(block.start, cursor, "gap or overlap before {:?}", block);
            assert!(block.end <= end);
            // Aligned to its mask.
            let span = if width - block.mask_bits >= 64 {
                u64::MAX
            } else {
                (1u64 << (width - block.mask_bits)) - 1
            };
            assert_eq!(block.start & span, 0, "unaligned block {:?}", block);
            assert_eq!(block.end, block.start | span, "bad span {:?}", block);
            cursor = block.end.wrapping_add(1);
        }
        assert_eq!(cursor, end.wrapping_add(1), "cover stops short of end");
    }

    #[test]
    fn test_single_address() {
        let blocks = merge_to_cidrs(42, 42, 32, None);
        assert_eq!(
            blocks,
            vec![Cidr {
                start: 42,
                end: 42,
                mask_bits: 32
            }]
        );
    }

    #[test]
    fn test_aligned_block_is_one_cidr() {
        // 192.0.2.0 - 192.0.2.255 == 192.0.2.0/24
        let start = 0xc000_0200;
        let end = 0xc000_02ff;
        let blocks = merge_to_cidrs(start, end, 32, None);
        assert_eq!(
            blocks,
            vec![Cidr {
                start,
                end,
                mask_bits: 24
            }]
        );
    }

    #[test]
    fn test_unaligned_range_splits() {
        // 10.0.0.1 - 10.0.0.6 needs /32 + /31 + /30? No: 1, 2-3, 4-5, 6.
        let blocks = merge_to_cidrs(0x0a00_0001, 0x0a00_0006, 32, None);
        assert_cover(0x0a00_0001, 0x0a00_0006, 32, &blocks);
        assert_eq!(blocks.len(), 4);
    }

    #[test]
    fn test_cover_properties_exhaustive_small() {
        // Every (start, end) pair in a small 8-bit-ish window.
        for start in 0u64..=64 {
            for end in start..=64 {
                let blocks = merge_to_cidrs(start, end, 32, None);
                assert_cover(start, end, 32, &blocks);
            }
        }
    }

    #[test]
    fn test_full_ipv4_space() {
        let blocks = merge_to_cidrs(0, u32::MAX as u64, 32, None);
        assert_eq!(
            blocks,
            vec![Cidr {
                start: 0,
                end: u32::MAX as u64,
                mask_bits: 0
            }]
        );
    }

    #[test]
    fn test_full_64_bit_space() {
        // The widest possible span must not overflow any shift.
        let blocks = merge_to_cidrs(0, u64::MAX, 64, None);
        assert_eq!(
            blocks,
            vec![Cidr {
                start: 0,
                end: u64::MAX,
                mask_bits: 0
            }]
        );

        let blocks = merge_to_cidrs(1, u64::MAX, 64, None);
        assert_cover(1, u64::MAX, 64, &blocks);
        assert_eq!(blocks.len(), 64);
    }

    #[test]
    fn test_pruned_matches_filtered_full_decomposition() {
        let cases: &[(u64, u64, u8)] = &[
            (0x0a00_0001, 0x0a00_7f23, 32),
            (3, 200, 32),
            (0x2001_0db8_0000_0000, 0x2001_0db8_ffff_0123, 64),
            (1, u64::MAX - 1, 64),
        ];
        for &(start, end, width) in cases {
            let full = merge_to_cidrs(start, end, width, None);
            let probes = [start, end, start + (end - start) / 2, start + 1];
            for x in probes {
                let pruned = merge_to_cidrs(start, end, width, Some(x));
                assert_eq!(pruned.len(), 1, "pruned result must be a single block");
                let expected = full.iter().find(|b| b.contains(x)).unwrap();
                assert_eq!(&pruned[0], expected, "prune mismatch at {:#x}", x);
            }
        }
    }

    #[test]
    fn test_cidr_of() {
        let block = cidr_of(0xcb00_7105, 32, 24);
        assert_eq!(block.start, 0xcb00_7100);
        assert_eq!(block.end, 0xcb00_71ff);
        assert_eq!(block.mask_bits, 24);

        let host = cidr_of(0xcb00_7105, 32, 32);
        assert_eq!(host.start, host.end);
    }

    #[test]
    fn test_parse_cidr_forms() {
        let (start, end, mask) = parse_cidr_or_range("192.0.2.0/24", Family::V4).unwrap();
        assert_eq!((start, end, mask), (0xc000_0200, 0xc000_02ff, 24));

        // Unaligned prefix is normalized onto its block.
        let (start, end, mask) = parse_cidr_or_range("192.0.2.7/24", Family::V4).unwrap();
        assert_eq!((start, end, mask), (0xc000_0200, 0xc000_02ff, 24));

        let (start, end, mask) = parse_cidr_or_range("2001:db8::/32", Family::V6).unwrap();
        assert_eq!(start, 0x2001_0db8_0000_0000);
        assert_eq!(end, 0x2001_0db8_ffff_ffff);
        assert_eq!(mask, 32);

        // Masks finer than the 64-bit key space clamp to /64.
        let (_, _, mask) = parse_cidr_or_range("2001:db8::/96", Family::V6).unwrap();
        assert_eq!(mask, 64);
    }

    #[test]
    fn test_parse_range_form() {
        let (start, end, mask) =
            parse_cidr_or_range("192.0.2.0 - 192.0.2.255", Family::V4).unwrap();
        assert_eq!((start, end, mask), (0xc000_0200, 0xc000_02ff, 24));

        // Unaligned span keeps its endpoints, mask is the enclosing block.
        let (start, end, _) = parse_cidr_or_range("10.0.0.1-10.0.0.6", Family::V4).unwrap();
        assert_eq!((start, end), (0x0a00_0001, 0x0a00_0006));
    }

    #[test]
    fn test_parse_rejects_junk() {
        assert!(parse_cidr_or_range("garbage", Family::V4).is_none());
        assert!(parse_cidr_or_range("192.0.2.0/33x", Family::V4).is_none());
        // Family mismatch
        assert!(parse_cidr_or_range("2001:db8::/32", Family::V4).is_none());
        // Inverted range
        assert!(parse_cidr_or_range("10.0.0.9-10.0.0.1", Family::V4).is_none());
    }
}

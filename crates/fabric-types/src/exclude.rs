//! Exclusion block calculation.
//!
//! A subnet only hands out addresses from its included ranges. Everything
//! else inside the CIDR (plus the gateway and explicitly excluded addresses)
//! belongs to somebody else and must not be routed as if it were pod space.
//! [`find_exclude_blocks`] turns that complement into the fewest CIDR blocks,
//! which become throw routes in overlay route tables.

use crate::ip::{next_ip, prev_ip};
use crate::{IpFamily, IpPrefix, IpRange, RangeError};
use ipnet::{IpNet, Ipv4Subnets, Ipv6Subnets};
use std::net::IpAddr;

fn check_family(addr: IpAddr, expected: IpFamily) -> Result<(), RangeError> {
    if IpFamily::of(&addr) != expected {
        return Err(RangeError::FamilyMismatch { addr, expected });
    }
    Ok(())
}

/// Computes the CIDR blocks of `cidr` that lie outside every included range,
/// with `gateway` and `exclude_ips` folded in.
///
/// Included ranges may arrive in any order. An empty list leaves the whole
/// CIDR as exclusion territory.
///
/// # Errors
///
/// - [`RangeError::OutOfCidr`] if a range reaches outside `cidr`
/// - [`RangeError::Overlapped`] if two ranges share any address
/// - [`RangeError::FamilyMismatch`] if any input is of another family
pub fn find_exclude_blocks(
    cidr: &IpPrefix,
    included_ranges: &[IpRange],
    gateway: Option<IpAddr>,
    exclude_ips: &[IpAddr],
) -> Result<Vec<IpPrefix>, RangeError> {
    let family = cidr.family();
    let cidr_start = cidr.first();
    let cidr_end = cidr.last();

    for range in included_ranges {
        check_family(range.start(), family)?;
    }
    for addr in exclude_ips.iter().chain(gateway.iter()) {
        check_family(*addr, family)?;
    }

    let mut sorted = included_ranges.to_vec();
    sorted.sort_by_key(|r| r.start());

    let mut exclude_ranges: Vec<IpRange> = Vec::new();

    if sorted.is_empty() {
        exclude_ranges.extend(IpRange::new(cidr_start, cidr_end)?);
    }

    for (index, current) in sorted.iter().enumerate() {
        if current.start() < cidr_start || current.end() > cidr_end {
            return Err(RangeError::OutOfCidr {
                start: current.start(),
                end: current.end(),
                cidr: *cidr,
            });
        }

        let next = sorted.get(index + 1);
        if let Some(next) = next {
            if current.end() >= next.start() {
                return Err(RangeError::Overlapped {
                    first_start: current.start(),
                    first_end: current.end(),
                    second_start: next.start(),
                    second_end: next.end(),
                });
            }
        }

        if index == 0 {
            if let Some(before) = prev_ip(&current.start()) {
                exclude_ranges.extend(IpRange::new(cidr_start, before)?);
            }
        }

        let gap_end = match next {
            Some(next) => prev_ip(&next.start()),
            None => Some(cidr_end),
        };
        if let (Some(gap_start), Some(gap_end)) = (next_ip(&current.end()), gap_end) {
            exclude_ranges.extend(IpRange::new(gap_start, gap_end)?);
        }
    }

    'fold: for addr in exclude_ips.iter().chain(gateway.iter()) {
        for range in exclude_ranges.iter_mut() {
            if range.try_add_ip(*addr) {
                continue 'fold;
            }
        }
        exclude_ranges.push(IpRange::single(*addr));
    }

    Ok(exclude_ranges
        .iter()
        .flat_map(split_range_to_blocks)
        .collect())
}

/// Decomposes a range into the fewest CIDR blocks.
///
/// Each block starts at the current address with the widest prefix its
/// alignment allows without running past the range end.
pub fn split_range_to_blocks(range: &IpRange) -> Vec<IpPrefix> {
    match (range.start(), range.end()) {
        (IpAddr::V4(start), IpAddr::V4(end)) => Ipv4Subnets::new(start, end, 0)
            .map(|net| IpPrefix::from(IpNet::V4(net)))
            .collect(),
        (IpAddr::V6(start), IpAddr::V6(end)) => Ipv6Subnets::new(start, end, 0)
            .map(|net| IpPrefix::from(IpNet::V6(net)))
            .collect(),
        // IpRange::new rejects mixed bounds
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn prefix(s: &str) -> IpPrefix {
        s.parse().unwrap()
    }

    fn range(start: &str, end: &str) -> IpRange {
        IpRange::new(ip(start), ip(end)).unwrap().unwrap()
    }

    fn strings(blocks: &[IpPrefix]) -> Vec<String> {
        blocks.iter().map(|b| b.to_string()).collect()
    }

    fn addresses(first: IpAddr, last: IpAddr) -> Vec<IpAddr> {
        let mut out = vec![first];
        let mut current = first;
        while current != last {
            current = next_ip(&current).unwrap();
            out.push(current);
        }
        out
    }

    /// Expands blocks into a sorted list of covered addresses.
    fn covered(blocks: &[IpPrefix]) -> Vec<IpAddr> {
        let mut out: Vec<IpAddr> = blocks
            .iter()
            .flat_map(|block| addresses(block.first(), block.last()))
            .collect();
        out.sort_unstable();
        out
    }

    #[test]
    fn test_ranges_inside_v4_slash24() {
        let blocks = find_exclude_blocks(
            &prefix("10.0.0.0/24"),
            &[range("10.0.0.10", "10.0.0.20")],
            Some(ip("10.0.0.1")),
            &[ip("10.0.0.254")],
        )
        .unwrap();

        assert_eq!(
            strings(&blocks),
            vec![
                "10.0.0.0/29",
                "10.0.0.8/31",
                "10.0.0.21/32",
                "10.0.0.22/31",
                "10.0.0.24/29",
                "10.0.0.32/27",
                "10.0.0.64/26",
                "10.0.0.128/25",
            ]
        );
    }

    #[test]
    fn test_blocks_and_ranges_tile_cidr() {
        let cidr = prefix("192.168.10.0/24");
        let included = [
            range("192.168.10.100", "192.168.10.199"),
            range("192.168.10.3", "192.168.10.50"),
        ];
        let blocks = find_exclude_blocks(&cidr, &included, None, &[]).unwrap();

        let mut all = covered(&blocks);
        for r in &included {
            all.extend(addresses(r.start(), r.end()));
        }
        all.sort_unstable();

        let expected = addresses(cidr.first(), cidr.last());
        assert_eq!(all, expected);

        for block in &blocks {
            for r in &included {
                assert!(!r.contains(&block.first()) && !r.contains(&block.last()));
            }
        }
    }

    #[test]
    fn test_gateway_inside_gap_not_duplicated() {
        let blocks = find_exclude_blocks(
            &prefix("10.0.0.0/28"),
            &[range("10.0.0.2", "10.0.0.15")],
            Some(ip("10.0.0.1")),
            &[],
        )
        .unwrap();
        assert_eq!(strings(&blocks), vec!["10.0.0.0/31"]);
    }

    #[test]
    fn test_excluded_point_inside_included_range() {
        let blocks = find_exclude_blocks(
            &prefix("10.0.0.0/29"),
            &[range("10.0.0.0", "10.0.0.7")],
            None,
            &[ip("10.0.0.4")],
        )
        .unwrap();
        assert_eq!(strings(&blocks), vec!["10.0.0.4/32"]);
    }

    #[test]
    fn test_adjacent_excluded_points_merge() {
        let blocks = find_exclude_blocks(
            &prefix("10.0.0.0/24"),
            &[range("10.0.0.0", "10.0.0.255")],
            None,
            &[ip("10.0.0.4"), ip("10.0.0.5"), ip("10.0.0.6"), ip("10.0.0.7")],
        )
        .unwrap();
        assert_eq!(strings(&blocks), vec!["10.0.0.4/30"]);
    }

    #[test]
    fn test_empty_included_ranges_exclude_whole_cidr() {
        let blocks = find_exclude_blocks(
            &prefix("10.1.0.0/16"),
            &[],
            Some(ip("10.1.0.1")),
            &[ip("10.1.0.2")],
        )
        .unwrap();
        assert_eq!(strings(&blocks), vec!["10.1.0.0/16"]);
    }

    #[test]
    fn test_range_out_of_cidr() {
        let err = find_exclude_blocks(
            &prefix("10.0.0.0/24"),
            &[range("10.0.0.200", "10.0.1.5")],
            None,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, RangeError::OutOfCidr { .. }));
    }

    #[test]
    fn test_overlapping_ranges() {
        let err = find_exclude_blocks(
            &prefix("10.0.0.0/24"),
            &[range("10.0.0.30", "10.0.0.40"), range("10.0.0.10", "10.0.0.30")],
            None,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, RangeError::Overlapped { .. }));
    }

    #[test]
    fn test_mixed_families_rejected() {
        let err = find_exclude_blocks(
            &prefix("10.0.0.0/24"),
            &[range("10.0.0.10", "10.0.0.20")],
            Some(ip("fd00::1")),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, RangeError::FamilyMismatch { .. }));
    }

    #[test]
    fn test_ipv6_blocks() {
        let blocks = find_exclude_blocks(
            &prefix("fd00::/120"),
            &[range("fd00::10", "fd00::ff")],
            Some(ip("fd00::1")),
            &[],
        )
        .unwrap();
        assert_eq!(strings(&blocks), vec!["fd00::/124"]);
    }

    #[test]
    fn test_split_aligned_range() {
        let blocks = split_range_to_blocks(&range("10.0.0.0", "10.255.255.255"));
        assert_eq!(strings(&blocks), vec!["10.0.0.0/8"]);

        let blocks = split_range_to_blocks(&range("fd00::", "fd00::ffff"));
        assert_eq!(strings(&blocks), vec!["fd00::/112"]);
    }

    #[test]
    fn test_split_single_address_at_top() {
        let blocks = split_range_to_blocks(&range("255.255.255.255", "255.255.255.255"));
        assert_eq!(strings(&blocks), vec!["255.255.255.255/32"]);

        let blocks = split_range_to_blocks(&range("255.255.255.254", "255.255.255.255"));
        assert_eq!(strings(&blocks), vec!["255.255.255.254/31"]);
    }

    #[test]
    fn test_split_unaligned_range() {
        let blocks = split_range_to_blocks(&range("10.0.0.3", "10.0.0.12"));
        assert_eq!(
            strings(&blocks),
            vec!["10.0.0.3/32", "10.0.0.4/30", "10.0.0.8/30", "10.0.0.12/32"]
        );
    }
}

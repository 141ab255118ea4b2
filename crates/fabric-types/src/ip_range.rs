//! Closed address intervals.

use crate::ip::{next_ip, prev_ip};
use crate::{IpFamily, RangeError};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

/// A closed interval `[start, end]` of addresses of one family.
///
/// `start <= end` always holds; [`IpRange::new`] yields `None` instead of
/// an inverted range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IpRange {
    start: IpAddr,
    end: IpAddr,
}

impl IpRange {
    /// Creates a range, returning `Ok(None)` when `start > end`.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::FamilyMismatch`] if the bounds are of different
    /// families.
    pub fn new(start: IpAddr, end: IpAddr) -> Result<Option<Self>, RangeError> {
        let family = IpFamily::of(&start);
        if IpFamily::of(&end) != family {
            return Err(RangeError::FamilyMismatch {
                addr: end,
                expected: family,
            });
        }

        if start > end {
            return Ok(None);
        }

        Ok(Some(IpRange { start, end }))
    }

    /// Creates a range holding exactly one address.
    pub fn single(addr: IpAddr) -> Self {
        IpRange {
            start: addr,
            end: addr,
        }
    }

    pub const fn start(&self) -> IpAddr {
        self.start
    }

    pub const fn end(&self) -> IpAddr {
        self.end
    }

    pub const fn family(&self) -> IpFamily {
        IpFamily::of(&self.start)
    }

    /// Returns true if `addr` lies within the range.
    ///
    /// `IpAddr` orders numerically within a family.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        IpFamily::of(addr) == self.family() && *addr >= self.start && *addr <= self.end
    }

    /// Extends the range by `addr` if it is adjacent to either boundary, or
    /// accepts it unchanged if it is already inside.
    ///
    /// Returns false when the address can only be covered by a new range.
    pub fn try_add_ip(&mut self, addr: IpAddr) -> bool {
        if IpFamily::of(&addr) != self.family() {
            return false;
        }

        if prev_ip(&self.start) == Some(addr) {
            self.start = addr;
            return true;
        }

        if next_ip(&self.end) == Some(addr) {
            self.end = addr;
            return true;
        }

        self.contains(&addr)
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn range(start: &str, end: &str) -> IpRange {
        IpRange::new(ip(start), ip(end)).unwrap().unwrap()
    }

    #[test]
    fn test_inverted_range_is_empty() {
        assert_eq!(IpRange::new(ip("10.0.0.20"), ip("10.0.0.10")).unwrap(), None);
    }

    #[test]
    fn test_mixed_family_rejected() {
        let err = IpRange::new(ip("10.0.0.1"), ip("fd00::1")).unwrap_err();
        assert!(matches!(err, RangeError::FamilyMismatch { .. }));
    }

    #[test]
    fn test_try_add_ip_extends_start() {
        let mut r = range("10.0.0.10", "10.0.0.20");
        assert!(r.try_add_ip(ip("10.0.0.9")));
        assert_eq!(r, range("10.0.0.9", "10.0.0.20"));
    }

    #[test]
    fn test_try_add_ip_extends_end() {
        let mut r = range("10.0.0.10", "10.0.0.20");
        assert!(r.try_add_ip(ip("10.0.0.21")));
        assert_eq!(r, range("10.0.0.10", "10.0.0.21"));
    }

    #[test]
    fn test_try_add_ip_inside_unchanged() {
        let mut r = range("10.0.0.10", "10.0.0.20");
        assert!(r.try_add_ip(ip("10.0.0.15")));
        assert_eq!(r, range("10.0.0.10", "10.0.0.20"));
    }

    #[test]
    fn test_try_add_ip_far_away_rejected() {
        let mut r = range("10.0.0.10", "10.0.0.20");
        assert!(!r.try_add_ip(ip("10.0.0.25")));
        assert!(!r.try_add_ip(ip("fd00::15")));
        assert_eq!(r, range("10.0.0.10", "10.0.0.20"));
    }

    #[test]
    fn test_try_add_ip_at_address_space_edges() {
        let mut low = range("0.0.0.0", "0.0.0.5");
        assert!(!low.try_add_ip(ip("255.255.255.255")));

        let mut high = range("255.255.255.250", "255.255.255.255");
        assert!(!high.try_add_ip(ip("0.0.0.0")));
        assert!(high.try_add_ip(ip("255.255.255.249")));
    }
}

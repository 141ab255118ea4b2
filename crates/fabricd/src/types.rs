//! Constants and small types shared by the fabricd managers

use fabric_common::LOCAL_TABLE;

/// Route table pool for per-subnet tables (10000-39999)
pub const MIN_ROUTE_TABLE: u32 = 10000;
pub const MAX_ROUTE_TABLE: u32 = 40000;

/// Highest priority a policy rule may carry
pub const MAX_RULE_PRIORITY: u32 = 32767;

/// Rules for pod subnets must sort after the rule for this table
pub const NODE_LOCAL_TABLE: u32 = LOCAL_TABLE;

/// Mark set by kube-proxy on traffic it will masquerade
pub const KUBE_PROXY_MASQ_MARK: u32 = 0x4000;

/// Mark set on traffic that leaves through NAT
pub const POD_NAT_MARK: u32 = 0x80;

/// From-subnet rules only match packets carrying neither mark
pub const FROM_RULE_MARK: u32 = 0;
pub const FROM_RULE_MASK: u32 = KUBE_PROXY_MASQ_MARK | POD_NAT_MARK;

/// Interface name suffix of the host side of a pod veth pair
pub const DEFAULT_POD_LINK_SUFFIX: &str = "_h";

/// How a rule lookup matches the rule's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTableMatch {
    /// Whatever table the rule points at.
    Any,
    /// Exactly this table.
    Exact(u32),
}

impl RuleTableMatch {
    pub fn matches(&self, table: u32) -> bool {
        match self {
            RuleTableMatch::Any => true,
            RuleTableMatch::Exact(t) => *t == table,
        }
    }
}

/// Returns true if a rule pointing at `table` is one of ours.
///
/// Tables are only ever allocated below [`MAX_ROUTE_TABLE`], but rules on
/// [`MAX_ROUTE_TABLE`] itself are still claimed so they get cleaned up.
pub fn is_subnet_table(table: u32) -> bool {
    (MIN_ROUTE_TABLE..=MAX_ROUTE_TABLE).contains(&table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rule_mask() {
        assert_eq!(FROM_RULE_MASK, 0x4080);
    }

    #[test]
    fn test_subnet_table_pool() {
        assert!(is_subnet_table(MIN_ROUTE_TABLE));
        assert!(is_subnet_table(MAX_ROUTE_TABLE - 1));
        assert!(is_subnet_table(MAX_ROUTE_TABLE));
        assert!(!is_subnet_table(MAX_ROUTE_TABLE + 1));
        assert!(!is_subnet_table(MIN_ROUTE_TABLE - 1));
        assert!(!is_subnet_table(NODE_LOCAL_TABLE));
    }

    #[test]
    fn test_rule_table_match() {
        assert!(RuleTableMatch::Any.matches(10042));
        assert!(RuleTableMatch::Exact(10000).matches(10000));
        assert!(!RuleTableMatch::Exact(10000).matches(10001));
    }
}

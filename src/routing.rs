//! Policy routing for marked packets.
//!
//! Marking a packet is only half of transparent interception: the kernel
//! still routes by destination. A policy rule sends marked packets to a
//! dedicated table whose only route is `local default dev lo`, so every
//! marked packet is delivered locally, where TPROXY hands it to the proxy.
//!
//! ```text
//! ip rule add fwmark 0x2333 table 233
//! ip route add local default dev lo table 233
//! ```
//!
//! # Example
//!
//! ```
//! use tpgate::kernel::MemoryKernel;
//! use tpgate::policy::Family;
//! use tpgate::routing::{FwMark, PolicyRouting};
//!
//! let kernel = MemoryKernel::new();
//! let routing = PolicyRouting::new(&kernel, FwMark::default());
//! routing.install(&[Family::V4]).unwrap();
//! assert!(routing.rule_present());
//!
//! assert!(routing.teardown().is_empty());
//! assert!(!routing.rule_present());
//! ```

use std::fmt;

use tracing::{debug, info, warn};

use crate::error::{ApplyError, TeardownError};
use crate::kernel::PolicyRoutes;
use crate::policy::{Family, Policy};

/// Default mark used to correlate classification with delivery
pub const DEFAULT_MARK: u32 = 0x2333;

/// Default dedicated routing table
pub const DEFAULT_TABLE: u32 = 233;

/// Stale rules are deleted one per call; bound the loop
const MAX_STALE_RULES: usize = 64;

/// Reserved mark and its routing table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwMark {
    /// Packet / connection mark
    pub mark: u32,
    /// Routing table marked packets are looked up in
    pub table: u32,
}

impl FwMark {
    /// Mark and table of a policy
    #[must_use]
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            mark: policy.mark,
            table: policy.route_table,
        }
    }
}

impl Default for FwMark {
    fn default() -> Self {
        Self {
            mark: DEFAULT_MARK,
            table: DEFAULT_TABLE,
        }
    }
}

impl fmt::Display for FwMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fwmark {:#x} table {}", self.mark, self.table)
    }
}

/// Installs and removes the policy rule and local route
pub struct PolicyRouting<'a, K: PolicyRoutes + ?Sized> {
    routes: &'a K,
    fwmark: FwMark,
}

impl<'a, K: PolicyRoutes + ?Sized> PolicyRouting<'a, K> {
    /// Manager for one mark/table pair
    pub fn new(routes: &'a K, fwmark: FwMark) -> Self {
        Self { routes, fwmark }
    }

    /// Install the rule and route for each family.
    ///
    /// # Errors
    ///
    /// Returns `ApplyError` if either command fails.
    pub fn install(&self, families: &[Family]) -> Result<(), ApplyError> {
        let FwMark { mark, table } = self.fwmark;
        for &family in families {
            self.routes
                .add_rule(family, mark, table)
                .map_err(|e| ApplyError::new(format!("add {family} {}", self.fwmark), e))?;
            self.routes
                .add_local_route(family, table)
                .map_err(|e| ApplyError::new(format!("add {family} local route to table {table}"), e))?;
            info!("Policy routing installed for {}: {}", family, self.fwmark);
        }
        Ok(())
    }

    /// Remove every matching rule and flush the table, for both families,
    /// whether or not anything is installed.
    pub fn teardown(&self) -> Vec<TeardownError> {
        let FwMark { mark, table } = self.fwmark;
        let mut errors = Vec::new();

        for family in Family::ALL {
            let mut removed = 0;
            for _ in 0..MAX_STALE_RULES {
                match self.routes.delete_rule(family, mark, table) {
                    Ok(()) => removed += 1,
                    Err(e) if e.is_not_found() => break,
                    Err(e) => {
                        errors.push(TeardownError::new(format!("delete {family} {}", self.fwmark), e));
                        break;
                    }
                }
            }
            if removed > 0 {
                debug!("Removed {} {} policy rule(s)", removed, family);
            }

            match self.routes.flush_table(family, table) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => errors.push(TeardownError::new(format!("flush {family} table {table}"), e)),
            }
        }

        for e in &errors {
            warn!("{}", e);
        }
        errors
    }

    /// Whether a policy rule exists in either family
    pub fn rule_present(&self) -> bool {
        let FwMark { mark, table } = self.fwmark;
        Family::ALL.into_iter().any(|family| {
            self.routes.has_rule(family, mark, table).unwrap_or_else(|e| {
                debug!("Probe of {} policy rule failed: {}", family, e);
                false
            })
        })
    }

    /// Whether the dedicated table holds routes in either family
    pub fn routes_present(&self) -> bool {
        Family::ALL.into_iter().any(|family| {
            self.routes
                .table_routes(family, self.fwmark.table)
                .map(|routes| !routes.is_empty())
                .unwrap_or_else(|e| {
                    debug!("Probe of {} table {} failed: {}", family, self.fwmark.table, e);
                    false
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MemoryKernel;

    #[test]
    fn test_display() {
        assert_eq!(FwMark::default().to_string(), "fwmark 0x2333 table 233");
    }

    #[test]
    fn test_install_both_families() {
        let kernel = MemoryKernel::new();
        let routing = PolicyRouting::new(&kernel, FwMark::default());
        routing.install(&Family::ALL).unwrap();
        assert_eq!(kernel.policy_rule_count(Family::V6), 1);
        assert!(routing.routes_present());
    }

    #[test]
    fn test_teardown_removes_stale_duplicates() {
        let kernel = MemoryKernel::new();
        for _ in 0..3 {
            kernel.add_rule(Family::V4, DEFAULT_MARK, DEFAULT_TABLE).unwrap();
        }
        kernel.add_rule(Family::V4, 0x1, DEFAULT_TABLE).unwrap();

        let routing = PolicyRouting::new(&kernel, FwMark::default());
        assert!(routing.teardown().is_empty());
        assert_eq!(kernel.policy_rule_count(Family::V4), 1);
        assert!(!routing.rule_present());
    }

    #[test]
    fn test_teardown_when_absent() {
        let kernel = MemoryKernel::new();
        let routing = PolicyRouting::new(&kernel, FwMark::default());
        assert!(routing.teardown().is_empty());
        assert!(!routing.routes_present());
    }

    #[test]
    fn test_install_twice_fails_on_route() {
        let kernel = MemoryKernel::new();
        let routing = PolicyRouting::new(&kernel, FwMark::default());
        routing.install(&[Family::V4]).unwrap();
        assert!(routing.install(&[Family::V4]).is_err());
    }
}

//! Rule compiler
//!
//! Compiles a [`Policy`](crate::policy::Policy) into per-family chains in the
//! mangle and nat tables and installs them through a
//! [`Netfilter`](crate::kernel::Netfilter) backend.
//!
//! # Chain Layout
//!
//! ```text
//! mangle PREROUTING  -> TPGATE_PREROUTING -> TPGATE_DECIDE / TPGATE_QUIC, TPROXY
//! mangle OUTPUT      -> TPGATE_OUTPUT     -> TPGATE_DECIDE / TPGATE_QUIC, MARK
//! nat    PREROUTING  -> TPGATE_PREROUTING -> DNS redirect, TPGATE_DECIDE (redirect)
//! nat    OUTPUT      -> TPGATE_OUTPUT     -> DNS redirect, TPGATE_DECIDE (redirect)
//! nat    POSTROUTING -> TPGATE_POSTROUTING -> loopback SNAT, MASQUERADE
//! ```
//!
//! The decision chain marks a connection (mangle) or DNATs it (nat). The
//! mark is copied to each packet and the policy route delivers marked
//! packets to `lo`, where TPROXY hands them to the proxy listener.
//!
//! While stopped only the fail-safe chains exist: `TPGATE_FAILSAFE` in nat
//! PREROUTING and `TPGATE_FAILSAFE_POST` in nat POSTROUTING.

mod apply;
mod build;
mod plan;
mod rule;

pub use apply::RuleApplier;
pub use build::{compile, compile_failsafe};
pub use plan::{ChainPlan, FamilyPlan, HookLink, RulePlan, TablePlan};
pub use rule::{CtDir, CtState, Hook, Match, Proto, Rule, Table, Target};

/// Entry chain for incoming packets (both tables)
pub const CHAIN_PREROUTING: &str = "TPGATE_PREROUTING";
/// Entry chain for locally generated packets (both tables)
pub const CHAIN_OUTPUT: &str = "TPGATE_OUTPUT";
/// Source NAT chain
pub const CHAIN_POSTROUTING: &str = "TPGATE_POSTROUTING";
/// Mode decision chain (both tables)
pub const CHAIN_DECIDE: &str = "TPGATE_DECIDE";
/// QUIC suppression chain
pub const CHAIN_QUIC: &str = "TPGATE_QUIC";
/// Fail-safe DNS chain
pub const CHAIN_FAILSAFE: &str = "TPGATE_FAILSAFE";
/// Fail-safe masquerade chain
pub const CHAIN_FAILSAFE_POST: &str = "TPGATE_FAILSAFE_POST";

/// A fixed group of private chains and the hooks that may reference them
#[derive(Debug, Clone, Copy)]
pub struct ChainSet {
    /// Every chain the group may create
    pub chains: &'static [(Table, &'static str)],
    /// Every hook link the group may install
    pub links: &'static [(Table, Hook, &'static str)],
}

/// Chains of the running engine
pub const ENGINE_CHAINS: ChainSet = ChainSet {
    chains: &[
        (Table::Mangle, CHAIN_PREROUTING),
        (Table::Mangle, CHAIN_OUTPUT),
        (Table::Mangle, CHAIN_DECIDE),
        (Table::Mangle, CHAIN_QUIC),
        (Table::Nat, CHAIN_PREROUTING),
        (Table::Nat, CHAIN_OUTPUT),
        (Table::Nat, CHAIN_POSTROUTING),
        (Table::Nat, CHAIN_DECIDE),
    ],
    links: &[
        (Table::Mangle, Hook::Prerouting, CHAIN_PREROUTING),
        (Table::Mangle, Hook::Output, CHAIN_OUTPUT),
        (Table::Nat, Hook::Prerouting, CHAIN_PREROUTING),
        (Table::Nat, Hook::Output, CHAIN_OUTPUT),
        (Table::Nat, Hook::Postrouting, CHAIN_POSTROUTING),
    ],
};

/// Chains of the stopped-state fail-safe
pub const FAILSAFE_CHAINS: ChainSet = ChainSet {
    chains: &[(Table::Nat, CHAIN_FAILSAFE), (Table::Nat, CHAIN_FAILSAFE_POST)],
    links: &[
        (Table::Nat, Hook::Prerouting, CHAIN_FAILSAFE),
        (Table::Nat, Hook::Postrouting, CHAIN_FAILSAFE_POST),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::policy::{DropQuicPolicy, ForwardingStrategy, Policy};

    /// Every chain and link a plan can produce is known to teardown
    #[test]
    fn test_chain_sets_cover_all_plans() {
        for strategy in [ForwardingStrategy::Tproxy, ForwardingStrategy::Redirect] {
            let mut config = Config::default_config();
            config.ipv6 = true;
            config.strategy = strategy;
            config.drop_quic = DropQuicPolicy::Always;
            config.nat.masquerade_v4 = true;
            config.dns.failsafe = Some("223.5.5.5".parse().unwrap());
            let policy = Policy::resolve(&config).unwrap();

            for (plan, set) in [(compile(&policy), ENGINE_CHAINS), (compile_failsafe(&policy), FAILSAFE_CHAINS)] {
                for fp in &plan.families {
                    for tp in &fp.tables {
                        for chain in &tp.chains {
                            assert!(set.chains.contains(&(tp.table, chain.name.as_str())), "{}", chain.name);
                        }
                        for link in &tp.links {
                            assert!(set.links.contains(&(tp.table, link.hook, link.chain)));
                        }
                    }
                }
            }
        }
    }
}

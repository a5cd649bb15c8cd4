//! Installing and removing rule plans

use tracing::{debug, info, warn};

use super::plan::RulePlan;
use super::rule::{Rule, Table};
use super::ChainSet;
use crate::error::{ApplyError, KernelErrorKind, TeardownError};
use crate::kernel::Netfilter;
use crate::policy::Family;

/// Hook jumps are removed one at a time; repeated runs may have left several
const MAX_LINK_DUPLICATES: usize = 16;

/// Installs plans into, and removes engine chains from, a [`Netfilter`]
pub struct RuleApplier<'a, N: Netfilter + ?Sized> {
    nf: &'a N,
}

impl<'a, N: Netfilter + ?Sized> RuleApplier<'a, N> {
    /// Applier over a netfilter backend
    pub fn new(nf: &'a N) -> Self {
        Self { nf }
    }

    /// Install a plan: create chains, populate them, then link the hooks.
    ///
    /// # Errors
    ///
    /// Returns `ApplyError` on the first failing operation. Whatever was
    /// installed before the failure stays in place.
    pub fn apply(&self, plan: &RulePlan) -> Result<(), ApplyError> {
        for fp in &plan.families {
            let family = fp.family;
            for tp in &fp.tables {
                let table = tp.table;

                for chain in &tp.chains {
                    match self.nf.new_chain(family, table, &chain.name) {
                        Ok(()) => {}
                        Err(e) if e.kind == KernelErrorKind::Exists => {
                            debug!("{} {} {} already exists, flushing", family, table, chain.name);
                            self.nf
                                .flush_chain(family, table, &chain.name)
                                .map_err(|e| ApplyError::new(format!("flush chain {}", chain.name), e))?;
                        }
                        Err(e) => return Err(ApplyError::new(format!("create chain {}", chain.name), e)),
                    }
                }

                for chain in &tp.chains {
                    for rule in &chain.rules {
                        self.nf.append(family, table, &chain.name, rule).map_err(|e| {
                            ApplyError::new(format!("append to {} {} {}", family, table, chain.name), e)
                        })?;
                    }
                }

                for link in &tp.links {
                    self.nf
                        .insert(family, table, link.hook.as_str(), &link.rule())
                        .map_err(|e| ApplyError::new(format!("link {} {} {}", family, table, link.hook), e))?;
                }

                debug!("Installed {} {} chains for {}", tp.chains.len(), table, family);
            }
        }
        Ok(())
    }

    /// Remove every chain of `set`, in every family whose tooling exists.
    /// Absence is success; other failures are returned, never raised.
    pub fn teardown(&self, set: &ChainSet) -> Vec<TeardownError> {
        self.remove_where(set, |_, _, _| true)
    }

    /// Remove engine chains that exist in the kernel but not in `plan`.
    pub fn sweep_unreferenced(&self, set: &ChainSet, plan: &RulePlan) -> Vec<TeardownError> {
        self.remove_where(set, |family, table, chain| {
            if plan.has_chain(family, table, chain) {
                return false;
            }
            let stale = self.nf.chain_exists(family, table, chain).unwrap_or(false);
            if stale {
                info!("Removing unreferenced chain {} {} {}", family, table, chain);
            }
            stale
        })
    }

    /// Whether any chain of `set` exists.
    pub fn present(&self, set: &ChainSet) -> bool {
        Family::ALL
            .into_iter()
            .filter(|&family| self.nf.available(family))
            .any(|family| {
                set.chains.iter().any(|&(table, chain)| {
                    self.nf.chain_exists(family, table, chain).unwrap_or_else(|e| {
                        debug!("Probe of {} failed: {}", chain, e);
                        false
                    })
                })
            })
    }

    fn remove_where(
        &self,
        set: &ChainSet,
        select: impl Fn(Family, Table, &str) -> bool,
    ) -> Vec<TeardownError> {
        let mut errors = Vec::new();

        for family in Family::ALL {
            if !self.nf.available(family) {
                debug!("{} not available, skipping {} teardown", family.iptables(), family);
                continue;
            }

            let selected: Vec<_> = set
                .chains
                .iter()
                .copied()
                .filter(|&(table, chain)| select(family, table, chain))
                .collect();

            for &(table, hook, chain) in set.links {
                if !selected.contains(&(table, chain)) {
                    continue;
                }
                let link = Rule::jump(chain);
                for _ in 0..MAX_LINK_DUPLICATES {
                    match self.nf.delete(family, table, hook.as_str(), &link) {
                        Ok(()) => debug!("Unlinked {} from {} {} {}", chain, family, table, hook),
                        Err(e) if e.is_not_found() => break,
                        Err(e) => {
                            errors.push(TeardownError::new(format!("unlink {chain} from {hook}"), e));
                            break;
                        }
                    }
                }
            }

            for &(table, chain) in &selected {
                match self.nf.flush_chain(family, table, chain) {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => errors.push(TeardownError::new(format!("flush chain {chain}"), e)),
                }
            }

            for &(table, chain) in &selected {
                match self.nf.delete_chain(family, table, chain) {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => errors.push(TeardownError::new(format!("delete chain {chain}"), e)),
                }
            }
        }

        for e in &errors {
            warn!("{}", e);
        }
        errors
    }
}

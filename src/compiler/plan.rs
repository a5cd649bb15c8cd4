//! Compiled rule plan
//!
//! A [`RulePlan`] is the complete set of private chains, their rules and the
//! links from built-in hooks, per family and table. Plans are pruned before
//! installation so nothing empty or unreachable is ever created.

use std::collections::BTreeSet;
use std::fmt;

use super::rule::{Hook, Rule, Table};
use crate::policy::Family;

/// A private chain and its rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainPlan {
    /// Chain name
    pub name: String,
    /// Rules in evaluation order
    pub rules: Vec<Rule>,
}

/// Jump from a built-in hook into a private chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookLink {
    /// Built-in chain
    pub hook: Hook,
    /// Private chain
    pub chain: &'static str,
}

impl HookLink {
    /// The jump rule placed in the hook
    #[must_use]
    pub fn rule(&self) -> Rule {
        Rule::jump(self.chain)
    }
}

/// Chains and links of one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePlan {
    /// Netfilter table
    pub table: Table,
    /// Private chains, leaf chains first
    pub chains: Vec<ChainPlan>,
    /// Hook links, installed last
    pub links: Vec<HookLink>,
}

impl TablePlan {
    /// Empty table plan
    #[must_use]
    pub fn new(table: Table) -> Self {
        Self {
            table,
            chains: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Add a chain
    pub fn chain(&mut self, name: &str, rules: Vec<Rule>) {
        self.chains.push(ChainPlan {
            name: name.to_string(),
            rules,
        });
    }

    /// Add a hook link
    pub fn link(&mut self, hook: Hook, chain: &'static str) {
        self.links.push(HookLink { hook, chain });
    }

    /// Chain by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ChainPlan> {
        self.chains.iter().find(|c| c.name == name)
    }

    fn is_empty(&self) -> bool {
        self.chains.is_empty() && self.links.is_empty()
    }

    /// Drop empty chains, jumps into dropped chains, and anything not
    /// reachable from a hook link; repeat until nothing changes.
    fn prune(&mut self) {
        loop {
            let before = (self.chains.len(), self.rule_count(), self.links.len());

            self.chains.retain(|c| !c.rules.is_empty());
            let live: BTreeSet<String> = self.chains.iter().map(|c| c.name.clone()).collect();

            for chain in &mut self.chains {
                chain
                    .rules
                    .retain(|r| r.jump_target().map_or(true, |t| live.contains(t)));
            }
            self.links.retain(|l| live.contains(l.chain));

            let reachable = self.reachable();
            self.chains.retain(|c| reachable.contains(&c.name));

            if before == (self.chains.len(), self.rule_count(), self.links.len()) {
                break;
            }
        }
    }

    fn rule_count(&self) -> usize {
        self.chains.iter().map(|c| c.rules.len()).sum()
    }

    fn reachable(&self) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self.links.iter().map(|l| l.chain).collect();
        while let Some(name) = stack.pop() {
            if !seen.insert(name.to_string()) {
                continue;
            }
            if let Some(chain) = self.get(name) {
                stack.extend(chain.rules.iter().filter_map(Rule::jump_target));
            }
        }
        seen
    }
}

/// Both tables of one family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyPlan {
    /// Protocol family
    pub family: Family,
    /// Table plans, mangle first
    pub tables: Vec<TablePlan>,
}

impl FamilyPlan {
    /// Table plan by table
    #[must_use]
    pub fn table(&self, table: Table) -> Option<&TablePlan> {
        self.tables.iter().find(|t| t.table == table)
    }
}

/// Complete rule plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RulePlan {
    /// Enabled families, IPv4 first
    pub families: Vec<FamilyPlan>,
}

impl RulePlan {
    /// Plan for a family
    #[must_use]
    pub fn family(&self, family: Family) -> Option<&FamilyPlan> {
        self.families.iter().find(|f| f.family == family)
    }

    /// Chain plan by coordinates
    #[must_use]
    pub fn chain(&self, family: Family, table: Table, name: &str) -> Option<&ChainPlan> {
        self.family(family)?.table(table)?.get(name)
    }

    /// Whether a chain is part of the plan
    #[must_use]
    pub fn has_chain(&self, family: Family, table: Table, name: &str) -> bool {
        self.chain(family, table, name).is_some()
    }

    /// Prune every table, dropping tables and families left empty
    pub fn prune(&mut self) {
        for family in &mut self.families {
            for table in &mut family.tables {
                table.prune();
            }
            family.tables.retain(|t| !t.is_empty());
        }
        self.families.retain(|f| !f.tables.is_empty());
    }

    /// Whether the plan installs nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}

impl fmt::Display for RulePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for family in &self.families {
            for table in &family.tables {
                writeln!(f, "# {} {} ({})", family.family, table.table, family.family.iptables())?;
                for chain in &table.chains {
                    writeln!(f, "-N {}", chain.name)?;
                }
                for chain in &table.chains {
                    for rule in &chain.rules {
                        writeln!(f, "-A {} {}", chain.name, rule)?;
                    }
                }
                for link in &table.links {
                    writeln!(f, "-I {} {}", link.hook, link.rule())?;
                }
            }
        }
        Ok(())
    }
}

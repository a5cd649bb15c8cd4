//! In-memory kernel
//!
//! Mirrors the observable semantics of the real tools closely enough that a
//! full start/stop cycle can be exercised without root: built-in chains
//! exist up front, jumps and set matches must reference existing objects,
//! referenced chains and sets refuse deletion with `Busy`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use ipnet::IpNet;
use parking_lot::Mutex;

use super::{AddressSets, KernelResult, Netfilter, PolicyRoutes, Sysctl};
use crate::compiler::{Match, Rule, Table};
use crate::error::{KernelError, KernelErrorKind};
use crate::policy::Family;

const MANGLE_BUILTINS: [&str; 5] = ["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"];
const NAT_BUILTINS: [&str; 4] = ["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"];

type ChainKey = (Family, Table, String);

#[derive(Debug, Clone)]
struct MemSet {
    family: Family,
    members: BTreeSet<IpNet>,
}

#[derive(Debug, Default)]
struct State {
    chains: BTreeMap<ChainKey, Vec<Rule>>,
    sets: BTreeMap<String, MemSet>,
    policy_rules: Vec<(Family, u32, u32)>,
    routes: BTreeMap<(Family, u32), Vec<String>>,
    sysctl: BTreeMap<String, String>,
    busy_sets: BTreeMap<String, usize>,
    failing_chain: Option<String>,
    mutations: usize,
}

impl State {
    fn set_referenced(&self, name: &str) -> bool {
        self.chains.values().flatten().any(|rule| {
            rule.matches
                .iter()
                .any(|m| matches!(m, Match::DstInSet { set, .. } if set == name))
        })
    }

    fn chain_referenced(&self, family: Family, table: Table, chain: &str) -> bool {
        self.chains
            .iter()
            .filter(|((f, t, _), _)| *f == family && *t == table)
            .flat_map(|(_, rules)| rules)
            .any(|rule| rule.jump_target() == Some(chain))
    }

    fn check_rule(&self, family: Family, table: Table, rule: &Rule, command: &str) -> KernelResult<()> {
        if let Some(target) = rule.jump_target() {
            if !self.chains.contains_key(&(family, table, target.to_string())) {
                return Err(KernelError::not_found(command, "Couldn't load target"));
            }
        }
        for m in &rule.matches {
            if let Match::DstInSet { set, .. } = m {
                match self.sets.get(set) {
                    None => {
                        return Err(KernelError::not_found(
                            command,
                            format!("Set {set} doesn't exist."),
                        ))
                    }
                    Some(s) if s.family != family => {
                        return Err(KernelError::new(
                            command,
                            KernelErrorKind::Other,
                            format!("The protocol family of set {set} is not supported"),
                        ))
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

/// Kernel state kept in memory
#[derive(Debug)]
pub struct MemoryKernel {
    state: Mutex<State>,
}

impl Default for MemoryKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKernel {
    /// Empty kernel with only the built-in chains
    #[must_use]
    pub fn new() -> Self {
        let mut state = State::default();
        for family in Family::ALL {
            for name in MANGLE_BUILTINS {
                state.chains.insert((family, Table::Mangle, name.to_string()), Vec::new());
            }
            for name in NAT_BUILTINS {
                state.chains.insert((family, Table::Nat, name.to_string()), Vec::new());
            }
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Make the next `times` destroys of `set` fail with `Busy`
    pub fn inject_busy_set(&self, set: &str, times: usize) {
        self.state.lock().busy_sets.insert(set.to_string(), times);
    }

    /// Make every append to `chain` fail
    pub fn fail_appends_to(&self, chain: &str) {
        self.state.lock().failing_chain = Some(chain.to_string());
    }

    /// Number of state-changing operations performed so far
    #[must_use]
    pub fn mutations(&self) -> usize {
        self.state.lock().mutations
    }

    /// Rules of a chain
    #[must_use]
    pub fn rules(&self, family: Family, table: Table, chain: &str) -> Option<Vec<Rule>> {
        self.state
            .lock()
            .chains
            .get(&(family, table, chain.to_string()))
            .cloned()
    }

    /// User chains (non built-in) of a table
    #[must_use]
    pub fn user_chains(&self, family: Family, table: Table) -> Vec<String> {
        let builtins: &[&str] = match table {
            Table::Mangle => &MANGLE_BUILTINS,
            Table::Nat => &NAT_BUILTINS,
        };
        self.state
            .lock()
            .chains
            .keys()
            .filter(|(f, t, name)| *f == family && *t == table && !builtins.contains(&name.as_str()))
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Names of existing sets
    #[must_use]
    pub fn set_names(&self) -> Vec<String> {
        self.state.lock().sets.keys().cloned().collect()
    }

    /// Current value of a kernel parameter
    #[must_use]
    pub fn param(&self, key: &str) -> Option<String> {
        self.state.lock().sysctl.get(key).cloned()
    }

    /// Number of fwmark policy rules for a family
    #[must_use]
    pub fn policy_rule_count(&self, family: Family) -> usize {
        self.state
            .lock()
            .policy_rules
            .iter()
            .filter(|(f, _, _)| *f == family)
            .count()
    }

    /// Render all state in a stable textual form
    #[must_use]
    pub fn snapshot(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();

        let mut current: Option<(Family, Table)> = None;
        for ((family, table, chain), rules) in &state.chains {
            if current != Some((*family, *table)) {
                let _ = writeln!(out, "# {family} {table}");
                current = Some((*family, *table));
            }
            let _ = writeln!(out, ":{chain}");
            for rule in rules {
                let _ = writeln!(out, "-A {chain} {rule}");
            }
        }

        let _ = writeln!(out, "# sets");
        for (name, set) in &state.sets {
            let _ = writeln!(out, "create {name} hash:net family {}", set.family.ipset_family());
            for member in &set.members {
                let _ = writeln!(out, "add {name} {member}");
            }
        }

        let _ = writeln!(out, "# routing");
        for (family, mark, table) in &state.policy_rules {
            let _ = writeln!(out, "{family} rule fwmark {mark:#x} lookup {table}");
        }
        for ((family, table), routes) in &state.routes {
            for route in routes {
                let _ = writeln!(out, "{family} route {route} table {table}");
            }
        }

        let _ = writeln!(out, "# sysctl");
        for (key, value) in &state.sysctl {
            let _ = writeln!(out, "{key} = {value}");
        }
        out
    }
}

fn describe(family: Family, table: Table, op: &str, chain: &str) -> String {
    format!("{} -t {table} {op} {chain}", family.iptables())
}

impl Netfilter for MemoryKernel {
    fn available(&self, _family: Family) -> bool {
        true
    }

    fn chain_exists(&self, family: Family, table: Table, chain: &str) -> KernelResult<bool> {
        Ok(self.state.lock().chains.contains_key(&(family, table, chain.to_string())))
    }

    fn new_chain(&self, family: Family, table: Table, chain: &str) -> KernelResult<()> {
        let mut state = self.state.lock();
        let key = (family, table, chain.to_string());
        if state.chains.contains_key(&key) {
            return Err(KernelError::new(
                describe(family, table, "-N", chain),
                KernelErrorKind::Exists,
                "Chain already exists.",
            ));
        }
        state.chains.insert(key, Vec::new());
        state.mutations += 1;
        Ok(())
    }

    fn flush_chain(&self, family: Family, table: Table, chain: &str) -> KernelResult<()> {
        let mut state = self.state.lock();
        let Some(rules) = state.chains.get_mut(&(family, table, chain.to_string())) else {
            return Err(KernelError::not_found(
                describe(family, table, "-F", chain),
                "No chain/target/match by that name.",
            ));
        };
        rules.clear();
        state.mutations += 1;
        Ok(())
    }

    fn delete_chain(&self, family: Family, table: Table, chain: &str) -> KernelResult<()> {
        let mut state = self.state.lock();
        let command = describe(family, table, "-X", chain);
        let key = (family, table, chain.to_string());
        let builtin = match table {
            Table::Mangle => MANGLE_BUILTINS.contains(&chain),
            Table::Nat => NAT_BUILTINS.contains(&chain),
        };
        match state.chains.get(&key) {
            None => return Err(KernelError::not_found(command, "No chain/target/match by that name.")),
            Some(_) if builtin => {
                return Err(KernelError::new(command, KernelErrorKind::Other, "Cannot delete built-in chain"))
            }
            Some(rules) if !rules.is_empty() => {
                return Err(KernelError::busy(command, "Directory not empty."))
            }
            Some(_) => {}
        }
        if state.chain_referenced(family, table, chain) {
            return Err(KernelError::busy(command, "Too many links."));
        }
        state.chains.remove(&key);
        state.mutations += 1;
        Ok(())
    }

    fn append(&self, family: Family, table: Table, chain: &str, rule: &Rule) -> KernelResult<()> {
        let mut state = self.state.lock();
        let command = describe(family, table, "-A", chain);
        if state.failing_chain.as_deref() == Some(chain) {
            return Err(KernelError::new(command, KernelErrorKind::Other, "injected failure"));
        }
        state.check_rule(family, table, rule, &command)?;
        let Some(rules) = state.chains.get_mut(&(family, table, chain.to_string())) else {
            return Err(KernelError::not_found(command, "No chain/target/match by that name."));
        };
        rules.push(rule.clone());
        state.mutations += 1;
        Ok(())
    }

    fn insert(&self, family: Family, table: Table, chain: &str, rule: &Rule) -> KernelResult<()> {
        let mut state = self.state.lock();
        let command = describe(family, table, "-I", chain);
        state.check_rule(family, table, rule, &command)?;
        let Some(rules) = state.chains.get_mut(&(family, table, chain.to_string())) else {
            return Err(KernelError::not_found(command, "No chain/target/match by that name."));
        };
        rules.insert(0, rule.clone());
        state.mutations += 1;
        Ok(())
    }

    fn delete(&self, family: Family, table: Table, chain: &str, rule: &Rule) -> KernelResult<()> {
        let mut state = self.state.lock();
        let command = describe(family, table, "-D", chain);
        let Some(rules) = state.chains.get_mut(&(family, table, chain.to_string())) else {
            return Err(KernelError::not_found(command, "No chain/target/match by that name."));
        };
        let Some(pos) = rules.iter().position(|r| r == rule) else {
            return Err(KernelError::not_found(
                command,
                "Bad rule (does a matching rule exist in that chain?).",
            ));
        };
        rules.remove(pos);
        state.mutations += 1;
        Ok(())
    }

    fn contains(&self, family: Family, table: Table, chain: &str, rule: &Rule) -> KernelResult<bool> {
        Ok(self
            .state
            .lock()
            .chains
            .get(&(family, table, chain.to_string()))
            .map_or(false, |rules| rules.contains(rule)))
    }

    fn list(&self, family: Family, table: Table, chain: &str) -> KernelResult<Vec<String>> {
        let state = self.state.lock();
        let Some(rules) = state.chains.get(&(family, table, chain.to_string())) else {
            return Err(KernelError::not_found(
                describe(family, table, "-S", chain),
                "No chain/target/match by that name.",
            ));
        };
        Ok(rules.iter().map(|r| format!("-A {chain} {r}")).collect())
    }
}

impl AddressSets for MemoryKernel {
    fn set_exists(&self, name: &str) -> KernelResult<bool> {
        Ok(self.state.lock().sets.contains_key(name))
    }

    fn create_set(&self, name: &str, family: Family) -> KernelResult<()> {
        let mut state = self.state.lock();
        match state.sets.get(name) {
            Some(existing) if existing.family == family => Ok(()),
            Some(_) => Err(KernelError::new(
                format!("ipset create {name}"),
                KernelErrorKind::Exists,
                "Set cannot be created: set with the same name already exists",
            )),
            None => {
                state.sets.insert(
                    name.to_string(),
                    MemSet {
                        family,
                        members: BTreeSet::new(),
                    },
                );
                state.mutations += 1;
                Ok(())
            }
        }
    }

    fn restore_set(&self, name: &str, members: &[IpNet]) -> KernelResult<()> {
        let mut state = self.state.lock();
        let Some(set) = state.sets.get_mut(name) else {
            return Err(KernelError::not_found(
                "ipset restore",
                format!("The set with the given name does not exist: {name}"),
            ));
        };
        for member in members {
            if Family::of(&member.addr()) != set.family {
                return Err(KernelError::new(
                    "ipset restore",
                    KernelErrorKind::Other,
                    format!("{member} does not match the family of {name}"),
                ));
            }
            set.members.insert(member.trunc());
        }
        state.mutations += 1;
        Ok(())
    }

    fn swap_sets(&self, a: &str, b: &str) -> KernelResult<()> {
        let mut state = self.state.lock();
        let command = format!("ipset swap {a} {b}");
        let (Some(set_a), Some(set_b)) = (state.sets.get(a).cloned(), state.sets.get(b).cloned()) else {
            return Err(KernelError::not_found(command, "The set with the given name does not exist"));
        };
        if set_a.family != set_b.family {
            return Err(KernelError::new(
                command,
                KernelErrorKind::Other,
                "The sets cannot be swapped: their type does not match",
            ));
        }
        state.sets.insert(a.to_string(), set_b);
        state.sets.insert(b.to_string(), set_a);
        state.mutations += 1;
        Ok(())
    }

    fn destroy_set(&self, name: &str) -> KernelResult<()> {
        let mut state = self.state.lock();
        let command = format!("ipset destroy {name}");
        if !state.sets.contains_key(name) {
            return Err(KernelError::not_found(command, "The set with the given name does not exist"));
        }
        if let Some(remaining) = state.busy_sets.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(KernelError::busy(command, "Set cannot be destroyed: it is in use by a kernel component"));
            }
        }
        if state.set_referenced(name) {
            return Err(KernelError::busy(command, "Set cannot be destroyed: it is in use by a kernel component"));
        }
        state.sets.remove(name);
        state.mutations += 1;
        Ok(())
    }

    fn list_members(&self, name: &str) -> KernelResult<Vec<IpNet>> {
        self.state
            .lock()
            .sets
            .get(name)
            .map(|set| set.members.iter().copied().collect())
            .ok_or_else(|| KernelError::not_found(format!("ipset list {name}"), "The set with the given name does not exist"))
    }
}

impl PolicyRoutes for MemoryKernel {
    fn add_rule(&self, family: Family, mark: u32, table: u32) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.policy_rules.push((family, mark, table));
        state.mutations += 1;
        Ok(())
    }

    fn delete_rule(&self, family: Family, mark: u32, table: u32) -> KernelResult<()> {
        let mut state = self.state.lock();
        let Some(pos) = state.policy_rules.iter().position(|r| *r == (family, mark, table)) else {
            return Err(KernelError::not_found(
                format!("ip {} rule del fwmark {mark:#x} table {table}", family.ip_flag()),
                "RTNETLINK answers: No such file or directory",
            ));
        };
        state.policy_rules.remove(pos);
        state.mutations += 1;
        Ok(())
    }

    fn has_rule(&self, family: Family, mark: u32, table: u32) -> KernelResult<bool> {
        Ok(self.state.lock().policy_rules.contains(&(family, mark, table)))
    }

    fn add_local_route(&self, family: Family, table: u32) -> KernelResult<()> {
        let mut state = self.state.lock();
        let route = "local default dev lo".to_string();
        let routes = state.routes.entry((family, table)).or_default();
        if routes.contains(&route) {
            return Err(KernelError::new(
                format!("ip {} route add local default dev lo table {table}", family.ip_flag()),
                KernelErrorKind::Exists,
                "RTNETLINK answers: File exists",
            ));
        }
        routes.push(route);
        state.mutations += 1;
        Ok(())
    }

    fn flush_table(&self, family: Family, table: u32) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.routes.remove(&(family, table));
        state.mutations += 1;
        Ok(())
    }

    fn table_routes(&self, family: Family, table: u32) -> KernelResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .routes
            .get(&(family, table))
            .cloned()
            .unwrap_or_default())
    }
}

impl Sysctl for MemoryKernel {
    fn set_param(&self, key: &str, value: &str) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.sysctl.insert(key.to_string(), value.to_string());
        state.mutations += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Target;

    #[test]
    fn test_builtin_chains_present() {
        let kernel = MemoryKernel::new();
        assert!(kernel.chain_exists(Family::V6, Table::Nat, "POSTROUTING").unwrap());
        assert!(!kernel.chain_exists(Family::V4, Table::Nat, "FORWARD").unwrap());
        assert!(kernel.user_chains(Family::V4, Table::Mangle).is_empty());
    }

    #[test]
    fn test_jump_requires_target_chain() {
        let kernel = MemoryKernel::new();
        let err = kernel
            .append(Family::V4, Table::Mangle, "OUTPUT", &Rule::jump("TPGATE_OUTPUT"))
            .unwrap_err();
        assert!(err.is_not_found());

        kernel.new_chain(Family::V4, Table::Mangle, "TPGATE_OUTPUT").unwrap();
        kernel
            .append(Family::V4, Table::Mangle, "OUTPUT", &Rule::jump("TPGATE_OUTPUT"))
            .unwrap();

        let err = kernel.delete_chain(Family::V4, Table::Mangle, "TPGATE_OUTPUT").unwrap_err();
        assert!(err.is_busy());
    }

    #[test]
    fn test_referenced_set_is_busy() {
        let kernel = MemoryKernel::new();
        kernel.create_set("allow-v4", Family::V4).unwrap();
        kernel.new_chain(Family::V4, Table::Nat, "X").unwrap();
        let rule = Rule::to(Target::Return).dst_set("allow-v4", false);
        kernel.append(Family::V4, Table::Nat, "X", &rule).unwrap();

        assert!(kernel.destroy_set("allow-v4").unwrap_err().is_busy());
        kernel.flush_chain(Family::V4, Table::Nat, "X").unwrap();
        kernel.destroy_set("allow-v4").unwrap();
        assert!(kernel.destroy_set("allow-v4").unwrap_err().is_not_found());
    }

    #[test]
    fn test_set_family_enforced() {
        let kernel = MemoryKernel::new();
        kernel.create_set("allow-v6", Family::V6).unwrap();
        kernel.new_chain(Family::V4, Table::Nat, "X").unwrap();
        let rule = Rule::to(Target::Return).dst_set("allow-v6", false);
        assert!(kernel.append(Family::V4, Table::Nat, "X", &rule).is_err());

        let v4: IpNet = "10.0.0.0/8".parse().unwrap();
        assert!(kernel.restore_set("allow-v6", &[v4]).is_err());
    }

    #[test]
    fn test_swap_exchanges_members() {
        let kernel = MemoryKernel::new();
        kernel.create_set("a", Family::V4).unwrap();
        kernel.create_set("a-tmp", Family::V4).unwrap();
        let net: IpNet = "10.0.0.0/8".parse().unwrap();
        kernel.restore_set("a-tmp", &[net]).unwrap();
        kernel.swap_sets("a-tmp", "a").unwrap();
        assert_eq!(kernel.list_members("a").unwrap(), vec![net]);
        assert!(kernel.list_members("a-tmp").unwrap().is_empty());
    }

    #[test]
    fn test_injected_busy_is_transient() {
        let kernel = MemoryKernel::new();
        kernel.create_set("deny-v4", Family::V4).unwrap();
        kernel.inject_busy_set("deny-v4", 2);
        assert!(kernel.destroy_set("deny-v4").unwrap_err().is_busy());
        assert!(kernel.destroy_set("deny-v4").unwrap_err().is_busy());
        kernel.destroy_set("deny-v4").unwrap();
    }

    #[test]
    fn test_policy_rules_allow_duplicates() {
        let kernel = MemoryKernel::new();
        kernel.add_rule(Family::V4, 0x2333, 233).unwrap();
        kernel.add_rule(Family::V4, 0x2333, 233).unwrap();
        assert_eq!(kernel.policy_rule_count(Family::V4), 2);
        kernel.delete_rule(Family::V4, 0x2333, 233).unwrap();
        kernel.delete_rule(Family::V4, 0x2333, 233).unwrap();
        assert!(kernel.delete_rule(Family::V4, 0x2333, 233).unwrap_err().is_not_found());
    }

    #[test]
    fn test_snapshot_is_stable() {
        let kernel = MemoryKernel::new();
        kernel.set_param("net.ipv4.ip_forward", "1").unwrap();
        kernel.add_local_route(Family::V4, 233).unwrap();
        let a = kernel.snapshot();
        let b = kernel.snapshot();
        assert_eq!(a, b);
        assert!(a.contains("net.ipv4.ip_forward = 1"));
        assert!(a.contains("ipv4 route local default dev lo table 233"));
    }
}

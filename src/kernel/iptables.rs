//! `iptables` / `ip6tables` backend
//!
//! Every invocation passes `-w` so concurrent rule edits by other tools wait
//! on the xtables lock instead of failing.

use tracing::debug;

use super::{classify, KernelResult, Netfilter, SystemKernel};
use crate::compiler::{Rule, Table};
use crate::error::{KernelError, KernelErrorKind};
use crate::exec::{find_in_path, render_command, CommandRunner};
use crate::policy::Family;

impl<R: CommandRunner> SystemKernel<R> {
    fn iptables(&self, family: Family, table: Table, args: Vec<String>) -> KernelResult<String> {
        let mut full = vec!["-w".to_string(), "-t".to_string(), table.as_str().to_string()];
        full.extend(args);

        let program = family.iptables();
        let command = render_command(program, &full);
        debug!("{}", command);

        let output = self
            .runner()
            .run(program, &full, None)
            .map_err(|e| KernelError::new(&command, KernelErrorKind::Other, e.to_string()))?;

        if output.success {
            Ok(output.stdout)
        } else {
            Err(KernelError::new(&command, classify(&output.stderr), output.stderr))
        }
    }

    fn rule_args(op: &str, chain: &str, rule: &Rule) -> Vec<String> {
        let mut args = vec![op.to_string(), chain.to_string()];
        args.extend(rule.to_args());
        args
    }
}

impl<R: CommandRunner> Netfilter for SystemKernel<R> {
    fn available(&self, family: Family) -> bool {
        find_in_path(family.iptables()).is_some()
    }

    fn chain_exists(&self, family: Family, table: Table, chain: &str) -> KernelResult<bool> {
        match self.iptables(family, table, vec!["-S".into(), chain.into()]) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn new_chain(&self, family: Family, table: Table, chain: &str) -> KernelResult<()> {
        self.iptables(family, table, vec!["-N".into(), chain.into()]).map(drop)
    }

    fn flush_chain(&self, family: Family, table: Table, chain: &str) -> KernelResult<()> {
        self.iptables(family, table, vec!["-F".into(), chain.into()]).map(drop)
    }

    fn delete_chain(&self, family: Family, table: Table, chain: &str) -> KernelResult<()> {
        self.iptables(family, table, vec!["-X".into(), chain.into()]).map(drop)
    }

    fn append(&self, family: Family, table: Table, chain: &str, rule: &Rule) -> KernelResult<()> {
        self.iptables(family, table, Self::rule_args("-A", chain, rule)).map(drop)
    }

    fn insert(&self, family: Family, table: Table, chain: &str, rule: &Rule) -> KernelResult<()> {
        self.iptables(family, table, Self::rule_args("-I", chain, rule)).map(drop)
    }

    fn delete(&self, family: Family, table: Table, chain: &str, rule: &Rule) -> KernelResult<()> {
        self.iptables(family, table, Self::rule_args("-D", chain, rule)).map(drop)
    }

    fn contains(&self, family: Family, table: Table, chain: &str, rule: &Rule) -> KernelResult<bool> {
        match self.iptables(family, table, Self::rule_args("-C", chain, rule)) {
            Ok(_) => Ok(true),
            // -C exits 1 both for "no such rule" and "no such chain"
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list(&self, family: Family, table: Table, chain: &str) -> KernelResult<Vec<String>> {
        let stdout = self.iptables(family, table, vec!["-S".into(), chain.into()])?;
        Ok(stdout
            .lines()
            .filter(|line| line.starts_with("-A "))
            .map(str::to_string)
            .collect())
    }
}

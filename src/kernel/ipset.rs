//! `ipset` backend

use std::fmt::Write as _;

use ipnet::IpNet;
use tracing::debug;

use super::{classify, AddressSets, KernelResult, SystemKernel};
use crate::error::{KernelError, KernelErrorKind};
use crate::exec::{render_command, CommandRunner};
use crate::policy::Family;

impl<R: CommandRunner> SystemKernel<R> {
    fn ipset(&self, args: Vec<String>, stdin: Option<&str>) -> KernelResult<String> {
        let command = render_command("ipset", &args);
        debug!("{}", command);

        let output = self
            .runner()
            .run("ipset", &args, stdin)
            .map_err(|e| KernelError::new(&command, KernelErrorKind::Other, e.to_string()))?;

        if output.success {
            Ok(output.stdout)
        } else {
            Err(KernelError::new(&command, classify(&output.stderr), output.stderr))
        }
    }
}

impl<R: CommandRunner> AddressSets for SystemKernel<R> {
    fn set_exists(&self, name: &str) -> KernelResult<bool> {
        match self.ipset(vec!["-n".into(), "list".into(), name.into()], None) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn create_set(&self, name: &str, family: Family) -> KernelResult<()> {
        self.ipset(
            vec![
                "create".into(),
                name.into(),
                "hash:net".into(),
                "family".into(),
                family.ipset_family().into(),
                "-exist".into(),
            ],
            None,
        )
        .map(drop)
    }

    fn restore_set(&self, name: &str, members: &[IpNet]) -> KernelResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut script = String::with_capacity(members.len() * 24);
        for member in members {
            let _ = writeln!(script, "add {name} {member}");
        }
        self.ipset(vec!["restore".into(), "-exist".into()], Some(&script)).map(drop)
    }

    fn swap_sets(&self, a: &str, b: &str) -> KernelResult<()> {
        self.ipset(vec!["swap".into(), a.into(), b.into()], None).map(drop)
    }

    fn destroy_set(&self, name: &str) -> KernelResult<()> {
        self.ipset(vec!["destroy".into(), name.into()], None).map(drop)
    }

    fn list_members(&self, name: &str) -> KernelResult<Vec<IpNet>> {
        let stdout = self.ipset(vec!["list".into(), name.into()], None)?;
        Ok(parse_members(&stdout))
    }
}

/// Members section of `ipset list` output
fn parse_members(listing: &str) -> Vec<IpNet> {
    listing
        .lines()
        .skip_while(|line| !line.starts_with("Members:"))
        .skip(1)
        .filter_map(|line| {
            let token = line.split_whitespace().next()?;
            token
                .parse::<IpNet>()
                .ok()
                .or_else(|| token.parse::<std::net::IpAddr>().ok().map(IpNet::from))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_members() {
        let listing = "Name: allow-v4\nType: hash:net\nRevision: 7\nHeader: family inet hashsize 1024\n\
                       Size in memory: 504\nReferences: 1\nNumber of entries: 2\nMembers:\n\
                       10.0.0.0/8\n192.168.1.1\n";
        let members = parse_members(listing);
        assert_eq!(members.len(), 2);
        assert_eq!(members[0], "10.0.0.0/8".parse::<IpNet>().unwrap());
        assert_eq!(members[1], "192.168.1.1/32".parse::<IpNet>().unwrap());
    }

    #[test]
    fn test_parse_members_empty() {
        assert!(parse_members("Name: deny-v6\nMembers:\n").is_empty());
        assert!(parse_members("").is_empty());
    }
}

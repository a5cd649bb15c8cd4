//! `ip rule` / `ip route` backend

use tracing::debug;

use super::{classify, KernelResult, PolicyRoutes, SystemKernel};
use crate::error::{KernelError, KernelErrorKind};
use crate::exec::{render_command, CommandRunner};
use crate::policy::Family;

impl<R: CommandRunner> SystemKernel<R> {
    fn ip(&self, family: Family, args: &[String]) -> KernelResult<String> {
        let mut full = vec![family.ip_flag().to_string()];
        full.extend_from_slice(args);

        let command = render_command("ip", &full);
        debug!("{}", command);

        let output = self
            .runner()
            .run("ip", &full, None)
            .map_err(|e| KernelError::new(&command, KernelErrorKind::Other, e.to_string()))?;

        if output.success {
            Ok(output.stdout)
        } else {
            Err(KernelError::new(&command, classify(&output.stderr), output.stderr))
        }
    }
}

fn rule_selector(op: &str, mark: u32, table: u32) -> Vec<String> {
    vec![
        "rule".into(),
        op.into(),
        "fwmark".into(),
        format!("{mark:#x}"),
        "table".into(),
        table.to_string(),
    ]
}

/// Whether an `ip rule list` line is our fwmark rule
fn is_mark_rule(line: &str, mark: u32, table: u32) -> bool {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let has_mark = tokens.windows(2).any(|w| {
        w[0] == "fwmark"
            && u32::from_str_radix(w[1].trim_start_matches("0x"), 16).map_or(false, |m| m == mark)
    });
    let has_table = tokens
        .windows(2)
        .any(|w| (w[0] == "lookup" || w[0] == "table") && w[1] == table.to_string());
    has_mark && has_table
}

impl<R: CommandRunner> PolicyRoutes for SystemKernel<R> {
    fn add_rule(&self, family: Family, mark: u32, table: u32) -> KernelResult<()> {
        self.ip(family, &rule_selector("add", mark, table)).map(drop)
    }

    fn delete_rule(&self, family: Family, mark: u32, table: u32) -> KernelResult<()> {
        self.ip(family, &rule_selector("del", mark, table)).map(drop)
    }

    fn has_rule(&self, family: Family, mark: u32, table: u32) -> KernelResult<bool> {
        let stdout = self.ip(family, &["rule".into(), "list".into()])?;
        Ok(stdout.lines().any(|line| is_mark_rule(line, mark, table)))
    }

    fn add_local_route(&self, family: Family, table: u32) -> KernelResult<()> {
        let args = [
            "route".into(),
            "add".into(),
            "local".into(),
            "default".into(),
            "dev".into(),
            "lo".into(),
            "table".into(),
            table.to_string(),
        ];
        self.ip(family, &args).map(drop)
    }

    fn flush_table(&self, family: Family, table: u32) -> KernelResult<()> {
        let args = ["route".into(), "flush".into(), "table".into(), table.to_string()];
        self.ip(family, &args).map(drop)
    }

    fn table_routes(&self, family: Family, table: u32) -> KernelResult<Vec<String>> {
        let args = ["route".into(), "show".into(), "table".into(), table.to_string()];
        match self.ip(family, &args) {
            Ok(stdout) => Ok(stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
            // an empty table "does not exist" as far as iproute2 is concerned
            Err(e) if e.is_not_found() || e.message.contains("FIB table does not exist") => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_mark_rule() {
        assert!(is_mark_rule("32765:\tfrom all fwmark 0x2333 lookup 233", 0x2333, 233));
        assert!(!is_mark_rule("32765:\tfrom all fwmark 0x2333 lookup 234", 0x2333, 233));
        assert!(!is_mark_rule("32766:\tfrom all lookup main", 0x2333, 233));
        assert!(!is_mark_rule("32765:\tfrom all fwmark 0x1 lookup 233", 0x2333, 233));
    }

    #[test]
    fn test_rule_selector() {
        assert_eq!(
            rule_selector("add", 0x2333, 233).join(" "),
            "rule add fwmark 0x2333 table 233"
        );
    }
}

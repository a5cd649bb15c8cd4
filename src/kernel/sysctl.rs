//! Kernel parameters

use tracing::debug;

use super::{classify, KernelResult, SystemKernel, Sysctl};
use crate::error::{KernelError, KernelErrorKind};
use crate::exec::{render_command, CommandRunner};
use crate::policy::{Family, Policy};

/// Parameters the engine sets before installing anything
#[must_use]
pub fn required_params(policy: &Policy) -> Vec<(&'static str, &'static str)> {
    let mut params = Vec::new();
    if policy.has_family(Family::V4) {
        params.extend([
            ("net.ipv4.ip_forward", "1"),
            ("net.ipv4.conf.all.route_localnet", "1"),
            ("net.ipv4.conf.all.send_redirects", "0"),
            ("net.ipv4.conf.default.send_redirects", "0"),
        ]);
    }
    if policy.has_family(Family::V6) {
        params.push(("net.ipv6.conf.all.forwarding", "1"));
    }
    params
}

impl<R: CommandRunner> Sysctl for SystemKernel<R> {
    fn set_param(&self, key: &str, value: &str) -> KernelResult<()> {
        let args = vec!["-q".to_string(), "-w".to_string(), format!("{key}={value}")];
        let command = render_command("sysctl", &args);
        debug!("{}", command);

        let output = self
            .runner()
            .run("sysctl", &args, None)
            .map_err(|e| KernelError::new(&command, KernelErrorKind::Other, e.to_string()))?;

        if output.success {
            Ok(())
        } else {
            Err(KernelError::new(&command, classify(&output.stderr), output.stderr))
        }
    }
}

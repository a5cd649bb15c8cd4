//! Proxy process control
//!
//! The proxy is opaque: start and stop are operator shell commands run
//! under the proxy group. Configured process names are used to find
//! leftovers and to report liveness.

use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::config::ProxyConfig;
use crate::error::ProcessError;
use crate::process::{terminate, ProcessControl};

/// Starts and stops the proxy
pub struct ProxyController<'a> {
    config: &'a ProxyConfig,
    processes: &'a dyn ProcessControl,
}

impl<'a> ProxyController<'a> {
    /// Controller for one proxy configuration
    pub fn new(config: &'a ProxyConfig, processes: &'a dyn ProcessControl) -> Self {
        Self { config, processes }
    }

    /// Run the start command under the proxy group.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError` if the command fails.
    pub fn start(&self) -> Result<(), ProcessError> {
        if self.config.start_cmd.trim().is_empty() {
            warn!("proxy.start_cmd is empty, assuming the proxy is managed elsewhere");
            return Ok(());
        }
        self.processes
            .run_shell(&self.config.start_cmd, Some(&self.config.group))?;
        info!("Proxy started");
        Ok(())
    }

    /// Run the stop command, then terminate anything left by name.
    pub fn stop(&self, backoff: &Backoff) {
        if let Some(cmd) = &self.config.stop_cmd {
            if let Err(e) = self.processes.run_shell(cmd, Some(&self.config.group)) {
                warn!("Proxy stop command failed: {}", e);
            }
        }
        let outcome = terminate(self.processes, &self.named_pids(), backoff);
        if outcome.killed > 0 {
            warn!("{} proxy process(es) had to be killed", outcome.killed);
        }
    }

    /// Liveness by process name; `None` when no names are configured
    pub fn is_running(&self) -> Option<bool> {
        if self.config.process_names.is_empty() {
            return None;
        }
        Some(!self.named_pids().is_empty())
    }

    fn named_pids(&self) -> Vec<u32> {
        self.config
            .process_names
            .iter()
            .flat_map(|name| self.processes.pids_by_name(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MemoryProcesses;

    fn proxy_config() -> ProxyConfig {
        ProxyConfig {
            start_cmd: "ss-redir -c /etc/ss.json -f /run/ss.pid".into(),
            stop_cmd: Some("kill $(cat /run/ss.pid)".into()),
            process_names: vec!["ss-redir".into()],
            ..ProxyConfig::default()
        }
    }

    #[test]
    fn test_start_stop() {
        let procs = MemoryProcesses::new();
        let config = proxy_config();
        let proxy = ProxyController::new(&config, &procs);

        proxy.start().unwrap();
        assert_eq!(proxy.is_running(), Some(false));
        let pid = procs.add_process("ss-redir", Some("proxy"));
        assert_eq!(proxy.is_running(), Some(true));

        proxy.stop(&Backoff::immediate(1));
        assert!(!procs.is_alive(pid));
        assert_eq!(procs.shell_commands().len(), 2);
    }

    #[test]
    fn test_unknown_liveness_and_empty_start() {
        let procs = MemoryProcesses::new();
        let config = ProxyConfig::default();
        let proxy = ProxyController::new(&config, &procs);
        proxy.start().unwrap();
        assert!(procs.shell_commands().is_empty());
        assert_eq!(proxy.is_running(), None);
    }

    #[test]
    fn test_start_failure_is_reported() {
        let procs = MemoryProcesses::new();
        procs.fail_shell(true);
        let config = proxy_config();
        assert!(ProxyController::new(&config, &procs).start().is_err());
    }
}

//! Operator hooks around start and stop

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::config::HooksConfig;
use crate::process::ProcessControl;

/// Points where operators can run their own logic.
///
/// Every method defaults to doing nothing. Hook failures are reported by
/// the implementation and never abort the lifecycle.
pub trait LifecycleHooks {
    /// Before anything is installed
    fn pre_start(&self) {}

    /// After rules are in place, before the record is written
    fn post_start(&self) {}

    /// Before anything is removed
    fn pre_stop(&self) {}

    /// After the fail-safe is installed
    fn post_stop(&self) {}

    /// Extra fields persisted in the advisory record
    fn record_fields(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// No hooks
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl LifecycleHooks for NoHooks {}

/// Hooks backed by shell commands from the configuration
pub struct CommandHooks<'a> {
    commands: HooksConfig,
    processes: &'a dyn ProcessControl,
}

impl<'a> CommandHooks<'a> {
    /// Hooks running `commands` through `processes`
    pub fn new(commands: HooksConfig, processes: &'a dyn ProcessControl) -> Self {
        Self { commands, processes }
    }

    fn run(&self, name: &str, command: Option<&String>) {
        let Some(command) = command else {
            return;
        };
        info!("Running {} hook", name);
        if let Err(e) = self.processes.run_shell(command, None) {
            warn!("{} hook failed: {}", name, e);
        }
    }
}

impl LifecycleHooks for CommandHooks<'_> {
    fn pre_start(&self) {
        self.run("pre-start", self.commands.pre_start.as_ref());
    }

    fn post_start(&self) {
        self.run("post-start", self.commands.post_start.as_ref());
    }

    fn pre_stop(&self) {
        self.run("pre-stop", self.commands.pre_stop.as_ref());
    }

    fn post_stop(&self) {
        self.run("post-stop", self.commands.post_stop.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MemoryProcesses;

    #[test]
    fn test_command_hooks_run_configured_only() {
        let procs = MemoryProcesses::new();
        let hooks = CommandHooks::new(
            HooksConfig {
                pre_start: Some("logger starting".into()),
                post_stop: Some("logger stopped".into()),
                ..Default::default()
            },
            &procs,
        );
        hooks.pre_start();
        hooks.post_start();
        hooks.pre_stop();
        hooks.post_stop();
        assert_eq!(procs.shell_commands(), vec!["logger starting", "logger stopped"]);
    }

    #[test]
    fn test_failing_hook_is_tolerated() {
        let procs = MemoryProcesses::new();
        procs.fail_shell(true);
        let hooks = CommandHooks::new(
            HooksConfig {
                pre_stop: Some("false".into()),
                ..Default::default()
            },
            &procs,
        );
        hooks.pre_stop();
        assert!(hooks.record_fields().is_empty());
    }
}

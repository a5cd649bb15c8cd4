//! Lifecycle state machine
//!
//! Orchestrates start, stop and restart over the kernel backends and the
//! two external processes. The state is never trusted from disk:
//! [`RuntimeFacts`] are probed from the live kernel on every call and the
//! [`AdvisoryRecord`] is only read when the probe says "started".
//!
//! # Start
//!
//! ```text
//! load lists / check environment     (errors abort, nothing touched yet)
//! started? -> stop
//! flush residual engine state
//! pre-start hook
//! sysctl -> sets -> proxy -> resolver -> routing -> rules
//! post-start hook -> record -> sweep unreferenced chains
//! ```
//!
//! # Stop
//!
//! ```text
//! pre-stop hook -> delete record
//! rules -> routing -> resolver, proxy -> sets
//! fail-safe rules -> post-stop hook
//! ```
//!
//! Stop never fails; every problem is logged and reported in the
//! [`StopReport`].

mod hooks;
mod proxy;
mod record;
mod resolver;
mod state;

use serde::Serialize;
use tracing::{debug, info, warn};

pub use hooks::{CommandHooks, LifecycleHooks, NoHooks};
pub use proxy::ProxyController;
pub use record::AdvisoryRecord;
pub use resolver::{chinadns_args, ChinaDns, CommandResolver, ResolverContext, ResolverController};
pub use state::{LifecycleState, RuntimeFacts};

use crate::backoff::Backoff;
use crate::compiler::{compile, compile_failsafe, RuleApplier, ENGINE_CHAINS, FAILSAFE_CHAINS};
use crate::config::{Config, DnsBackend};
use crate::error::{ApplyError, EnvironmentError, ProcessError, Result, TeardownError};
use crate::exec::find_in_path;
use crate::kernel::{required_params, Kernel};
use crate::policy::{Family, Policy};
use crate::process::ProcessControl;
use crate::routing::{FwMark, PolicyRouting};
use crate::sets::{
    build_memberships, existing_domain_files, load_sources, write_domain_files, AddressSetBuilder, DomainFiles,
    HostResolver, SystemResolver,
};

/// Outcome of a successful start
#[derive(Debug, Default)]
pub struct StartReport {
    /// The engine was running and got stopped first
    pub replaced_running: bool,
    /// Pid of the resolver, when known
    pub resolver_pid: Option<u32>,
    /// Proxy or resolver failures tolerated during start
    pub process_errors: Vec<ProcessError>,
}

/// Outcome of a stop
#[derive(Debug, Default)]
pub struct StopReport {
    /// The probe said "started" before stopping
    pub was_started: bool,
    /// Removal failures, already logged
    pub teardown_errors: Vec<TeardownError>,
    /// The fail-safe rules could not be installed
    pub failsafe_error: Option<ApplyError>,
}

impl StopReport {
    /// Nothing went wrong
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.teardown_errors.is_empty() && self.failsafe_error.is_none()
    }
}

/// Snapshot reported by `status`
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    /// Derived state
    pub state: LifecycleState,
    /// Probed facts
    pub facts: RuntimeFacts,
    /// Resolver liveness
    pub resolver_running: bool,
    /// Resolver pid from the record
    pub resolver_pid: Option<u32>,
    /// Proxy liveness, `None` without configured process names
    pub proxy_running: Option<bool>,
}

/// The engine, bound to one configuration and one host
pub struct Lifecycle<'a> {
    config: &'a Config,
    policy: Policy,
    kernel: &'a dyn Kernel,
    processes: &'a dyn ProcessControl,
    resolver: Box<dyn ResolverController + 'a>,
    hooks: Box<dyn LifecycleHooks + 'a>,
    host_resolver: Box<dyn HostResolver + 'a>,
    backoff: Backoff,
    command_lookup: Box<dyn Fn(&str) -> bool + 'a>,
}

impl<'a> Lifecycle<'a> {
    /// Bind a configuration to a kernel and a process controller.
    ///
    /// # Errors
    ///
    /// Returns `TpgateError::Config` if the policy does not resolve.
    pub fn new(config: &'a Config, kernel: &'a dyn Kernel, processes: &'a dyn ProcessControl) -> Result<Self> {
        let policy = Policy::resolve(config)?;
        let hooks: Box<dyn LifecycleHooks + 'a> = if config.hooks.is_empty() {
            Box::new(NoHooks)
        } else {
            Box::new(CommandHooks::new(config.hooks.clone(), processes))
        };
        Ok(Self {
            config,
            policy,
            kernel,
            processes,
            resolver: resolver::from_config(config),
            hooks,
            host_resolver: Box::new(SystemResolver),
            backoff: Backoff::default(),
            command_lookup: Box::new(|cmd| find_in_path(cmd).is_some()),
        })
    }

    /// Replace the hooks
    #[must_use]
    pub fn with_hooks(mut self, hooks: impl LifecycleHooks + 'a) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// Replace the resolver controller
    #[must_use]
    pub fn with_resolver(mut self, resolver: impl ResolverController + 'a) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Replace host name resolution for upstream endpoints
    #[must_use]
    pub fn with_host_resolver(mut self, resolver: impl HostResolver + 'a) -> Self {
        self.host_resolver = Box::new(resolver);
        self
    }

    /// Replace the retry / termination schedule
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the `PATH` lookup used by the environment check
    #[must_use]
    pub fn with_command_lookup(mut self, lookup: impl Fn(&str) -> bool + 'a) -> Self {
        self.command_lookup = Box::new(lookup);
        self
    }

    /// Resolved policy
    #[must_use]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    fn fwmark(&self) -> FwMark {
        FwMark::from_policy(&self.policy)
    }

    fn routing(&self) -> PolicyRouting<'_, dyn Kernel + 'a> {
        PolicyRouting::new(self.kernel, self.fwmark())
    }

    fn applier(&self) -> RuleApplier<'_, dyn Kernel + 'a> {
        RuleApplier::new(self.kernel)
    }

    fn proxy(&self) -> ProxyController<'_> {
        ProxyController::new(&self.config.proxy, self.processes)
    }

    fn resolver_context(&self, domain_files: DomainFiles) -> ResolverContext<'_> {
        ResolverContext {
            policy: &self.policy,
            config: self.config,
            processes: self.processes,
            backoff: &self.backoff,
            domain_files,
        }
    }

    /// Probe the live kernel
    #[must_use]
    pub fn facts(&self) -> RuntimeFacts {
        RuntimeFacts::probe(self.kernel, self.fwmark())
    }

    /// Read the record, but only when the kernel says we are started
    fn current_record(&self, facts: &RuntimeFacts) -> Option<AdvisoryRecord> {
        if !facts.is_started() {
            return None;
        }
        AdvisoryRecord::load(&self.config.runtime.record_path).unwrap_or_else(|e| {
            warn!("Ignoring unreadable record: {}", e);
            None
        })
    }

    fn save_record(&self, record: &AdvisoryRecord) {
        let path = &self.config.runtime.record_path;
        match record.save(path) {
            Ok(()) => debug!("Record written to {}", path.display()),
            Err(e) => warn!("Failed to write record {}: {}", path.display(), e),
        }
    }

    /// Commands the host must provide
    #[must_use]
    pub fn required_commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self
            .policy
            .families
            .iter()
            .map(|family| family.iptables().to_string())
            .collect();
        commands.extend(["ipset", "ip", "sysctl"].map(String::from));
        if let DnsBackend::Chinadns { binary } = &self.config.dns.backend {
            commands.push(binary.clone());
        }
        commands
    }

    /// Verify commands and process groups without touching anything.
    ///
    /// # Errors
    ///
    /// Returns `EnvironmentError` for the first missing command or group.
    pub fn check_environment(&self) -> std::result::Result<(), EnvironmentError> {
        for command in self.required_commands() {
            if !(self.command_lookup)(&command) {
                return Err(EnvironmentError::MissingCommand { command });
            }
        }
        let mut gids = Vec::with_capacity(2);
        for group in [&self.policy.proxy_group, &self.policy.dns_group] {
            let reason = match self.processes.group_id(group) {
                None => "no such group".to_string(),
                Some(0) => "resolves to gid 0".to_string(),
                Some(gid) if gids.contains(&gid) => format!("shares gid {gid} with proxy.group"),
                Some(gid) => {
                    gids.push(gid);
                    continue;
                }
            };
            return Err(EnvironmentError::Group {
                name: group.clone(),
                reason,
            });
        }
        Ok(())
    }

    /// Remove every engine artifact that could be left by an earlier run
    fn flush_residual(&self) -> Vec<TeardownError> {
        let applier = self.applier();
        let mut errors = applier.teardown(&FAILSAFE_CHAINS);
        errors.extend(applier.teardown(&ENGINE_CHAINS));
        errors.extend(self.routing().teardown());
        errors
    }

    /// Start the engine, stopping it first if it is running.
    ///
    /// # Errors
    ///
    /// Config and environment errors are returned before the kernel is
    /// touched. Apply errors abort the start and leave partial state for
    /// `stop` to clean up. Proxy and resolver failures are tolerated and
    /// listed in the report.
    pub fn start(&self) -> Result<StartReport> {
        let sources = load_sources(self.config, &self.policy, self.host_resolver.as_ref())?;
        self.check_environment()?;

        let mut report = StartReport::default();
        if self.facts().is_started() {
            info!("Engine already started, stopping first");
            self.stop();
            report.replaced_running = true;
        }

        let residue = self.flush_residual();
        if !residue.is_empty() {
            warn!("{} residual artifact(s) could not be removed", residue.len());
        }

        self.hooks.pre_start();

        for (key, value) in required_params(&self.policy) {
            self.kernel
                .set_param(key, value)
                .map_err(|e| ApplyError::new(format!("set {key}={value}"), e))?;
        }

        let memberships = build_memberships(self.policy.mode, &sources);
        AddressSetBuilder::new(self.kernel)
            .with_backoff(self.backoff.clone())
            .apply(&memberships)?;
        let domain_files = write_domain_files(&self.config.runtime.work_dir, &memberships)?;

        if let Err(e) = self.proxy().start() {
            warn!("Proxy failed to start: {}", e);
            report.process_errors.push(e);
        }

        let ctx = self.resolver_context(domain_files);
        report.resolver_pid = match self.resolver.start(&ctx) {
            Ok(pid) => pid,
            Err(e) => {
                warn!("Resolver {} failed to start: {}", self.resolver.name(), e);
                report.process_errors.push(e);
                None
            }
        };

        self.routing().install(&self.policy.families)?;

        let plan = compile(&self.policy);
        self.applier().apply(&plan)?;

        self.hooks.post_start();

        let mut record = AdvisoryRecord::default();
        self.resolver.contribute_record(report.resolver_pid, &mut record);
        record.fields.insert("mode".into(), self.policy.mode.to_string());
        record.fields.extend(self.hooks.record_fields());
        self.save_record(&record);

        self.applier().sweep_unreferenced(&ENGINE_CHAINS, &plan);

        info!(
            "Started: mode {}, families {}",
            self.policy.mode,
            self.policy
                .families
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("+")
        );
        Ok(report)
    }

    /// Stop the engine. Safe on a system that was never started.
    pub fn stop(&self) -> StopReport {
        self.hooks.pre_stop();

        let facts = self.facts();
        let record = self.current_record(&facts);
        if let Err(e) = AdvisoryRecord::remove(&self.config.runtime.record_path) {
            warn!("Failed to remove record: {}", e);
        }

        let mut report = StopReport {
            was_started: facts.is_started(),
            teardown_errors: self.flush_residual(),
            failsafe_error: None,
        };

        let ctx = self.resolver_context(DomainFiles::default());
        self.resolver.stop(&ctx, record.as_ref());
        self.proxy().stop(&self.backoff);

        report.teardown_errors.extend(
            AddressSetBuilder::new(self.kernel)
                .with_backoff(self.backoff.clone())
                .destroy_all(),
        );

        let failsafe = compile_failsafe(&self.policy);
        if !failsafe.is_empty() {
            match self.applier().apply(&failsafe) {
                Ok(()) => info!("Fail-safe rules installed"),
                Err(e) => {
                    warn!("Fail-safe rules not installed: {}", e);
                    report.failsafe_error = Some(e);
                }
            }
        }

        self.hooks.post_stop();
        if report.was_started {
            info!("Stopped");
        } else {
            debug!("Stop on a stopped system");
        }
        report
    }

    /// Stop, then start.
    ///
    /// # Errors
    ///
    /// Returns the error of the start.
    pub fn restart(&self) -> Result<StartReport> {
        self.stop();
        self.start()
    }

    /// Restart the proxy alone. `Ok(false)` when the engine is stopped.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError` if the proxy does not start again.
    pub fn restart_proxy(&self) -> Result<bool> {
        let facts = self.facts();
        if !facts.is_started() {
            info!("Engine not started, nothing to restart");
            return Ok(false);
        }
        let record = self.current_record(&facts).unwrap_or_default();

        let proxy = self.proxy();
        proxy.stop(&self.backoff);
        proxy.start()?;

        self.save_record(&record);
        Ok(true)
    }

    /// Restart the resolver alone. `Ok(false)` when the engine is stopped.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError` if the resolver does not start again.
    pub fn restart_dns(&self) -> Result<bool> {
        let facts = self.facts();
        if !facts.is_started() {
            info!("Engine not started, nothing to restart");
            return Ok(false);
        }
        let mut record = self.current_record(&facts).unwrap_or_default();

        let ctx = self.resolver_context(existing_domain_files(&self.config.runtime.work_dir));
        let pid = self.resolver.flush(&ctx, Some(&record))?;
        self.resolver.contribute_record(pid, &mut record);

        self.save_record(&record);
        info!("Resolver {} restarted", self.resolver.name());
        Ok(true)
    }

    /// Probe state and process liveness
    #[must_use]
    pub fn status(&self) -> Status {
        let facts = self.facts();
        let record = self.current_record(&facts);
        let ctx = self.resolver_context(DomainFiles::default());
        Status {
            state: facts.state(),
            facts,
            resolver_running: self.resolver.is_running(&ctx, record.as_ref()),
            resolver_pid: record.and_then(|r| r.resolver_pid),
            proxy_running: self.proxy().is_running(),
        }
    }

    /// Families whose fail-safe DNS rule will be installed on stop
    #[must_use]
    pub fn failsafe_families(&self) -> Vec<Family> {
        self.policy
            .families
            .iter()
            .copied()
            .filter(|&family| self.policy.failsafe_dns_for(family).is_some())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io;
    use std::net::IpAddr;
    use std::path::Path;

    use super::*;
    use crate::error::TpgateError;
    use crate::kernel::MemoryKernel;
    use crate::process::MemoryProcesses;

    struct Offline;

    impl HostResolver for Offline {
        fn resolve(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "offline"))
        }
    }

    fn config_in(dir: &Path) -> Config {
        fs::write(dir.join("chnroute.txt"), "1.0.1.0/24\n").unwrap();
        fs::write(dir.join("chnlist.txt"), "baidu.com\n").unwrap();
        let mut config = Config::default_config();
        config.lists.chnroute = dir.join("chnroute.txt");
        config.lists.chnlist = dir.join("chnlist.txt");
        config.runtime.record_path = dir.join("run/state");
        config.runtime.work_dir = dir.join("run");
        config
    }

    fn engine<'a>(config: &'a Config, kernel: &'a MemoryKernel, procs: &'a MemoryProcesses) -> Lifecycle<'a> {
        Lifecycle::new(config, kernel, procs)
            .unwrap()
            .with_host_resolver(Offline)
            .with_backoff(Backoff::immediate(2))
            .with_command_lookup(|_| true)
    }

    #[test]
    fn test_start_writes_record_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (kernel, procs) = (MemoryKernel::new(), MemoryProcesses::new());
        let engine = engine(&config, &kernel, &procs);

        let report = engine.start().unwrap();
        assert!(!report.replaced_running);
        let pid = report.resolver_pid.unwrap();

        let record = AdvisoryRecord::load(&config.runtime.record_path).unwrap().unwrap();
        assert_eq!(record.resolver_pid, Some(pid));
        assert_eq!(record.fields.get("mode").map(String::as_str), Some("chnroute"));

        let status = engine.status();
        assert_eq!(status.state, LifecycleState::Started);
        assert!(status.resolver_running);
        assert_eq!(kernel.param("net.ipv4.ip_forward").as_deref(), Some("1"));
    }

    #[test]
    fn test_missing_command_aborts_before_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (kernel, procs) = (MemoryKernel::new(), MemoryProcesses::new());
        let engine = engine(&config, &kernel, &procs).with_command_lookup(|cmd| cmd != "ipset");

        let err = engine.start().unwrap_err();
        assert!(matches!(err, TpgateError::Environment(EnvironmentError::MissingCommand { .. })));
        assert!(err.is_pre_mutation());
        assert_eq!(kernel.mutations(), 0);
    }

    #[test]
    fn test_missing_group_aborts_before_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (kernel, procs) = (MemoryKernel::new(), MemoryProcesses::new());
        procs.restrict_groups(&["proxy"]);
        let err = engine(&config, &kernel, &procs).start().unwrap_err();
        assert!(matches!(err, TpgateError::Environment(EnvironmentError::Group { .. })));
        assert_eq!(kernel.mutations(), 0);
    }

    #[test]
    fn test_groups_compared_by_gid() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.dns.group = "13".into();
        let (kernel, procs) = (MemoryKernel::new(), MemoryProcesses::new());
        procs.set_group_id("proxy", 13);
        procs.set_group_id("13", 13);

        let err = engine(&config, &kernel, &procs).check_environment().unwrap_err();
        assert!(matches!(err, EnvironmentError::Group { ref name, .. } if name == "13"));

        config.dns.group = "wheel".into();
        procs.set_group_id("wheel", 0);
        let err = engine(&config, &kernel, &procs).start().unwrap_err();
        assert!(matches!(err, TpgateError::Environment(EnvironmentError::Group { .. })));
        assert_eq!(kernel.mutations(), 0);
    }

    #[test]
    fn test_resolver_failure_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (kernel, procs) = (MemoryKernel::new(), MemoryProcesses::new());
        procs.fail_spawns(true);
        let report = engine(&config, &kernel, &procs).start().unwrap();
        assert_eq!(report.resolver_pid, None);
        assert_eq!(report.process_errors.len(), 1);
        assert!(engine(&config, &kernel, &procs).facts().is_started());
    }

    #[test]
    fn test_apply_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (kernel, procs) = (MemoryKernel::new(), MemoryProcesses::new());
        kernel.fail_appends_to(crate::compiler::CHAIN_DECIDE);
        let err = engine(&config, &kernel, &procs).start().unwrap_err();
        assert!(matches!(err, TpgateError::Apply(_)));
        assert!(!config.runtime.record_path.exists());

        kernel.fail_appends_to("none");
        let report = engine(&config, &kernel, &procs).stop();
        assert!(report.was_started);
        assert!(!engine(&config, &kernel, &procs).facts().is_started());
    }

    #[test]
    fn test_stale_record_is_ignored_after_reboot() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (kernel, procs) = (MemoryKernel::new(), MemoryProcesses::new());
        let unrelated = procs.add_process("sshd", None);
        AdvisoryRecord {
            resolver_pid: Some(unrelated),
            ..Default::default()
        }
        .save(&config.runtime.record_path)
        .unwrap();

        let engine = engine(&config, &kernel, &procs);
        assert_eq!(engine.status().state, LifecycleState::Stopped);
        assert_eq!(engine.status().resolver_pid, None);

        let report = engine.stop();
        assert!(!report.was_started);
        assert!(procs.is_alive(unrelated));
        assert!(!config.runtime.record_path.exists());
    }

    #[test]
    fn test_restart_dns_replaces_pid() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (kernel, procs) = (MemoryKernel::new(), MemoryProcesses::new());
        let engine = engine(&config, &kernel, &procs);

        assert!(!engine.restart_dns().unwrap());
        let first = engine.start().unwrap().resolver_pid.unwrap();
        assert!(engine.restart_dns().unwrap());

        let record = AdvisoryRecord::load(&config.runtime.record_path).unwrap().unwrap();
        let second = record.resolver_pid.unwrap();
        assert_ne!(first, second);
        assert!(!procs.is_alive(first));
        assert!(procs.is_alive(second));
    }

    #[test]
    fn test_restart_proxy_requires_started() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.proxy.start_cmd = "ss-redir -c /etc/ss.json".into();
        let (kernel, procs) = (MemoryKernel::new(), MemoryProcesses::new());
        let engine = engine(&config, &kernel, &procs);

        assert!(!engine.restart_proxy().unwrap());
        assert!(procs.shell_commands().is_empty());

        engine.start().unwrap();
        assert!(engine.restart_proxy().unwrap());
        assert_eq!(procs.shell_commands().len(), 2);
        assert!(config.runtime.record_path.exists());
    }

    #[derive(Default)]
    struct Recording(parking_lot::Mutex<Vec<&'static str>>);

    impl LifecycleHooks for &Recording {
        fn pre_start(&self) {
            self.0.lock().push("pre_start");
        }
        fn post_start(&self) {
            self.0.lock().push("post_start");
        }
        fn pre_stop(&self) {
            self.0.lock().push("pre_stop");
        }
        fn post_stop(&self) {
            self.0.lock().push("post_stop");
        }
        fn record_fields(&self) -> std::collections::BTreeMap<String, String> {
            [("hook".to_string(), "yes".to_string())].into()
        }
    }

    #[test]
    fn test_hook_order_and_record_fields() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (kernel, procs) = (MemoryKernel::new(), MemoryProcesses::new());
        let hooks = Recording::default();
        let engine = engine(&config, &kernel, &procs).with_hooks(&hooks);

        engine.start().unwrap();
        let record = AdvisoryRecord::load(&config.runtime.record_path).unwrap().unwrap();
        assert_eq!(record.fields.get("hook").map(String::as_str), Some("yes"));

        engine.restart().unwrap();
        assert_eq!(
            *hooks.0.lock(),
            vec!["pre_start", "post_start", "pre_stop", "post_stop", "pre_start", "post_start"]
        );
    }
}

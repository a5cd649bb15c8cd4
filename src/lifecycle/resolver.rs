//! DNS resolver control
//!
//! The resolver is an external process. Two backends exist: a
//! chinadns-ng compatible binary spawned with a constructed argument list,
//! and operator-supplied start/stop commands. Both run under the dns group
//! so the owner match in the rules can tell resolver queries apart from
//! client queries.

use tracing::{debug, info, warn};

use super::record::AdvisoryRecord;
use crate::backoff::Backoff;
use crate::config::{Config, DnsBackend};
use crate::error::ProcessError;
use crate::policy::{Family, Mode, Policy};
use crate::process::{terminate, ProcessControl, SpawnSpec};
use crate::sets::{set_name, DomainFiles, SetKind};

/// What a resolver controller needs from the engine
pub struct ResolverContext<'a> {
    /// Resolved policy
    pub policy: &'a Policy,
    /// Full configuration (upstreams, list paths)
    pub config: &'a Config,
    /// Process primitives
    pub processes: &'a dyn ProcessControl,
    /// Termination schedule
    pub backoff: &'a Backoff,
    /// Generated domain lists
    pub domain_files: DomainFiles,
}

/// Start, stop and observe the resolver process
pub trait ResolverController {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Start the resolver, returning its pid when known.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError` if the process cannot be launched.
    fn start(&self, ctx: &ResolverContext<'_>) -> Result<Option<u32>, ProcessError>;

    /// Stop the resolver and any orphan of a previous run
    fn stop(&self, ctx: &ResolverContext<'_>, record: Option<&AdvisoryRecord>);

    /// Stop then start, dropping whatever the resolver cached.
    ///
    /// # Errors
    ///
    /// Returns the error of the start.
    fn flush(&self, ctx: &ResolverContext<'_>, record: Option<&AdvisoryRecord>) -> Result<Option<u32>, ProcessError> {
        self.stop(ctx, record);
        self.start(ctx)
    }

    /// Whether a resolver process is running
    fn is_running(&self, ctx: &ResolverContext<'_>, record: Option<&AdvisoryRecord>) -> bool;

    /// Persist what the next invocation needs to find the process
    fn contribute_record(&self, pid: Option<u32>, record: &mut AdvisoryRecord) {
        record.resolver_pid = pid;
    }
}

/// Controller for the configured backend
#[must_use]
pub fn from_config(config: &Config) -> Box<dyn ResolverController> {
    match &config.dns.backend {
        DnsBackend::Chinadns { binary } => Box::new(ChinaDns::new(binary.clone())),
        DnsBackend::Command {
            start_cmd,
            stop_cmd,
            process_names,
        } => Box::new(CommandResolver {
            start_cmd: start_cmd.clone(),
            stop_cmd: stop_cmd.clone(),
            process_names: process_names.clone(),
        }),
    }
}

fn tcp_upstream(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("tcp://{endpoint}")
    }
}

fn join_sets(kind: SetKind) -> String {
    format!("{},{}", set_name(kind, Family::V4), set_name(kind, Family::V6))
}

/// Command line of a chinadns-ng compatible resolver
#[must_use]
pub fn chinadns_args(policy: &Policy, config: &Config, files: &DomainFiles) -> Vec<String> {
    let dns = &config.dns;
    let v4 = policy.has_family(Family::V4);
    let v6 = policy.has_family(Family::V6);

    let pick = |four: &[String], six: &[String]| -> Vec<String> {
        let mut out = Vec::new();
        if v4 {
            out.extend(four.iter().cloned());
        }
        if v6 {
            out.extend(six.iter().cloned());
        }
        out
    };
    let direct = pick(&dns.direct, &dns.direct6);
    let mut remote = pick(&dns.remote, &dns.remote6);
    if dns.remote_tcp {
        remote = remote.iter().map(|e| tcp_upstream(e)).collect();
    }

    let mut args = vec![
        "--bind-addr".to_string(),
        policy.dns_bind.to_string(),
        "--bind-port".to_string(),
        dns.port.to_string(),
        "--china-dns".to_string(),
        direct.join(","),
        "--trust-dns".to_string(),
        remote.join(","),
    ];
    if dns.cache_size > 0 {
        args.extend(["--cache".to_string(), dns.cache_size.to_string()]);
    }

    let mut chnlist: Vec<String> = Vec::new();
    let mut gfwlist: Vec<String> = Vec::new();
    match policy.mode {
        Mode::Gfwlist => gfwlist.push(config.lists.gfwlist.display().to_string()),
        Mode::Chnroute => chnlist.push(config.lists.chnlist.display().to_string()),
        Mode::Global => {}
    }
    if let Some(allow) = &files.allow {
        chnlist.push(allow.display().to_string());
    }
    if let Some(deny) = &files.deny {
        gfwlist.push(deny.display().to_string());
    }
    if !chnlist.is_empty() {
        args.extend(["--chnlist-file".to_string(), chnlist.join(",")]);
        args.extend(["--add-tagchn-ip".to_string(), join_sets(SetKind::Allow)]);
    }
    if !gfwlist.is_empty() {
        args.extend(["--gfwlist-file".to_string(), gfwlist.join(",")]);
        args.extend(["--add-taggfw-ip".to_string(), join_sets(SetKind::Deny)]);
    }

    let default_tag = match policy.mode {
        Mode::Global => "gfw",
        Mode::Gfwlist => "chn",
        Mode::Chnroute => "none",
    };
    args.extend(["--default-tag".to_string(), default_tag.to_string()]);
    if policy.mode == Mode::Chnroute {
        args.extend([
            "--ipset-name4".to_string(),
            set_name(SetKind::Allow, Family::V4).to_string(),
            "--ipset-name6".to_string(),
            set_name(SetKind::Allow, Family::V6).to_string(),
        ]);
    }
    if !v6 {
        args.push("--no-ipv6".to_string());
    }
    args
}

/// Spawned chinadns-ng compatible binary
#[derive(Debug, Clone)]
pub struct ChinaDns {
    binary: String,
}

impl ChinaDns {
    /// Controller for `binary`
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    fn candidates(&self, ctx: &ResolverContext<'_>, record: Option<&AdvisoryRecord>) -> Vec<u32> {
        let mut pids: Vec<u32> = record.and_then(|r| r.resolver_pid).into_iter().collect();
        pids.extend(ctx.processes.pids_by_name(&self.binary));
        pids.sort_unstable();
        pids.dedup();
        pids
    }
}

impl ResolverController for ChinaDns {
    fn name(&self) -> &str {
        &self.binary
    }

    fn start(&self, ctx: &ResolverContext<'_>) -> Result<Option<u32>, ProcessError> {
        let spec = SpawnSpec {
            program: self.binary.clone(),
            args: chinadns_args(ctx.policy, ctx.config, &ctx.domain_files),
            group: Some(ctx.policy.dns_group.clone()),
            log_file: ctx.config.dns.log_file.clone(),
        };
        debug!("{} {}", spec.program, spec.args.join(" "));
        ctx.processes.spawn(&spec).map(Some)
    }

    fn stop(&self, ctx: &ResolverContext<'_>, record: Option<&AdvisoryRecord>) {
        let pids = self.candidates(ctx, record);
        let outcome = terminate(ctx.processes, &pids, ctx.backoff);
        if outcome.signalled > 0 {
            info!("Stopped {} ({} process(es))", self.binary, outcome.signalled);
        }
    }

    fn is_running(&self, ctx: &ResolverContext<'_>, record: Option<&AdvisoryRecord>) -> bool {
        self.candidates(ctx, record)
            .into_iter()
            .any(|pid| ctx.processes.is_alive(pid))
    }
}

/// Resolver managed through operator commands
#[derive(Debug, Clone)]
pub struct CommandResolver {
    start_cmd: String,
    stop_cmd: Option<String>,
    process_names: Vec<String>,
}

impl CommandResolver {
    fn named_pids(&self, processes: &dyn ProcessControl) -> Vec<u32> {
        self.process_names
            .iter()
            .flat_map(|name| processes.pids_by_name(name))
            .collect()
    }
}

impl ResolverController for CommandResolver {
    fn name(&self) -> &str {
        "command"
    }

    fn start(&self, ctx: &ResolverContext<'_>) -> Result<Option<u32>, ProcessError> {
        ctx.processes
            .run_shell(&self.start_cmd, Some(&ctx.policy.dns_group))?;
        Ok(self.named_pids(ctx.processes).first().copied())
    }

    fn stop(&self, ctx: &ResolverContext<'_>, record: Option<&AdvisoryRecord>) {
        if let Some(cmd) = &self.stop_cmd {
            if let Err(e) = ctx.processes.run_shell(cmd, Some(&ctx.policy.dns_group)) {
                warn!("Resolver stop command failed: {}", e);
            }
        }
        let mut pids = self.named_pids(ctx.processes);
        pids.extend(record.and_then(|r| r.resolver_pid));
        terminate(ctx.processes, &pids, ctx.backoff);
    }

    fn is_running(&self, ctx: &ResolverContext<'_>, record: Option<&AdvisoryRecord>) -> bool {
        record
            .and_then(|r| r.resolver_pid)
            .map_or(false, |pid| ctx.processes.is_alive(pid))
            || !self.named_pids(ctx.processes).is_empty()
    }
}

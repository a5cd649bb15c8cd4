//! Address-set builder
//!
//! Turns list files and upstream endpoints into the contents of the four
//! `hash:net` sets the rules and the resolver reference:
//!
//! | Set        | Meaning                              |
//! |------------|--------------------------------------|
//! | `allow-v4` | IPv4 destinations that go direct     |
//! | `allow-v6` | IPv6 destinations that go direct     |
//! | `deny-v4`  | IPv4 destinations that are proxied   |
//! | `deny-v6`  | IPv6 destinations that are proxied   |
//!
//! All four exist after every start, whatever the mode, because the resolver
//! references them unconditionally.

mod builder;
mod list;
mod upstream;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{Config, DnsBackend};
use crate::error::ConfigError;
use crate::policy::{Family, Mode, Policy};

pub use builder::{
    build_memberships, AddressSetBuilder, MembershipSources, Memberships, RESERVED_V4, RESERVED_V6,
};
pub use list::{parse_list_file, parse_route_list, read_list, ListEntries};
pub use upstream::{resolve_all, resolve_upstream, upstream_host, HostResolver, SystemResolver};

/// Which of the two sets of a family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetKind {
    /// Destinations that go direct
    Allow,
    /// Destinations that are proxied
    Deny,
}

/// Every engine set
pub const ALL_SETS: [(SetKind, Family); 4] = [
    (SetKind::Allow, Family::V4),
    (SetKind::Allow, Family::V6),
    (SetKind::Deny, Family::V4),
    (SetKind::Deny, Family::V6),
];

/// Kernel name of a set
#[must_use]
pub const fn set_name(kind: SetKind, family: Family) -> &'static str {
    match (kind, family) {
        (SetKind::Allow, Family::V4) => "allow-v4",
        (SetKind::Allow, Family::V6) => "allow-v6",
        (SetKind::Deny, Family::V4) => "deny-v4",
        (SetKind::Deny, Family::V6) => "deny-v6",
    }
}

fn parse_optional_ext(path: Option<&PathBuf>) -> Result<ListEntries, ConfigError> {
    match path {
        Some(path) => parse_list_file(&path.display().to_string(), &read_list(path, true)?),
        None => Ok(ListEntries::default()),
    }
}

fn require_file(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        Ok(())
    } else {
        Err(ConfigError::MissingListFile {
            path: path.display().to_string(),
        })
    }
}

/// Read every list the policy needs and resolve upstream endpoints.
///
/// Nothing on the host is modified, so any error here aborts a start before
/// the kernel is touched.
///
/// # Errors
///
/// Returns `ConfigError` for missing required files and malformed entries.
pub fn load_sources(
    config: &Config,
    policy: &Policy,
    resolver: &dyn HostResolver,
) -> Result<MembershipSources, ConfigError> {
    let lists = &config.lists;
    let mut sources = MembershipSources {
        allow_ext: parse_optional_ext(lists.allow_ext.as_ref())?,
        deny_ext: parse_optional_ext(lists.deny_ext.as_ref())?,
        ..Default::default()
    };

    if policy.mode == Mode::Chnroute {
        if policy.has_family(Family::V4) {
            let path = &lists.chnroute;
            sources.national_v4 =
                parse_route_list(&path.display().to_string(), &read_list(path, true)?, Family::V4)?;
        }
        if policy.has_family(Family::V6) {
            let path = &lists.chnroute6;
            sources.national_v6 =
                parse_route_list(&path.display().to_string(), &read_list(path, true)?, Family::V6)?;
        }
    }

    if matches!(config.dns.backend, DnsBackend::Chinadns { .. }) {
        match policy.mode {
            Mode::Gfwlist => require_file(&lists.gfwlist)?,
            Mode::Chnroute => require_file(&lists.chnlist)?,
            Mode::Global => {}
        }
    }

    let dns = &config.dns;
    if dns.direct_in_allow {
        let endpoints: Vec<String> = dns.direct.iter().chain(&dns.direct6).cloned().collect();
        sources.direct_upstreams = resolve_all(&endpoints, resolver);
    }
    if dns.remote_in_deny {
        let endpoints: Vec<String> = dns.remote.iter().chain(&dns.remote6).cloned().collect();
        sources.remote_upstreams = resolve_all(&endpoints, resolver);
    }
    sources.proxy_servers = resolve_all(&config.proxy.servers, resolver);

    debug!(
        "List sources: {} national v4, {} national v6, {} direct, {} remote, {} servers",
        sources.national_v4.len(),
        sources.national_v6.len(),
        sources.direct_upstreams.len(),
        sources.remote_upstreams.len(),
        sources.proxy_servers.len()
    );
    Ok(sources)
}

/// Generated domain list files handed to the resolver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainFiles {
    /// Domains from the allow extension list
    pub allow: Option<PathBuf>,
    /// Domains from the deny extension list
    pub deny: Option<PathBuf>,
}

/// Write `@` entries of the extension lists under `work_dir`.
///
/// # Errors
///
/// Returns the I/O error of directory creation or file writing.
pub fn write_domain_files(work_dir: &Path, memberships: &Memberships) -> io::Result<DomainFiles> {
    let mut files = DomainFiles::default();
    if memberships.allow_domains.is_empty() && memberships.deny_domains.is_empty() {
        return Ok(files);
    }
    fs::create_dir_all(work_dir)?;

    if !memberships.allow_domains.is_empty() {
        let path = work_dir.join("allow.domains");
        fs::write(&path, memberships.allow_domains.join("\n") + "\n")?;
        files.allow = Some(path);
    }
    if !memberships.deny_domains.is_empty() {
        let path = work_dir.join("deny.domains");
        fs::write(&path, memberships.deny_domains.join("\n") + "\n")?;
        files.deny = Some(path);
    }
    Ok(files)
}

/// Domain files left by a previous [`write_domain_files`] call
#[must_use]
pub fn existing_domain_files(work_dir: &Path) -> DomainFiles {
    let existing = |name: &str| Some(work_dir.join(name)).filter(|p| p.is_file());
    DomainFiles {
        allow: existing("allow.domains"),
        deny: existing("deny.domains"),
    }
}

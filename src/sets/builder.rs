//! Membership building and set population

use std::collections::BTreeSet;
use std::net::IpAddr;

use ipnet::IpNet;
use tracing::{debug, info, warn};

use super::list::ListEntries;
use super::{set_name, SetKind, ALL_SETS};
use crate::backoff::Backoff;
use crate::error::{ApplyError, TeardownError};
use crate::kernel::AddressSets;
use crate::policy::{Family, Mode};

/// Special-purpose IPv4 ranges, never proxied
pub const RESERVED_V4: [&str; 12] = [
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
];

/// Special-purpose IPv6 ranges, never proxied
pub const RESERVED_V6: [&str; 8] = [
    "::/128",
    "::1/128",
    "::ffff:0:0/96",
    "64:ff9b::/96",
    "100::/64",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

/// Inputs of a membership build, already read and resolved
#[derive(Debug, Clone, Default)]
pub struct MembershipSources {
    /// Operator allow extensions
    pub allow_ext: ListEntries,
    /// Operator deny extensions
    pub deny_ext: ListEntries,
    /// National IPv4 routes (chnroute mode)
    pub national_v4: Vec<IpNet>,
    /// National IPv6 routes (chnroute mode)
    pub national_v6: Vec<IpNet>,
    /// Direct DNS upstream addresses to keep off the proxy
    pub direct_upstreams: Vec<IpAddr>,
    /// Remote DNS upstream addresses to force through the proxy
    pub remote_upstreams: Vec<IpAddr>,
    /// Proxy server addresses (must never loop back into the proxy)
    pub proxy_servers: Vec<IpAddr>,
}

/// Final contents of the four sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memberships {
    allow_v4: BTreeSet<IpNet>,
    allow_v6: BTreeSet<IpNet>,
    deny_v4: BTreeSet<IpNet>,
    deny_v6: BTreeSet<IpNet>,
    /// Domains resolved directly
    pub allow_domains: Vec<String>,
    /// Domains resolved through the remote upstreams
    pub deny_domains: Vec<String>,
}

impl Memberships {
    /// Members of one set, sorted
    #[must_use]
    pub fn members(&self, kind: SetKind, family: Family) -> Vec<IpNet> {
        self.set(kind, family).iter().copied().collect()
    }

    /// Whether a set contains an address (longest-prefix agnostic)
    #[must_use]
    pub fn contains(&self, kind: SetKind, addr: IpAddr) -> bool {
        self.set(kind, Family::of(&addr)).iter().any(|net| net.contains(&addr))
    }

    fn set(&self, kind: SetKind, family: Family) -> &BTreeSet<IpNet> {
        match (kind, family) {
            (SetKind::Allow, Family::V4) => &self.allow_v4,
            (SetKind::Allow, Family::V6) => &self.allow_v6,
            (SetKind::Deny, Family::V4) => &self.deny_v4,
            (SetKind::Deny, Family::V6) => &self.deny_v6,
        }
    }

    fn set_mut(&mut self, kind: SetKind, family: Family) -> &mut BTreeSet<IpNet> {
        match (kind, family) {
            (SetKind::Allow, Family::V4) => &mut self.allow_v4,
            (SetKind::Allow, Family::V6) => &mut self.allow_v6,
            (SetKind::Deny, Family::V4) => &mut self.deny_v4,
            (SetKind::Deny, Family::V6) => &mut self.deny_v6,
        }
    }

    fn add(&mut self, kind: SetKind, net: IpNet) {
        let family = Family::of(&net.addr());
        self.set_mut(kind, family).insert(net.trunc());
    }

    fn add_addr(&mut self, kind: SetKind, addr: IpAddr) {
        self.add(kind, IpNet::from(addr));
    }
}

/// Compute set contents for a mode. Pure.
#[must_use]
pub fn build_memberships(mode: Mode, sources: &MembershipSources) -> Memberships {
    let mut m = Memberships::default();

    for net in RESERVED_V4.iter().chain(RESERVED_V6.iter()) {
        if let Ok(net) = net.parse::<IpNet>() {
            m.add(SetKind::Allow, net);
        }
    }

    for family in Family::ALL {
        for net in sources.allow_ext.prefixes(family) {
            m.add(SetKind::Allow, net);
        }
        for net in sources.deny_ext.prefixes(family) {
            m.add(SetKind::Deny, net);
        }
    }

    if mode == Mode::Chnroute {
        for net in sources.national_v4.iter().chain(&sources.national_v6) {
            m.add(SetKind::Allow, *net);
        }
    }

    for addr in sources.direct_upstreams.iter().chain(&sources.proxy_servers) {
        m.add_addr(SetKind::Allow, *addr);
    }
    for addr in &sources.remote_upstreams {
        m.add_addr(SetKind::Deny, *addr);
    }

    m.allow_domains = dedup(&sources.allow_ext.domains);
    m.deny_domains = dedup(&sources.deny_ext.domains);
    m
}

fn dedup(domains: &[String]) -> Vec<String> {
    domains
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Populates and destroys the four address sets
pub struct AddressSetBuilder<'a, S: AddressSets + ?Sized> {
    sets: &'a S,
    backoff: Backoff,
}

impl<'a, S: AddressSets + ?Sized> AddressSetBuilder<'a, S> {
    /// Builder using the default retry schedule
    pub fn new(sets: &'a S) -> Self {
        Self {
            sets,
            backoff: Backoff::default(),
        }
    }

    /// Override the retry schedule used by [`Self::destroy_all`]
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Repopulate every set from `memberships`.
    ///
    /// Each set is filled through a temporary twin and swapped into place,
    /// so rules referencing it see either the old or the new contents.
    ///
    /// # Errors
    ///
    /// Returns `ApplyError` on the first failing set operation.
    pub fn apply(&self, memberships: &Memberships) -> Result<(), ApplyError> {
        for (kind, family) in ALL_SETS {
            let name = set_name(kind, family);
            let members = memberships.members(kind, family);
            self.replace(name, family, &members)?;
            info!("Populated {} with {} prefixes", name, members.len());
        }
        Ok(())
    }

    fn replace(&self, name: &str, family: Family, members: &[IpNet]) -> Result<(), ApplyError> {
        let tmp = format!("{name}-tmp");

        self.sets
            .create_set(name, family)
            .map_err(|e| ApplyError::new(format!("create set {name}"), e))?;

        match self.sets.destroy_set(&tmp) {
            Ok(()) => debug!("Removed stale {}", tmp),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(ApplyError::new(format!("remove stale set {tmp}"), e)),
        }

        self.sets
            .create_set(&tmp, family)
            .map_err(|e| ApplyError::new(format!("create set {tmp}"), e))?;
        self.sets
            .restore_set(&tmp, members)
            .map_err(|e| ApplyError::new(format!("populate set {tmp}"), e))?;
        self.sets
            .swap_sets(&tmp, name)
            .map_err(|e| ApplyError::new(format!("swap {tmp} into {name}"), e))?;
        self.sets
            .destroy_set(&tmp)
            .map_err(|e| ApplyError::new(format!("destroy set {tmp}"), e))
    }

    /// Destroy every engine set, retrying while busy.
    ///
    /// Gives up on a set once the backoff schedule is exhausted; the
    /// failures are returned for logging and never abort teardown.
    pub fn destroy_all(&self) -> Vec<TeardownError> {
        let mut errors = Vec::new();
        for (kind, family) in ALL_SETS {
            let name = set_name(kind, family);
            for target in [format!("{name}-tmp"), name.to_string()] {
                let result = self.backoff.retry(|| self.sets.destroy_set(&target), |e| e.is_busy());
                match result {
                    Ok(()) => debug!("Destroyed set {}", target),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!("Giving up on set {}: {}", target, e);
                        errors.push(TeardownError::new(format!("destroy set {target}"), e));
                    }
                }
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MemoryKernel;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn sources() -> MembershipSources {
        MembershipSources {
            allow_ext: ListEntries {
                v4: vec!["114.114.114.0/24".parse().unwrap()],
                domains: vec!["b.cn".into(), "a.cn".into(), "a.cn".into()],
                ..Default::default()
            },
            deny_ext: ListEntries {
                v6: vec!["2001:db8:1::/48".parse().unwrap()],
                ..Default::default()
            },
            national_v4: vec![net("1.0.1.0/24")],
            national_v6: vec![net("240e::/20")],
            direct_upstreams: vec!["223.5.5.5".parse().unwrap()],
            remote_upstreams: vec!["8.8.8.8".parse().unwrap()],
            proxy_servers: vec!["203.0.113.7".parse().unwrap()],
        }
    }

    #[test]
    fn test_reserved_always_allowed() {
        let m = build_memberships(Mode::Global, &MembershipSources::default());
        assert!(m.contains(SetKind::Allow, "192.168.1.10".parse().unwrap()));
        assert!(m.contains(SetKind::Allow, "fe80::1".parse().unwrap()));
        assert!(m.members(SetKind::Deny, Family::V4).is_empty());
    }

    #[test]
    fn test_national_routes_only_in_chnroute() {
        let chn = build_memberships(Mode::Chnroute, &sources());
        assert!(chn.contains(SetKind::Allow, "1.0.1.5".parse().unwrap()));
        assert!(chn.contains(SetKind::Allow, "240e::1".parse().unwrap()));

        let gfw = build_memberships(Mode::Gfwlist, &sources());
        assert!(!gfw.contains(SetKind::Allow, "1.0.1.5".parse().unwrap()));
    }

    #[test]
    fn test_upstreams_and_servers() {
        let m = build_memberships(Mode::Gfwlist, &sources());
        assert!(m.contains(SetKind::Allow, "223.5.5.5".parse().unwrap()));
        assert!(m.contains(SetKind::Allow, "203.0.113.7".parse().unwrap()));
        assert!(m.contains(SetKind::Deny, "8.8.8.8".parse().unwrap()));
        assert!(m.contains(SetKind::Deny, "2001:db8:1::5".parse().unwrap()));
        assert_eq!(m.allow_domains, vec!["a.cn".to_string(), "b.cn".to_string()]);
    }

    #[test]
    fn test_apply_replaces_contents() {
        let kernel = MemoryKernel::new();
        let builder = AddressSetBuilder::new(&kernel);

        let first = build_memberships(Mode::Gfwlist, &sources());
        builder.apply(&first).unwrap();
        assert!(kernel.list_members("deny-v4").unwrap().contains(&net("8.8.8.8/32")));

        let second = build_memberships(Mode::Gfwlist, &MembershipSources::default());
        builder.apply(&second).unwrap();
        assert!(kernel.list_members("deny-v4").unwrap().is_empty());

        let mut names = kernel.set_names();
        names.sort();
        assert_eq!(names, vec!["allow-v4", "allow-v6", "deny-v4", "deny-v6"]);
    }

    #[test]
    fn test_destroy_all_retries_busy() {
        let kernel = MemoryKernel::new();
        let builder = AddressSetBuilder::new(&kernel).with_backoff(Backoff::immediate(3));
        builder.apply(&Memberships::default()).unwrap();

        kernel.inject_busy_set("allow-v4", 2);
        assert!(builder.destroy_all().is_empty());
        assert!(kernel.set_names().is_empty());
    }

    #[test]
    fn test_destroy_all_gives_up() {
        let kernel = MemoryKernel::new();
        let builder = AddressSetBuilder::new(&kernel).with_backoff(Backoff::immediate(1));
        builder.apply(&Memberships::default()).unwrap();

        kernel.inject_busy_set("deny-v6", 10);
        let errors = builder.destroy_all();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].step.contains("deny-v6"));
        assert_eq!(kernel.set_names(), vec!["deny-v6".to_string()]);
    }

    #[test]
    fn test_destroy_all_on_empty_kernel() {
        let kernel = MemoryKernel::new();
        assert!(AddressSetBuilder::new(&kernel).destroy_all().is_empty());
    }
}

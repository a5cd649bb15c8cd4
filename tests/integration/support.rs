//! Shared fixtures and a netfilter walker over the in-memory kernel

use std::fs;
use std::io;
use std::net::IpAddr;

use tempfile::TempDir;

use tpgate::backoff::Backoff;
use tpgate::compiler::{CtDir, CtState, Hook, Match, Proto, Rule, Table, Target};
use tpgate::config::{Config, PortSpec};
use tpgate::kernel::{AddressSets, MemoryKernel};
use tpgate::lifecycle::Lifecycle;
use tpgate::policy::{Family, Mode};
use tpgate::process::MemoryProcesses;
use tpgate::sets::HostResolver;

/// Upstream hosts never need a lookup in these tests
pub struct Offline;

impl HostResolver for Offline {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        Err(io::Error::new(io::ErrorKind::NotFound, format!("{host}: offline")))
    }
}

/// Config with list files in a temp dir, plus a fresh kernel and process table
pub struct Fixture {
    pub dir: TempDir,
    pub config: Config,
    pub kernel: MemoryKernel,
    pub procs: MemoryProcesses,
}

impl Fixture {
    pub fn new(mode: Mode, configure: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = |name: &str| dir.path().join(name);

        fs::write(path("chnroute.txt"), "1.0.1.0/24\n114.114.114.0/24\n").expect("write");
        fs::write(path("chnroute6.txt"), "240e::/20\n").expect("write");
        fs::write(path("chnlist.txt"), "baidu.com\n").expect("write");
        fs::write(path("gfwlist.txt"), "google.com\n").expect("write");
        fs::write(path("deny.ext"), "-203.0.113.0/24\n-1.0.1.5\n~2001:db8:dead::/48\n").expect("write");

        let mut config = Config::default_config();
        config.mode = mode;
        config.lists.chnroute = path("chnroute.txt");
        config.lists.chnroute6 = path("chnroute6.txt");
        config.lists.chnlist = path("chnlist.txt");
        config.lists.gfwlist = path("gfwlist.txt");
        config.lists.deny_ext = Some(path("deny.ext"));
        config.runtime.record_path = path("run/state");
        config.runtime.work_dir = path("run");
        config.runtime.lock_path = path("run/lock");
        configure(&mut config);

        Self {
            dir,
            config,
            kernel: MemoryKernel::new(),
            procs: MemoryProcesses::new(),
        }
    }

    pub fn engine(&self) -> Lifecycle<'_> {
        Lifecycle::new(&self.config, &self.kernel, &self.procs)
            .expect("policy resolves")
            .with_host_resolver(Offline)
            .with_backoff(Backoff::immediate(3))
            .with_command_lookup(|_| true)
    }

    pub fn walker(&self) -> Walker<'_> {
        Walker {
            kernel: &self.kernel,
            mark: self.config.mark,
        }
    }
}

/// Where a packet comes from
#[derive(Debug, Clone)]
pub enum Origin {
    /// Generated on the gateway by a process of this group
    Local { group: String },
    /// Forwarded from a LAN client
    Lan,
}

/// First packet of a new connection
#[derive(Debug, Clone)]
pub struct Packet {
    pub origin: Origin,
    pub proto: Proto,
    pub dst: IpAddr,
    pub dport: u16,
}

impl Packet {
    pub fn tcp(origin: Origin, dst: &str, dport: u16) -> Self {
        Self {
            origin,
            proto: Proto::Tcp,
            dst: dst.parse().expect("address"),
            dport,
        }
    }

    pub fn udp(origin: Origin, dst: &str, dport: u16) -> Self {
        Self {
            proto: Proto::Udp,
            ..Self::tcp(origin, dst, dport)
        }
    }

    pub fn family(&self) -> Family {
        Family::of(&self.dst)
    }
}

pub fn local(group: &str) -> Origin {
    Origin::Local { group: group.into() }
}

/// Where the installed rules send a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Untouched
    Direct,
    /// Delivered to a transparent listener on this port
    Tproxy(u16),
    /// NATed to a local port
    Nat(u16),
    /// NATed to another host
    Dnat(IpAddr, u16),
    /// Dropped
    Dropped,
}

enum Flow {
    Continue,
    Stop(Target),
}

#[derive(Default)]
struct Marks {
    mark: u32,
    connmark: u32,
}

/// Evaluates the rules installed in a [`MemoryKernel`]
pub struct Walker<'a> {
    kernel: &'a MemoryKernel,
    mark: u32,
}

impl Walker<'_> {
    /// Verdict for the first packet of a connection
    pub fn verdict(&self, pkt: &Packet) -> Verdict {
        let family = pkt.family();
        let mut marks = Marks::default();

        let (mangle_hook, nat_hook) = match pkt.origin {
            Origin::Local { .. } => (Hook::Output, Hook::Output),
            Origin::Lan => (Hook::Prerouting, Hook::Prerouting),
        };

        if let Flow::Stop(target) = self.walk(family, Table::Mangle, mangle_hook.as_str(), pkt, &mut marks) {
            if let Some(verdict) = Self::terminal(&target) {
                return verdict;
            }
        }

        if let Flow::Stop(target) = self.walk(family, Table::Nat, nat_hook.as_str(), pkt, &mut marks) {
            if let Some(verdict) = Self::terminal(&target) {
                return verdict;
            }
        }

        // marked local traffic is rerouted to lo and re-enters PREROUTING
        if matches!(pkt.origin, Origin::Local { .. }) && marks.mark == self.mark {
            let rerouted = Packet {
                origin: Origin::Lan,
                ..pkt.clone()
            };
            if let Flow::Stop(target) = self.walk(family, Table::Mangle, "PREROUTING", &rerouted, &mut marks) {
                if let Some(verdict) = Self::terminal(&target) {
                    return verdict;
                }
            }
        }
        Verdict::Direct
    }

    fn terminal(target: &Target) -> Option<Verdict> {
        match target {
            Target::Drop => Some(Verdict::Dropped),
            Target::Tproxy { port, .. } => Some(Verdict::Tproxy(*port)),
            Target::Redirect { port } => Some(Verdict::Nat(*port)),
            Target::Dnat { addr, port } if addr.is_loopback() => Some(Verdict::Nat(*port)),
            Target::Dnat { addr, port } => Some(Verdict::Dnat(*addr, *port)),
            _ => None,
        }
    }

    fn walk(&self, family: Family, table: Table, chain: &str, pkt: &Packet, marks: &mut Marks) -> Flow {
        let rules = self.kernel.rules(family, table, chain).unwrap_or_default();
        for rule in &rules {
            if !rule.matches.iter().all(|m| self.matches(m, pkt, marks)) {
                continue;
            }
            match &rule.target {
                Target::Jump(sub) => {
                    if let Flow::Stop(target) = self.walk(family, table, sub, pkt, marks) {
                        return Flow::Stop(target);
                    }
                }
                Target::Return => return Flow::Continue,
                Target::SetMark(mark) => marks.mark = *mark,
                Target::SetConnMark(mark) => marks.connmark = *mark,
                target => return Flow::Stop(target.clone()),
            }
        }
        Flow::Continue
    }

    fn matches(&self, m: &Match, pkt: &Packet, marks: &Marks) -> bool {
        let is_local = matches!(pkt.origin, Origin::Local { .. });
        match m {
            Match::Protocol(proto) => *proto == pkt.proto,
            Match::DstPort(port) => *port == pkt.dport,
            Match::DstPorts(specs) => specs.iter().any(|spec| match *spec {
                PortSpec::Single(port) => port == pkt.dport,
                PortSpec::Range(start, end) => (start..=end).contains(&pkt.dport),
            }),
            Match::DstInSet { set, negate } => {
                let hit = self
                    .kernel
                    .list_members(set)
                    .map(|members| members.iter().any(|net| net.contains(&pkt.dst)))
                    .unwrap_or(false);
                hit != *negate
            }
            Match::DstLocal { negate } => pkt.dst.is_loopback() != *negate,
            Match::SrcLocal { negate } => is_local != *negate,
            Match::Dst { addr, negate } => (*addr == pkt.dst) != *negate,
            Match::Src { negate, .. } => *negate,
            Match::CtDirection(dir) => *dir == CtDir::Original,
            Match::CtState { states, negate } => states.contains(&CtState::New) != *negate,
            Match::OwnerGroup { group, negate } => {
                let owned = matches!(&pkt.origin, Origin::Local { group: g } if g == group);
                owned != *negate
            }
            Match::Mark(mark) => marks.mark == *mark,
            Match::ConnMark(mark) => marks.connmark == *mark,
            Match::TcpSyn => pkt.proto == Proto::Tcp,
        }
    }
}

/// Rules of a chain rendered as text, empty if the chain is absent
pub fn chain_text(kernel: &MemoryKernel, family: Family, table: Table, chain: &str) -> Vec<String> {
    kernel
        .rules(family, table, chain)
        .unwrap_or_default()
        .iter()
        .map(Rule::to_string)
        .collect()
}

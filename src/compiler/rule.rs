//! Structured iptables rules.
//!
//! Rules are data: a list of matches and one target. They render to the
//! exact argument vector passed to `iptables`/`ip6tables` and compare by
//! value, which is what the in-memory kernel and the rule-walk tests use.

use std::fmt;
use std::net::IpAddr;

use crate::config::PortSpec;

/// Netfilter table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Packet mangling (marks, TPROXY)
    Mangle,
    /// Connection NAT
    Nat,
}

impl Table {
    /// Both tables used by the engine
    pub const ALL: [Table; 2] = [Table::Mangle, Table::Nat];

    /// Table name as passed to `-t`
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mangle => "mangle",
            Self::Nat => "nat",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Built-in hook chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hook {
    /// Incoming packets
    Prerouting,
    /// Locally generated packets
    Output,
    /// Outgoing packets after routing
    Postrouting,
}

impl Hook {
    /// Chain name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prerouting => "PREROUTING",
            Self::Output => "OUTPUT",
            Self::Postrouting => "POSTROUTING",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl Proto {
    /// Protocol keyword
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// Connection-tracking direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CtDir {
    /// Original direction
    Original,
    /// Reply direction
    Reply,
}

/// Connection-tracking state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CtState {
    /// First packet of a connection
    New,
    /// Related to an existing connection (ICMP errors, FTP data)
    Related,
    /// Source NAT applied
    Snat,
    /// Destination NAT applied
    Dnat,
}

impl CtState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Related => "RELATED",
            Self::Snat => "SNAT",
            Self::Dnat => "DNAT",
        }
    }
}

/// A single match condition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Match {
    /// `-p <proto>`
    Protocol(Proto),
    /// `--dport <port>` (requires a protocol match first)
    DstPort(u16),
    /// `-m multiport --dports <list>`
    DstPorts(Vec<PortSpec>),
    /// `-m set [!] --match-set <set> dst`
    DstInSet { set: String, negate: bool },
    /// `-m addrtype [!] --dst-type LOCAL`
    DstLocal { negate: bool },
    /// `-m addrtype [!] --src-type LOCAL`
    SrcLocal { negate: bool },
    /// `[!] -d <addr>`
    Dst { addr: IpAddr, negate: bool },
    /// `[!] -s <addr>`
    Src { addr: IpAddr, negate: bool },
    /// `-m conntrack --ctdir <dir>`
    CtDirection(CtDir),
    /// `-m conntrack [!] --ctstate <states>`
    CtState { states: Vec<CtState>, negate: bool },
    /// `-m owner [!] --gid-owner <group>`
    OwnerGroup { group: String, negate: bool },
    /// `-m mark --mark <mark>`
    Mark(u32),
    /// `-m connmark --mark <mark>`
    ConnMark(u32),
    /// `--syn` (requires `-p tcp`)
    TcpSyn,
}

impl Match {
    fn push_args(&self, out: &mut Vec<String>) {
        fn bang(out: &mut Vec<String>, negate: bool) {
            if negate {
                out.push("!".into());
            }
        }

        match self {
            Self::Protocol(proto) => {
                out.extend(["-p".into(), proto.as_str().into()]);
            }
            Self::DstPort(port) => {
                out.extend(["--dport".into(), port.to_string()]);
            }
            Self::DstPorts(ports) => {
                let list = ports.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
                out.extend(["-m".into(), "multiport".into(), "--dports".into(), list]);
            }
            Self::DstInSet { set, negate } => {
                out.extend(["-m".into(), "set".into()]);
                bang(out, *negate);
                out.extend(["--match-set".into(), set.clone(), "dst".into()]);
            }
            Self::DstLocal { negate } => {
                out.extend(["-m".into(), "addrtype".into()]);
                bang(out, *negate);
                out.extend(["--dst-type".into(), "LOCAL".into()]);
            }
            Self::SrcLocal { negate } => {
                out.extend(["-m".into(), "addrtype".into()]);
                bang(out, *negate);
                out.extend(["--src-type".into(), "LOCAL".into()]);
            }
            Self::Dst { addr, negate } => {
                bang(out, *negate);
                out.extend(["-d".into(), addr.to_string()]);
            }
            Self::Src { addr, negate } => {
                bang(out, *negate);
                out.extend(["-s".into(), addr.to_string()]);
            }
            Self::CtDirection(dir) => {
                let dir = match dir {
                    CtDir::Original => "ORIGINAL",
                    CtDir::Reply => "REPLY",
                };
                out.extend(["-m".into(), "conntrack".into(), "--ctdir".into(), dir.into()]);
            }
            Self::CtState { states, negate } => {
                out.extend(["-m".into(), "conntrack".into()]);
                bang(out, *negate);
                let list = states.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",");
                out.extend(["--ctstate".into(), list]);
            }
            Self::OwnerGroup { group, negate } => {
                out.extend(["-m".into(), "owner".into()]);
                bang(out, *negate);
                out.extend(["--gid-owner".into(), group.clone()]);
            }
            Self::Mark(mark) => {
                out.extend(["-m".into(), "mark".into(), "--mark".into(), format!("{mark:#x}")]);
            }
            Self::ConnMark(mark) => {
                out.extend(["-m".into(), "connmark".into(), "--mark".into(), format!("{mark:#x}")]);
            }
            Self::TcpSyn => out.push("--syn".into()),
        }
    }
}

/// Rule target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Jump to a user chain
    Jump(String),
    /// Return to the calling chain
    Return,
    /// Drop the packet
    Drop,
    /// `MARK --set-mark`
    SetMark(u32),
    /// `CONNMARK --set-mark`
    SetConnMark(u32),
    /// `TPROXY --on-ip --on-port --tproxy-mark`
    Tproxy { addr: IpAddr, port: u16, mark: u32 },
    /// `DNAT --to-destination`
    Dnat { addr: IpAddr, port: u16 },
    /// `REDIRECT --to-ports`
    Redirect { port: u16 },
    /// `SNAT --to-source`
    Snat { addr: IpAddr },
    /// `MASQUERADE`
    Masquerade,
}

impl Target {
    /// Whether evaluation stops at this target
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Jump(_) | Self::SetMark(_) | Self::SetConnMark(_))
    }

    fn push_args(&self, out: &mut Vec<String>) {
        out.push("-j".into());
        match self {
            Self::Jump(chain) => out.push(chain.clone()),
            Self::Return => out.push("RETURN".into()),
            Self::Drop => out.push("DROP".into()),
            Self::SetMark(mark) => {
                out.extend(["MARK".into(), "--set-mark".into(), format!("{mark:#x}")]);
            }
            Self::SetConnMark(mark) => {
                out.extend(["CONNMARK".into(), "--set-mark".into(), format!("{mark:#x}")]);
            }
            Self::Tproxy { addr, port, mark } => {
                out.extend([
                    "TPROXY".into(),
                    "--on-ip".into(),
                    addr.to_string(),
                    "--on-port".into(),
                    port.to_string(),
                    "--tproxy-mark".into(),
                    format!("{mark:#x}"),
                ]);
            }
            Self::Dnat { addr, port } => {
                let dest = match addr {
                    IpAddr::V4(v4) => format!("{v4}:{port}"),
                    IpAddr::V6(v6) => format!("[{v6}]:{port}"),
                };
                out.extend(["DNAT".into(), "--to-destination".into(), dest]);
            }
            Self::Redirect { port } => {
                out.extend(["REDIRECT".into(), "--to-ports".into(), port.to_string()]);
            }
            Self::Snat { addr } => {
                out.extend(["SNAT".into(), "--to-source".into(), addr.to_string()]);
            }
            Self::Masquerade => out.push("MASQUERADE".into()),
        }
    }
}

/// Matches plus target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    /// Conditions, all of which must hold
    pub matches: Vec<Match>,
    /// Action taken on match
    pub target: Target,
}

impl Rule {
    /// Unconditional rule
    #[must_use]
    pub fn to(target: Target) -> Self {
        Self {
            matches: Vec::new(),
            target,
        }
    }

    /// Jump to `chain`
    #[must_use]
    pub fn jump(chain: &str) -> Self {
        Self::to(Target::Jump(chain.to_string()))
    }

    /// Add a match
    #[must_use]
    pub fn with(mut self, m: Match) -> Self {
        self.matches.push(m);
        self
    }

    /// Add `-p <proto>`
    #[must_use]
    pub fn proto(self, proto: Proto) -> Self {
        self.with(Match::Protocol(proto))
    }

    /// Add `--dport <port>`
    #[must_use]
    pub fn dport(self, port: u16) -> Self {
        self.with(Match::DstPort(port))
    }

    /// Add a multiport allowlist, skipped when empty
    #[must_use]
    pub fn dports(self, ports: &[PortSpec]) -> Self {
        if ports.is_empty() {
            self
        } else {
            self.with(Match::DstPorts(ports.to_vec()))
        }
    }

    /// Add an owner group match
    #[must_use]
    pub fn owner(self, group: &str, negate: bool) -> Self {
        self.with(Match::OwnerGroup {
            group: group.to_string(),
            negate,
        })
    }

    /// Add a destination set match
    #[must_use]
    pub fn dst_set(self, set: &str, negate: bool) -> Self {
        self.with(Match::DstInSet {
            set: set.to_string(),
            negate,
        })
    }

    /// Protocol this rule is restricted to, if any
    #[must_use]
    pub fn protocol(&self) -> Option<Proto> {
        self.matches.iter().find_map(|m| match m {
            Match::Protocol(p) => Some(*p),
            _ => None,
        })
    }

    /// Chain this rule jumps to, if any
    #[must_use]
    pub fn jump_target(&self) -> Option<&str> {
        match &self.target {
            Target::Jump(chain) => Some(chain),
            _ => None,
        }
    }

    /// Argument vector after `-A <chain>`
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut out = Vec::new();
        for m in &self.matches {
            m.push_args(&mut out);
        }
        self.target.push_args(&mut out);
        out
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_args().join(" "))
    }
}

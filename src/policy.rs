//! Policy model
//!
//! The resolved, immutable description of what the engine must install for
//! one run. Everything downstream (address sets, routing, rule compilation,
//! lifecycle) reads a [`Policy`]; nothing here touches the host.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{Config, PortSpec};
use crate::error::ConfigError;

/// Traffic classification mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Proxy everything not in the allow set
    Global,
    /// Proxy only what is in the deny set
    Gfwlist,
    /// Pass the allow set (national routes) unless also denied, proxy the rest
    Chnroute,
}

impl Mode {
    /// Keyword used in configuration and logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Gfwlist => "gfwlist",
            Self::Chnroute => "chnroute",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "gfwlist" => Ok(Self::Gfwlist),
            "chnroute" => Ok(Self::Chnroute),
            _ => Err(ConfigError::UnknownKeyword {
                kind: "mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub enum Family {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl Family {
    /// Both families, IPv4 first
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];

    /// Rule table command for this family
    #[must_use]
    pub const fn iptables(self) -> &'static str {
        match self {
            Self::V4 => "iptables",
            Self::V6 => "ip6tables",
        }
    }

    /// `ip` family flag
    #[must_use]
    pub const fn ip_flag(self) -> &'static str {
        match self {
            Self::V4 => "-4",
            Self::V6 => "-6",
        }
    }

    /// ipset family keyword
    #[must_use]
    pub const fn ipset_family(self) -> &'static str {
        match self {
            Self::V4 => "inet",
            Self::V6 => "inet6",
        }
    }

    /// Loopback address of the family
    #[must_use]
    pub const fn loopback(self) -> IpAddr {
        match self {
            Self::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Self::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }

    /// Default route destination of the family
    #[must_use]
    pub const fn default_route(self) -> &'static str {
        match self {
            Self::V4 => "0.0.0.0/0",
            Self::V6 => "::/0",
        }
    }

    /// Family of an address
    #[must_use]
    pub const fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => f.write_str("ipv4"),
            Self::V6 => f.write_str("ipv6"),
        }
    }
}

/// How intercepted TCP reaches the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingStrategy {
    /// Mark and deliver through the TPROXY target (TCP and UDP)
    #[default]
    Tproxy,
    /// Connection NAT for TCP; UDP still uses the TPROXY path
    Redirect,
}

impl fmt::Display for ForwardingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tproxy => f.write_str("tproxy"),
            Self::Redirect => f.write_str("redirect"),
        }
    }
}

impl FromStr for ForwardingStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tproxy" => Ok(Self::Tproxy),
            "redirect" => Ok(Self::Redirect),
            _ => Err(ConfigError::UnknownKeyword {
                kind: "forwarding strategy",
                value: s.to_string(),
            }),
        }
    }
}

/// QUIC (udp/443) suppression policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropQuicPolicy {
    /// Never drop
    #[default]
    Never,
    /// Drop only when UDP interception is disabled
    TcpOnly,
    /// Always drop proxy-bound QUIC
    Always,
}

impl FromStr for DropQuicPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "tcp_only" | "tcponly" => Ok(Self::TcpOnly),
            "always" => Ok(Self::Always),
            _ => Err(ConfigError::UnknownKeyword {
                kind: "drop-quic policy",
                value: s.to_string(),
            }),
        }
    }
}

/// Routing tables the kernel reserves (local, main, default)
const RESERVED_TABLES: [u32; 3] = [253, 254, 255];

/// Group names that would exempt nearly all traffic
const SUPERUSER_GROUPS: [&str; 2] = ["root", "0"];

/// Resolved, validated policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Classification mode
    pub mode: Mode,
    /// Enabled families, IPv4 first
    pub families: Vec<Family>,
    /// Intercept TCP
    pub tcp: bool,
    /// Intercept UDP
    pub udp: bool,
    /// TCP forwarding strategy
    pub strategy: ForwardingStrategy,
    /// QUIC suppression
    pub drop_quic: DropQuicPolicy,
    /// Classify LAN-origin traffic
    pub proxy_other: bool,
    /// Process group of the proxy
    pub proxy_group: String,
    /// Process group of the resolver
    pub dns_group: String,
    /// Proxy transparent TCP port
    pub proxy_tcp_port: u16,
    /// Proxy transparent UDP port
    pub proxy_udp_port: u16,
    /// Local resolver port
    pub dns_port: u16,
    /// Local resolver listen address
    pub dns_bind: IpAddr,
    /// Destination port allowlist (empty = all)
    pub dst_ports: Vec<PortSpec>,
    /// Reserved mark
    pub mark: u32,
    /// Dedicated routing table
    pub route_table: u32,
    /// Masquerade LAN-origin IPv4
    pub masquerade_v4: bool,
    /// Masquerade LAN-origin IPv6
    pub masquerade_v6: bool,
    /// Direct resolver used while stopped
    pub failsafe_dns: Option<IpAddr>,
}

impl Policy {
    /// Resolve and validate the policy from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` when an invariant is violated.
    pub fn resolve(config: &Config) -> Result<Self, ConfigError> {
        let mut families = Vec::with_capacity(2);
        if config.ipv4 {
            families.push(Family::V4);
        }
        if config.ipv6 {
            families.push(Family::V6);
        }
        if families.is_empty() {
            return Err(ConfigError::validation("at least one of ipv4/ipv6 must be enabled"));
        }

        if !config.tcp && !config.udp {
            return Err(ConfigError::validation("at least one of tcp/udp must be enabled"));
        }

        if config.strategy == ForwardingStrategy::Redirect && !config.tcp {
            return Err(ConfigError::validation(
                "redirect strategy requires tcp interception; use tproxy for udp-only",
            ));
        }

        validate_group("proxy.group", &config.proxy.group)?;
        validate_group("dns.group", &config.dns.group)?;
        if config.proxy.group == config.dns.group {
            return Err(ConfigError::validation(format!(
                "proxy.group and dns.group must differ (both '{}')",
                config.proxy.group
            )));
        }

        if config.mark == 0 {
            return Err(ConfigError::validation("mark must be non-zero"));
        }
        if config.route_table == 0 || RESERVED_TABLES.contains(&config.route_table) {
            return Err(ConfigError::validation(format!(
                "route_table {} is reserved",
                config.route_table
            )));
        }

        if let Some(failsafe) = config.dns.failsafe {
            if failsafe.is_loopback() || failsafe.is_unspecified() {
                return Err(ConfigError::validation(
                    "dns.failsafe must be a reachable direct resolver, not a local address",
                ));
            }
        }

        let dns_bind = resolve_dns_bind(config.dns.bind, &families)?;

        Ok(Self {
            mode: config.mode,
            families,
            tcp: config.tcp,
            udp: config.udp,
            strategy: config.strategy,
            drop_quic: config.drop_quic,
            proxy_other: config.proxy_other,
            proxy_group: config.proxy.group.clone(),
            dns_group: config.dns.group.clone(),
            proxy_tcp_port: config.proxy.tcp_port,
            proxy_udp_port: config.proxy.udp_port,
            dns_port: config.dns.port,
            dns_bind,
            dst_ports: config.dst_ports.clone(),
            mark: config.mark,
            route_table: config.route_table,
            masquerade_v4: config.nat.masquerade_v4,
            masquerade_v6: config.nat.masquerade_v6,
            failsafe_dns: config.dns.failsafe,
        })
    }

    /// Whether a family is enabled
    #[must_use]
    pub fn has_family(&self, family: Family) -> bool {
        self.families.contains(&family)
    }

    /// TCP is marked and delivered through TPROXY
    #[must_use]
    pub fn tcp_via_tproxy(&self) -> bool {
        self.tcp && self.strategy == ForwardingStrategy::Tproxy
    }

    /// TCP is delivered through connection NAT
    #[must_use]
    pub fn tcp_via_redirect(&self) -> bool {
        self.tcp && self.strategy == ForwardingStrategy::Redirect
    }

    /// Whether the mark/TPROXY path is needed at all
    #[must_use]
    pub fn uses_mark_path(&self) -> bool {
        self.tcp_via_tproxy() || self.udp
    }

    /// Whether proxy-bound QUIC is dropped
    #[must_use]
    pub fn drops_quic(&self) -> bool {
        match self.drop_quic {
            DropQuicPolicy::Never => false,
            DropQuicPolicy::TcpOnly => !self.udp,
            DropQuicPolicy::Always => true,
        }
    }

    /// Masquerade setting for a family
    #[must_use]
    pub fn masquerade(&self, family: Family) -> bool {
        match family {
            Family::V4 => self.masquerade_v4,
            Family::V6 => self.masquerade_v6,
        }
    }

    /// Fail-safe resolver address usable for a family
    #[must_use]
    pub fn failsafe_dns_for(&self, family: Family) -> Option<IpAddr> {
        self.failsafe_dns.filter(|addr| Family::of(addr) == family)
    }
}

/// The resolver must be reachable where the nat rules send DNS: IPv4
/// goes to 127.0.0.1, IPv6 is REDIRECTed to `::1` or the ingress address,
/// which only a dual-stack `::` listener covers.
fn resolve_dns_bind(configured: Option<IpAddr>, families: &[Family]) -> Result<IpAddr, ConfigError> {
    let v6 = families.contains(&Family::V6);
    let bind = configured.unwrap_or(if v6 {
        IpAddr::from(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::from(Ipv4Addr::LOCALHOST)
    });

    let serves_v4 = match bind {
        IpAddr::V4(addr) => addr.is_loopback() || addr.is_unspecified(),
        IpAddr::V6(addr) => addr.is_unspecified(),
    };
    let serves_v6 = bind == IpAddr::from(Ipv6Addr::UNSPECIFIED);

    for &family in families {
        let served = match family {
            Family::V4 => serves_v4,
            Family::V6 => serves_v6,
        };
        if !served {
            return Err(ConfigError::validation(format!(
                "dns.bind {bind} cannot receive {family} DNS redirected by the rules{}",
                if family == Family::V6 { "; use ::" } else { "" }
            )));
        }
    }
    Ok(bind)
}

fn validate_group(field: &str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(ConfigError::validation(format!("{field} '{name}' is not a valid group name")));
    }
    if SUPERUSER_GROUPS.contains(&name) {
        return Err(ConfigError::validation(format!(
            "{field} cannot be the superuser group"
        )));
    }
    Ok(())
}

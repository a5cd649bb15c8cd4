//! Configuration types for tpgate
//!
//! The configuration is a JSON document describing the declarative policy,
//! the two external processes, list file locations and runtime paths.
//! [`crate::policy::Policy::resolve`] turns it into the immutable policy
//! consumed by the engine.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::{DropQuicPolicy, ForwardingStrategy, Mode};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Traffic classification mode
    pub mode: Mode,

    /// Enable IPv4 rules
    #[serde(default = "default_true")]
    pub ipv4: bool,

    /// Enable IPv6 rules
    #[serde(default)]
    pub ipv6: bool,

    /// Intercept TCP
    #[serde(default = "default_true")]
    pub tcp: bool,

    /// Intercept UDP
    #[serde(default = "default_true")]
    pub udp: bool,

    /// How TCP reaches the proxy
    #[serde(default)]
    pub strategy: ForwardingStrategy,

    /// QUIC (udp/443) suppression
    #[serde(default)]
    pub drop_quic: DropQuicPolicy,

    /// Classify LAN-origin traffic as well as local-origin traffic
    #[serde(default = "default_true")]
    pub proxy_other: bool,

    /// Only proxy these destination ports (empty = all ports)
    #[serde(default)]
    pub dst_ports: Vec<PortSpec>,

    /// Reserved packet/connection mark
    #[serde(default = "default_mark")]
    pub mark: u32,

    /// Dedicated routing table for marked packets
    #[serde(default = "default_route_table")]
    pub route_table: u32,

    /// Proxy process settings
    pub proxy: ProxyConfig,

    /// Resolver process settings
    pub dns: DnsConfig,

    /// List file locations
    #[serde(default)]
    pub lists: ListsConfig,

    /// Source NAT for LAN clients
    #[serde(default)]
    pub nat: NatConfig,

    /// Operator hook commands
    #[serde(default)]
    pub hooks: HooksConfig,

    /// Runtime paths
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// Only structural checks live here; policy invariants are enforced by
    /// [`crate::policy::Policy::resolve`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxy.validate()?;
        self.dns.validate()?;

        for spec in &self.dst_ports {
            spec.validate()?;
        }

        let slots: usize = self.dst_ports.iter().map(PortSpec::multiport_slots).sum();
        if slots > MULTIPORT_SLOTS {
            return Err(ConfigError::validation(format!(
                "dst_ports needs {slots} multiport slots, at most {MULTIPORT_SLOTS} are available"
            )));
        }

        if self.runtime.record_path.as_os_str().is_empty() {
            return Err(ConfigError::validation("runtime.record_path cannot be empty"));
        }

        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            mode: Mode::Chnroute,
            ipv4: true,
            ipv6: false,
            tcp: true,
            udp: true,
            strategy: ForwardingStrategy::Tproxy,
            drop_quic: DropQuicPolicy::TcpOnly,
            proxy_other: true,
            dst_ports: Vec::new(),
            mark: default_mark(),
            route_table: default_route_table(),
            proxy: ProxyConfig::default(),
            dns: DnsConfig::default(),
            lists: ListsConfig::default(),
            nat: NatConfig::default(),
            hooks: HooksConfig::default(),
            runtime: RuntimeConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Ports one `multiport` match can hold; a range takes two
const MULTIPORT_SLOTS: usize = 15;

/// Destination port or inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PortSpec {
    /// Single port
    Single(u16),
    /// Inclusive range `[start, end]`
    Range(u16, u16),
}

impl PortSpec {
    const fn multiport_slots(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Range(..) => 2,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Self::Single(0) => Err(ConfigError::validation("dst_ports cannot contain port 0")),
            Self::Range(start, end) if start == 0 || start > end => Err(ConfigError::validation(
                format!("invalid dst_ports range {start}-{end}"),
            )),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for PortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(port) => write!(f, "{port}"),
            Self::Range(start, end) => write!(f, "{start}:{end}"),
        }
    }
}

/// Proxy process configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Process group the proxy runs under
    #[serde(default = "default_proxy_group")]
    pub group: String,

    /// Transparent TCP listener port
    #[serde(default = "default_proxy_port")]
    pub tcp_port: u16,

    /// Transparent UDP listener port
    #[serde(default = "default_proxy_port")]
    pub udp_port: u16,

    /// Shell command starting the proxy
    #[serde(default)]
    pub start_cmd: String,

    /// Shell command stopping the proxy
    #[serde(default)]
    pub stop_cmd: Option<String>,

    /// Process names to terminate on stop (graceful, then forced)
    #[serde(default)]
    pub process_names: Vec<String>,

    /// Upstream proxy servers, `[scheme://][user@]host[#port][/path]`
    #[serde(default)]
    pub servers: Vec<String>,
}

impl ProxyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp_port == 0 || self.udp_port == 0 {
            return Err(ConfigError::validation("proxy ports must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            group: default_proxy_group(),
            tcp_port: default_proxy_port(),
            udp_port: default_proxy_port(),
            start_cmd: String::new(),
            stop_cmd: None,
            process_names: Vec::new(),
            servers: Vec::new(),
        }
    }
}

/// Resolver process configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    /// Process group the resolver runs under
    #[serde(default = "default_dns_group")]
    pub group: String,

    /// Listen port of the local resolver
    #[serde(default = "default_dns_port")]
    pub port: u16,

    /// Listen address of the local resolver. Defaults to `::` when IPv6
    /// is enabled, `127.0.0.1` otherwise.
    #[serde(default)]
    pub bind: Option<IpAddr>,

    /// Resolver backend
    #[serde(default)]
    pub backend: DnsBackend,

    /// Direct (domestic) upstream servers for IPv4 clients
    #[serde(default = "default_direct_dns")]
    pub direct: Vec<String>,

    /// Remote (trusted) upstream servers reached through the proxy
    #[serde(default = "default_remote_dns")]
    pub remote: Vec<String>,

    /// Direct upstream servers over IPv6
    #[serde(default)]
    pub direct6: Vec<String>,

    /// Remote upstream servers over IPv6
    #[serde(default)]
    pub remote6: Vec<String>,

    /// Force TCP to the remote upstreams
    #[serde(default = "default_true")]
    pub remote_tcp: bool,

    /// Cache capacity passed to the resolver (0 disables)
    #[serde(default = "default_cache_size")]
    pub cache_size: u32,

    /// Put direct upstream addresses into the allow sets
    #[serde(default = "default_true")]
    pub direct_in_allow: bool,

    /// Put remote upstream addresses into the deny sets
    #[serde(default = "default_true")]
    pub remote_in_deny: bool,

    /// Direct resolver used by the fail-safe rule set while stopped
    #[serde(default)]
    pub failsafe: Option<IpAddr>,

    /// Resolver stdout/stderr log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl DnsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::validation("dns.port must be greater than 0"));
        }
        if self.direct.is_empty() && self.direct6.is_empty() {
            return Err(ConfigError::validation("at least one direct DNS upstream is required"));
        }
        if self.remote.is_empty() && self.remote6.is_empty() {
            return Err(ConfigError::validation("at least one remote DNS upstream is required"));
        }
        if let DnsBackend::Command { start_cmd, .. } = &self.backend {
            if start_cmd.trim().is_empty() {
                return Err(ConfigError::validation("dns.backend.start_cmd cannot be empty"));
            }
        }
        Ok(())
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            group: default_dns_group(),
            port: default_dns_port(),
            bind: None,
            backend: DnsBackend::default(),
            direct: default_direct_dns(),
            remote: default_remote_dns(),
            direct6: Vec::new(),
            remote6: Vec::new(),
            remote_tcp: true,
            cache_size: default_cache_size(),
            direct_in_allow: true,
            remote_in_deny: true,
            failsafe: None,
            log_file: None,
        }
    }
}

/// Resolver backend selection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DnsBackend {
    /// chinadns-ng compatible binary spawned with a constructed argument list
    Chinadns {
        /// Executable name or path
        #[serde(default = "default_resolver_binary")]
        binary: String,
    },
    /// Operator-supplied start/stop commands
    Command {
        /// Start command
        start_cmd: String,
        /// Stop command
        #[serde(default)]
        stop_cmd: Option<String>,
        /// Process names to terminate on stop
        #[serde(default)]
        process_names: Vec<String>,
    },
}

impl Default for DnsBackend {
    fn default() -> Self {
        Self::Chinadns {
            binary: default_resolver_binary(),
        }
    }
}

/// List file locations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListsConfig {
    /// Extra allow (direct) entries, marker-tagged
    #[serde(default)]
    pub allow_ext: Option<PathBuf>,

    /// Extra deny (proxy) entries, marker-tagged
    #[serde(default)]
    pub deny_ext: Option<PathBuf>,

    /// Domain list of blocked sites (gfwlist mode, resolver input)
    #[serde(default = "default_gfwlist")]
    pub gfwlist: PathBuf,

    /// Domain list of domestic sites (chnroute mode, resolver input)
    #[serde(default = "default_chnlist")]
    pub chnlist: PathBuf,

    /// National IPv4 route list (chnroute mode)
    #[serde(default = "default_chnroute")]
    pub chnroute: PathBuf,

    /// National IPv6 route list (chnroute mode)
    #[serde(default = "default_chnroute6")]
    pub chnroute6: PathBuf,
}

impl Default for ListsConfig {
    fn default() -> Self {
        Self {
            allow_ext: None,
            deny_ext: None,
            gfwlist: default_gfwlist(),
            chnlist: default_chnlist(),
            chnroute: default_chnroute(),
            chnroute6: default_chnroute6(),
        }
    }
}

/// Source NAT configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NatConfig {
    /// Masquerade LAN-origin IPv4 traffic
    #[serde(default)]
    pub masquerade_v4: bool,

    /// Masquerade LAN-origin IPv6 traffic
    #[serde(default)]
    pub masquerade_v6: bool,
}

/// Hook commands run around start and stop
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HooksConfig {
    /// Before start
    #[serde(default)]
    pub pre_start: Option<String>,
    /// After start
    #[serde(default)]
    pub post_start: Option<String>,
    /// Before stop
    #[serde(default)]
    pub pre_stop: Option<String>,
    /// After stop
    #[serde(default)]
    pub post_stop: Option<String>,
}

impl HooksConfig {
    /// Whether any hook command is configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pre_start.is_none()
            && self.post_start.is_none()
            && self.pre_stop.is_none()
            && self.post_stop.is_none()
    }
}

/// Runtime file locations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Advisory record written after a successful start
    #[serde(default = "default_record_path")]
    pub record_path: PathBuf,

    /// Directory for generated resolver list files
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Invocation lock file
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            record_path: default_record_path(),
            work_dir: default_work_dir(),
            lock_path: default_lock_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default)]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

// Default value functions for serde
const fn default_true() -> bool {
    true
}

const fn default_mark() -> u32 {
    0x2333
}

const fn default_route_table() -> u32 {
    233
}

const fn default_proxy_port() -> u16 {
    60080
}

const fn default_dns_port() -> u16 {
    60053
}

const fn default_cache_size() -> u32 {
    4096
}

fn default_proxy_group() -> String {
    "proxy".into()
}

fn default_dns_group() -> String {
    "proxy_dns".into()
}

fn default_resolver_binary() -> String {
    "chinadns-ng".into()
}

fn default_direct_dns() -> Vec<String> {
    vec!["223.5.5.5".into()]
}

fn default_remote_dns() -> Vec<String> {
    vec!["8.8.8.8".into()]
}

fn default_gfwlist() -> PathBuf {
    PathBuf::from("/etc/tpgate/gfwlist.txt")
}

fn default_chnlist() -> PathBuf {
    PathBuf::from("/etc/tpgate/chnlist.txt")
}

fn default_chnroute() -> PathBuf {
    PathBuf::from("/etc/tpgate/chnroute.txt")
}

fn default_chnroute6() -> PathBuf {
    PathBuf::from("/etc/tpgate/chnroute6.txt")
}

fn default_record_path() -> PathBuf {
    PathBuf::from("/run/tpgate/state")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/run/tpgate")
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("/run/tpgate.lock")
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

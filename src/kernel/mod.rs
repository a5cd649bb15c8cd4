//! Kernel state backends
//!
//! The engine never touches the host directly. Everything it installs goes
//! through four narrow traits:
//!
//! - [`Netfilter`]: chains and rules in the mangle and nat tables
//! - [`AddressSets`]: named `hash:net` address sets
//! - [`PolicyRoutes`]: the fwmark policy rule and the dedicated route table
//! - [`Sysctl`]: kernel parameters
//!
//! [`SystemKernel`] implements them by shelling out to `iptables`,
//! `ip6tables`, `ipset`, `ip` and `sysctl`. [`MemoryKernel`] keeps the same
//! state in memory for `--dry-run` and tests.
//!
//! # Required Kernel Parameters
//!
//! ```text
//! net.ipv4.ip_forward = 1                  # gateway for LAN clients
//! net.ipv4.conf.all.route_localnet = 1     # DNAT to 127.0.0.1 from PREROUTING
//! net.ipv4.conf.all.send_redirects = 0     # never tell clients to bypass us
//! net.ipv6.conf.all.forwarding = 1
//! ```

mod iproute;
mod ipset;
mod iptables;
mod memory;
mod sysctl;

use ipnet::IpNet;

use crate::compiler::{Rule, Table};
use crate::error::KernelError;
use crate::exec::{CommandRunner, SystemRunner};
use crate::policy::Family;

pub use memory::MemoryKernel;
pub use sysctl::required_params;

/// Result type of kernel operations
pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Chain and rule manipulation
pub trait Netfilter {
    /// Whether the family's rule tool is usable at all
    fn available(&self, family: Family) -> bool;

    /// Whether a chain exists
    fn chain_exists(&self, family: Family, table: Table, chain: &str) -> KernelResult<bool>;

    /// Create an empty user chain (`Exists` if present)
    fn new_chain(&self, family: Family, table: Table, chain: &str) -> KernelResult<()>;

    /// Remove every rule from a chain
    fn flush_chain(&self, family: Family, table: Table, chain: &str) -> KernelResult<()>;

    /// Delete an empty, unreferenced user chain
    fn delete_chain(&self, family: Family, table: Table, chain: &str) -> KernelResult<()>;

    /// Append a rule
    fn append(&self, family: Family, table: Table, chain: &str, rule: &Rule) -> KernelResult<()>;

    /// Insert a rule at the head of a chain
    fn insert(&self, family: Family, table: Table, chain: &str, rule: &Rule) -> KernelResult<()>;

    /// Delete the first matching rule (`NotFound` if none)
    fn delete(&self, family: Family, table: Table, chain: &str, rule: &Rule) -> KernelResult<()>;

    /// Whether a matching rule exists
    fn contains(&self, family: Family, table: Table, chain: &str, rule: &Rule) -> KernelResult<bool>;

    /// Rules of a chain in `-A CHAIN ...` form
    fn list(&self, family: Family, table: Table, chain: &str) -> KernelResult<Vec<String>>;
}

/// Named address sets
pub trait AddressSets {
    /// Whether a set exists
    fn set_exists(&self, name: &str) -> KernelResult<bool>;

    /// Create a set; succeeds if it already exists with the same family
    fn create_set(&self, name: &str, family: Family) -> KernelResult<()>;

    /// Add members to an existing set
    fn restore_set(&self, name: &str, members: &[IpNet]) -> KernelResult<()>;

    /// Atomically exchange two sets
    fn swap_sets(&self, a: &str, b: &str) -> KernelResult<()>;

    /// Destroy a set (`NotFound` if absent, `Busy` while referenced)
    fn destroy_set(&self, name: &str) -> KernelResult<()>;

    /// Members of a set
    fn list_members(&self, name: &str) -> KernelResult<Vec<IpNet>>;
}

/// Policy routing for marked packets
pub trait PolicyRoutes {
    /// Add `fwmark <mark> lookup <table>`
    fn add_rule(&self, family: Family, mark: u32, table: u32) -> KernelResult<()>;

    /// Delete one matching rule (`NotFound` if none)
    fn delete_rule(&self, family: Family, mark: u32, table: u32) -> KernelResult<()>;

    /// Whether a matching rule exists
    fn has_rule(&self, family: Family, mark: u32, table: u32) -> KernelResult<bool>;

    /// Add `local default dev lo` to the table
    fn add_local_route(&self, family: Family, table: u32) -> KernelResult<()>;

    /// Remove every route of the table
    fn flush_table(&self, family: Family, table: u32) -> KernelResult<()>;

    /// Routes of the table
    fn table_routes(&self, family: Family, table: u32) -> KernelResult<Vec<String>>;
}

/// Kernel parameters
pub trait Sysctl {
    /// Set `key` to `value`
    fn set_param(&self, key: &str, value: &str) -> KernelResult<()>;
}

/// Everything the engine needs from the host kernel
pub trait Kernel: Netfilter + AddressSets + PolicyRoutes + Sysctl {}

impl<T: Netfilter + AddressSets + PolicyRoutes + Sysctl> Kernel for T {}

/// Kernel backend driving the real host tools
#[derive(Debug, Clone, Default)]
pub struct SystemKernel<R: CommandRunner = SystemRunner> {
    runner: R,
}

impl SystemKernel<SystemRunner> {
    /// Backend using `std::process::Command`
    #[must_use]
    pub const fn new() -> Self {
        Self {
            runner: SystemRunner::new(),
        }
    }
}

impl<R: CommandRunner> SystemKernel<R> {
    /// Backend using a custom runner
    pub const fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    fn runner(&self) -> &R {
        &self.runner
    }
}

/// Classify the stderr of a failed tool invocation.
fn classify(stderr: &str) -> crate::error::KernelErrorKind {
    use crate::error::KernelErrorKind;

    let lower = stderr.to_ascii_lowercase();
    if lower.contains("does not exist")
        || lower.contains("no chain/target/match")
        || lower.contains("does a matching rule exist")
        || lower.contains("no such file or directory")
        || lower.contains("no such process")
        || lower.contains("bad rule")
    {
        KernelErrorKind::NotFound
    } else if lower.contains("in use")
        || lower.contains("too many links")
        || lower.contains("directory not empty")
        || lower.contains("resource busy")
    {
        KernelErrorKind::Busy
    } else if lower.contains("already exists") || lower.contains("file exists") {
        KernelErrorKind::Exists
    } else {
        KernelErrorKind::Other
    }
}

//! tpgate: transparent proxy gateway rule engine
//!
//! This crate turns a small declarative policy into kernel state on a Linux
//! router: address sets, packet classification rules and a policy route
//! that hand selected traffic to a local proxy and DNS resolver, leaving
//! everything else untouched.
//!
//! # Features
//!
//! - **Three modes**: global, gfwlist and chnroute classification
//! - **Both families**: independent IPv4 and IPv6 rule sets
//! - **Two TCP strategies**: TPROXY marking or connection NAT
//! - **Idempotent lifecycle**: start-while-started and stop-while-stopped
//!   are safe; "started" is probed from the kernel, never trusted from disk
//! - **Fail-safe**: while stopped, LAN DNS is sent to a direct resolver
//!
//! # Architecture
//!
//! ```text
//! Config → Policy ─┬→ sets      (ipset allow/deny, tmp + swap)
//!                  ├→ routing   (fwmark rule, local route table)
//!                  └→ compiler  (mangle/nat chains) → Netfilter
//!                        ↑
//!                   lifecycle   (start / stop / restart / status)
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use tpgate::config::load_config;
//! use tpgate::kernel::SystemKernel;
//! use tpgate::lifecycle::Lifecycle;
//! use tpgate::process::SystemProcesses;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/tpgate/config.json")?;
//! let kernel = SystemKernel::new();
//! let processes = SystemProcesses::new();
//!
//! let engine = Lifecycle::new(&config, &kernel, &processes)?;
//! engine.start()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`policy`]: Resolved policy model
//! - [`sets`]: Address-set membership building
//! - [`routing`]: Mark-based policy routing
//! - [`compiler`]: Rule compilation and installation
//! - [`kernel`]: Kernel backends (iptables, ipset, ip, sysctl)
//! - [`process`]: External process control
//! - [`lifecycle`]: Start/stop state machine
//! - [`error`]: Error types

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod backoff;
pub mod compiler;
pub mod config;
pub mod error;
pub mod exec;
pub mod kernel;
pub mod lifecycle;
pub mod lock;
pub mod policy;
pub mod process;
pub mod routing;
pub mod sets;

// Re-export commonly used types at the crate root
pub use compiler::{compile, compile_failsafe, RulePlan};
pub use config::Config;
pub use error::{ApplyError, ConfigError, EnvironmentError, ProcessError, TeardownError, TpgateError};
pub use kernel::{Kernel, MemoryKernel, SystemKernel};
pub use lifecycle::{Lifecycle, LifecycleState, RuntimeFacts};
pub use policy::{Family, Mode, Policy};
pub use process::{MemoryProcesses, SystemProcesses};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Whether the process runs with effective uid 0
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions
    unsafe { libc::geteuid() == 0 }
}

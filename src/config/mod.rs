//! Configuration module for tpgate
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use tpgate::config::load_config;
//!
//! let config = load_config("/etc/tpgate/config.json").unwrap();
//! println!("Mode: {}", config.mode);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    Config, DnsBackend, DnsConfig, HooksConfig, ListsConfig, LogConfig, NatConfig, PortSpec,
    ProxyConfig, RuntimeConfig,
};

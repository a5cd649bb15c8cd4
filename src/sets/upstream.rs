//! Upstream endpoint handling
//!
//! Proxy servers and DNS upstreams are configured as
//! `[scheme://][user@]host[#port][/path]`; only the host matters for set
//! membership.

use std::io;
use std::net::{IpAddr, ToSocketAddrs};

use tracing::warn;

/// Extract the host part of an endpoint string.
#[must_use]
pub fn upstream_host(endpoint: &str) -> &str {
    let mut host = endpoint.trim();
    if let Some(idx) = host.find("://") {
        host = &host[idx + 3..];
    }
    if let Some(idx) = host.find('/') {
        host = &host[..idx];
    }
    if let Some(idx) = host.rfind('@') {
        host = &host[idx + 1..];
    }
    if let Some(idx) = host.find('#') {
        host = &host[..idx];
    }
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Name resolution used for non-literal upstream hosts
pub trait HostResolver {
    /// All addresses of `host`.
    ///
    /// # Errors
    ///
    /// Returns the resolver failure.
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the system (libc) resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        Ok((host, 0).to_socket_addrs()?.map(|sa| sa.ip()).collect())
    }
}

/// Addresses of one endpoint. Literal addresses skip resolution.
///
/// # Errors
///
/// Returns the resolver failure for non-literal hosts.
pub fn resolve_upstream(endpoint: &str, resolver: &dyn HostResolver) -> io::Result<Vec<IpAddr>> {
    let host = upstream_host(endpoint);
    if host.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty host"));
    }
    match host.parse::<IpAddr>() {
        Ok(addr) => Ok(vec![addr]),
        Err(_) => resolver.resolve(host),
    }
}

/// Resolve a list of endpoints, skipping (with a warning) any that fail.
pub fn resolve_all(endpoints: &[String], resolver: &dyn HostResolver) -> Vec<IpAddr> {
    let mut out = Vec::new();
    for endpoint in endpoints {
        match resolve_upstream(endpoint, resolver) {
            Ok(addrs) => out.extend(addrs),
            Err(e) => warn!("Cannot resolve upstream '{}': {}", endpoint, e),
        }
    }
    out
}

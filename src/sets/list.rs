//! List file parsing
//!
//! Two formats are accepted:
//!
//! - Extension lists, where each line carries a marker: `-` for an IPv4
//!   prefix, `~` for an IPv6 prefix, `@` for a domain handed to the resolver.
//! - Route lists, one bare CIDR per line (the national route tables).
//!
//! Blank lines and `#` comments are skipped in both. A bare address is taken
//! as a host prefix.

use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::Path;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::ConfigError;
use crate::policy::Family;

/// Parsed contents of an extension list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListEntries {
    /// IPv4 prefixes
    pub v4: Vec<Ipv4Net>,
    /// IPv6 prefixes
    pub v6: Vec<Ipv6Net>,
    /// Domains for the resolver
    pub domains: Vec<String>,
}

impl ListEntries {
    /// Prefixes of one family
    #[must_use]
    pub fn prefixes(&self, family: Family) -> Vec<IpNet> {
        match family {
            Family::V4 => self.v4.iter().copied().map(IpNet::V4).collect(),
            Family::V6 => self.v6.iter().copied().map(IpNet::V6).collect(),
        }
    }

    /// Whether nothing was parsed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty() && self.domains.is_empty()
    }
}

fn parse_prefix(s: &str) -> Option<IpNet> {
    s.parse::<IpNet>()
        .ok()
        .or_else(|| s.parse::<IpAddr>().ok().map(IpNet::from))
        .map(|net| net.trunc())
}

fn content_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

/// Parse a marker-tagged extension list.
///
/// # Errors
///
/// Returns `ConfigError::ListEntry` naming the offending line.
pub fn parse_list_file(source: &str, text: &str) -> Result<ListEntries, ConfigError> {
    let mut entries = ListEntries::default();

    for (lineno, line) in content_lines(text) {
        let mut chars = line.chars();
        let marker = chars.next().unwrap_or_default();
        let value = chars.as_str().trim();

        match marker {
            '-' => match parse_prefix(value) {
                Some(IpNet::V4(net)) => entries.v4.push(net),
                _ => return Err(ConfigError::list_entry(source, lineno, format!("'{value}' is not an IPv4 prefix"))),
            },
            '~' => match parse_prefix(value) {
                Some(IpNet::V6(net)) => entries.v6.push(net),
                _ => return Err(ConfigError::list_entry(source, lineno, format!("'{value}' is not an IPv6 prefix"))),
            },
            '@' => {
                if value.is_empty() || value.contains(char::is_whitespace) {
                    return Err(ConfigError::list_entry(source, lineno, "empty or malformed domain"));
                }
                entries.domains.push(value.trim_end_matches('.').to_ascii_lowercase());
            }
            other => {
                return Err(ConfigError::list_entry(
                    source,
                    lineno,
                    format!("unknown marker '{other}' (expected '-', '~' or '@')"),
                ))
            }
        }
    }

    Ok(entries)
}

/// Parse a bulk route list of bare CIDRs belonging to `family`.
///
/// # Errors
///
/// Returns `ConfigError::ListEntry` for malformed or wrong-family lines.
pub fn parse_route_list(source: &str, text: &str, family: Family) -> Result<Vec<IpNet>, ConfigError> {
    let mut prefixes = Vec::new();
    for (lineno, line) in content_lines(text) {
        let Some(net) = parse_prefix(line) else {
            return Err(ConfigError::list_entry(source, lineno, format!("'{line}' is not a prefix")));
        };
        if Family::of(&net.addr()) != family {
            return Err(ConfigError::list_entry(
                source,
                lineno,
                format!("'{line}' is not an {family} prefix"),
            ));
        }
        prefixes.push(net);
    }
    Ok(prefixes)
}

/// Read a list file. Missing optional files read as empty.
///
/// # Errors
///
/// Returns `ConfigError::MissingListFile` when a required file is absent.
pub fn read_list(path: &Path, required: bool) -> Result<String, ConfigError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if required {
                Err(ConfigError::MissingListFile {
                    path: path.display().to_string(),
                })
            } else {
                Ok(String::new())
            }
        }
        Err(e) => Err(ConfigError::IoError(e)),
    }
}

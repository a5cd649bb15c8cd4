//! Advisory on-disk record
//!
//! Written after a successful start, removed before every stop. It carries
//! what the kernel cannot tell us (the resolver pid, hook fields) and is
//! only consulted when the kernel probe already says "started".
//!
//! ```text
//! # tpgate runtime record
//! resolver_pid=4242
//! mode=chnroute
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;

const RESOLVER_PID: &str = "resolver_pid";

/// Key/value data persisted between invocations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvisoryRecord {
    /// Pid of the resolver started by this engine
    pub resolver_pid: Option<u32>,
    /// Auxiliary fields (mode, hook contributions)
    pub fields: BTreeMap<String, String>,
}

impl AdvisoryRecord {
    /// Parse `key=value` lines; blank lines and `#` comments are skipped.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut record = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                debug!("Ignoring malformed record line: {}", line);
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key == RESOLVER_PID {
                record.resolver_pid = value.parse().ok();
            } else if !key.is_empty() {
                record.fields.insert(key.to_string(), value.to_string());
            }
        }
        record
    }

    /// Serialize to `key=value` lines
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from("# tpgate runtime record\n");
        if let Some(pid) = self.resolver_pid {
            out.push_str(&format!("{RESOLVER_PID}={pid}\n"));
        }
        for (key, value) in &self.fields {
            out.push_str(&format!("{key}={value}\n"));
        }
        out
    }

    /// Read the record, `None` if there is none.
    ///
    /// # Errors
    ///
    /// Returns I/O errors other than `NotFound`.
    pub fn load(path: &Path) -> io::Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(Self::parse(&text))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write the record atomically (temporary file, then rename).
    ///
    /// # Errors
    ///
    /// Returns the I/O error of directory creation, write or rename.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        fs::write(&tmp, self.render())?;
        fs::rename(&tmp, path)
    }

    /// Delete the record; a missing file is fine.
    ///
    /// # Errors
    ///
    /// Returns I/O errors other than `NotFound`.
    pub fn remove(path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record() {
        let record = AdvisoryRecord::parse("# header\nresolver_pid=4242\nmode = gfwlist\n\nbogus\n");
        assert_eq!(record.resolver_pid, Some(4242));
        assert_eq!(record.fields.get("mode").map(String::as_str), Some("gfwlist"));
        assert_eq!(record.fields.len(), 1);
    }

    #[test]
    fn test_unparseable_pid_is_absent() {
        let record = AdvisoryRecord::parse("resolver_pid=abc\n");
        assert_eq!(record.resolver_pid, None);
    }

    #[test]
    fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("state");
        assert_eq!(AdvisoryRecord::load(&path).unwrap(), None);

        let mut record = AdvisoryRecord {
            resolver_pid: Some(7),
            ..Default::default()
        };
        record.fields.insert("mode".into(), "global".into());
        record.save(&path).unwrap();
        assert_eq!(AdvisoryRecord::load(&path).unwrap(), Some(record));

        AdvisoryRecord::remove(&path).unwrap();
        AdvisoryRecord::remove(&path).unwrap();
        assert!(!path.exists());
    }
}

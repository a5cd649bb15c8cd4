//! Reading the configuration file
//!
//! Relative list and runtime paths in the file are taken relative to the
//! directory holding the file, so a config and its lists can be shipped
//! together.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

const ENV_MODE: &str = "TPGATE_MODE";
const ENV_LOG_LEVEL: &str = "TPGATE_LOG_LEVEL";
const ENV_LOG_FORMAT: &str = "TPGATE_LOG_FORMAT";
const ENV_RECORD_PATH: &str = "TPGATE_RECORD_PATH";

fn parse(json: &str, origin: &str) -> Result<Config, ConfigError> {
    serde_json::from_str(json).map_err(|e| ConfigError::ParseError(format!("{origin}: {e}")))
}

fn anchor(path: &mut PathBuf, base: &Path) {
    if path.is_relative() && !path.as_os_str().is_empty() {
        *path = base.join(&*path);
    }
}

/// Rebase every relative path of `config` onto `base`
fn anchor_paths(config: &mut Config, base: &Path) {
    let lists = &mut config.lists;
    for path in [&mut lists.gfwlist, &mut lists.chnlist, &mut lists.chnroute, &mut lists.chnroute6] {
        anchor(path, base);
    }
    for path in [lists.allow_ext.as_mut(), lists.deny_ext.as_mut()].into_iter().flatten() {
        anchor(path, base);
    }
    if let Some(log_file) = config.dns.log_file.as_mut() {
        anchor(log_file, base);
    }
    let runtime = &mut config.runtime;
    for path in [&mut runtime.record_path, &mut runtime.work_dir, &mut runtime.lock_path] {
        anchor(path, base);
    }
}

/// Load and validate a configuration file.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    debug!("Loading configuration from {}", path.display());

    let contents = fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ConfigError::FileNotFound {
            path: path.display().to_string(),
        },
        _ => ConfigError::from(e),
    })?;

    let mut config = parse(&contents, &path.display().to_string())?;
    if let Some(base) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        anchor_paths(&mut config, base);
    }
    config.validate()?;

    info!(
        "Configuration loaded: mode={}, strategy={}, ipv4={}, ipv6={}",
        config.mode, config.strategy, config.ipv4, config.ipv6
    );
    Ok(config)
}

/// Parse and validate a configuration held in memory. Paths stay as written.
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config = parse(json, "<string>")?;
    config.validate()?;
    Ok(config)
}

/// [`load_config`], then apply overrides from the environment:
///
/// - `TPGATE_MODE`: classification mode
/// - `TPGATE_LOG_LEVEL`, `TPGATE_LOG_FORMAT`: logging
/// - `TPGATE_RECORD_PATH`: advisory record location
///
/// # Errors
///
/// Returns `ConfigError` if loading fails or an override is invalid.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env(&mut config, |name| env::var(name).ok())?;
    Ok(config)
}

fn apply_env(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    if let Some(mode) = lookup(ENV_MODE) {
        config.mode = mode.parse().map_err(|_| ConfigError::EnvError {
            name: ENV_MODE.into(),
            reason: format!("Invalid mode: {mode}"),
        })?;
        debug!("Mode overridden to {}", config.mode);
    }
    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        config.log.level = level;
    }
    if let Some(format) = lookup(ENV_LOG_FORMAT) {
        config.log.format = format;
    }
    if let Some(path) = lookup(ENV_RECORD_PATH) {
        config.runtime.record_path = path.into();
    }
    config.validate()
}

/// Write the default configuration to `path`.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let json = serde_json::to_string_pretty(&Config::default_config())
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Mode;

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config("/nonexistent/path/tpgate.json");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_load_config_str_minimal() {
        let json = r#"{
            "mode": "gfwlist",
            "proxy": { "start_cmd": "ss-redir -c /etc/ss.json -f /run/ss.pid" },
            "dns": {}
        }"#;
        let config = load_config_str(json).unwrap();
        assert_eq!(config.mode, Mode::Gfwlist);
        assert!(config.ipv4);
        assert!(!config.ipv6);
        assert_eq!(config.proxy.group, "proxy");
        assert_eq!(config.dns.group, "proxy_dns");
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let json = r#"{ "mode": "whitelist", "proxy": {}, "dns": {} }"#;
        assert!(matches!(load_config_str(json), Err(ConfigError::ParseError(_))));
        assert!(matches!(load_config_str("not json"), Err(ConfigError::ParseError(_))));
        let missing_mode = r#"{ "proxy": {}, "dns": {} }"#;
        assert!(matches!(load_config_str(missing_mode), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_relative_paths_follow_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tpgate.json");
        fs::write(
            &path,
            r#"{
                "mode": "chnroute",
                "proxy": {},
                "dns": {},
                "lists": { "chnroute": "lists/chnroute.txt", "gfwlist": "/srv/gfwlist.txt" }
            }"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.lists.chnroute, dir.path().join("lists/chnroute.txt"));
        assert_eq!(config.lists.gfwlist, PathBuf::from("/srv/gfwlist.txt"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default_config();
        let env = |name: &str| match name {
            ENV_MODE => Some("global".to_string()),
            ENV_LOG_FORMAT => Some("json".to_string()),
            _ => None,
        };
        apply_env(&mut config, env).unwrap();
        assert_eq!(config.mode, Mode::Global);
        assert_eq!(config.log.format, "json");

        let bad = |name: &str| (name == ENV_MODE).then(|| "bogus".to_string());
        assert!(matches!(
            apply_env(&mut config, bad),
            Err(ConfigError::EnvError { .. })
        ));
    }

    #[test]
    fn test_create_default_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tpgate.json");
        create_default_config(&path).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.route_table, 233);
    }
}

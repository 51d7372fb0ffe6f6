//! Configuration system for tlsprobe
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Shape validation (existence of libraries is checked later, by each module)
//! - Assembly of the effective per-module configuration

use crate::probe::ProcessFilter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// What the orchestrator does when one module fails validation or init
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPolicy {
    /// Abort the whole session
    #[default]
    FailFast,
    /// Skip the failing module and run the rest
    BestEffort,
}

impl FromStr for SessionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fail-fast" | "failfast" | "strict" => Ok(SessionPolicy::FailFast),
            "best-effort" | "besteffort" | "lenient" => Ok(SessionPolicy::BestEffort),
            other => Err(ConfigError::ValidationError(format!(
                "Invalid session policy: {}. Must be one of: fail-fast, best-effort",
                other
            ))),
        }
    }
}

/// Complete session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Global settings shared by every module
    pub session: SessionSettings,

    /// Module-specific settings keyed by module name
    pub modules: BTreeMap<String, LibrarySettings>,

    /// Output settings
    pub output: OutputSettings,
}

/// Session-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// Target process id (0 = all processes)
    pub pid: u32,

    /// Debug verbosity
    pub debug: bool,

    /// Render payloads as hex
    pub hex_output: bool,

    /// Failure policy
    pub policy: SessionPolicy,

    /// Unread records buffered per module before the oldest is dropped
    pub transport_capacity: usize,

    /// Upper bound on a single wait for transport records
    pub poll_interval_ms: u64,

    /// Records handled between cancellation checks
    pub batch_size: usize,

    /// Payload bytes kept per event
    pub max_payload: usize,

    /// Modules to run, in declaration order
    pub modules: Vec<String>,

    /// Compiled kernel-side probe object
    pub ebpf_object: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            pid: 0,
            debug: false,
            hex_output: false,
            policy: SessionPolicy::FailFast,
            transport_capacity: crate::transport::DEFAULT_CAPACITY,
            poll_interval_ms: 100,
            batch_size: 64,
            max_payload: crate::events::MAX_DATA_LEN,
            modules: vec![
                "openssl".to_string(),
                "gnutls".to_string(),
                "nspr".to_string(),
            ],
            ebpf_object: None,
        }
    }
}

/// Per-library settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibrarySettings {
    /// Explicit shared object path, bypasses discovery
    pub library: Option<PathBuf>,

    /// Binary whose dynamic dependencies point at the library (curl, wget, firefox)
    pub hint_binary: Option<PathBuf>,

    /// Extra directories searched before the system defaults
    pub search_dirs: Vec<PathBuf>,
}

/// Output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Print events to stdout
    pub console: bool,

    /// Append events as JSON lines to this file
    pub jsonl: Option<PathBuf>,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            console: true,
            jsonl: None,
        }
    }
}

/// Global fields handed to every module
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalConfig {
    pub pid: u32,
    pub debug: bool,
    pub hex_output: bool,
    pub transport_capacity: usize,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_payload: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        SessionSettings::default().global()
    }
}

impl GlobalConfig {
    pub fn process_filter(&self) -> ProcessFilter {
        ProcessFilter::from_pid(self.pid)
    }
}

/// Effective configuration of one module: global fields plus its own
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleConfig {
    pub name: String,
    pub global: GlobalConfig,
    pub library: Option<PathBuf>,
    pub hint_binary: Option<PathBuf>,
    pub search_dirs: Vec<PathBuf>,
}

impl ModuleConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            global: GlobalConfig::default(),
            library: None,
            hint_binary: None,
            search_dirs: Vec::new(),
        }
    }

    pub fn with_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.library = Some(path.into());
        self
    }

    pub fn with_hint_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.hint_binary = Some(path.into());
        self
    }

    pub fn with_global(mut self, global: GlobalConfig) -> Self {
        self.global = global;
        self
    }
}

impl SessionSettings {
    pub fn global(&self) -> GlobalConfig {
        GlobalConfig {
            pid: self.pid,
            debug: self.debug,
            hex_output: self.hex_output,
            transport_capacity: self.transport_capacity,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            batch_size: self.batch_size,
            max_payload: self.max_payload,
        }
    }
}

impl SessionConfig {
    /// Assemble the effective config of a module
    pub fn module_config(&self, name: &str) -> ModuleConfig {
        let settings = self.modules.get(name).cloned().unwrap_or_default();
        ModuleConfig {
            name: name.to_string(),
            global: self.session.global(),
            library: settings.library,
            hint_binary: settings.hint_binary,
            search_dirs: settings.search_dirs,
        }
    }

    /// Settings of a module, created empty if missing
    pub fn library_mut(&mut self, name: &str) -> &mut LibrarySettings {
        self.modules.entry(name.to_string()).or_default()
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. TLSPROBE_CONFIG environment variable
    /// 3. ~/.config/tlsprobe/config.toml
    /// 4. /etc/tlsprobe/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<SessionConfig> {
        let mut config = match self.find_config_file()? {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                self.load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                SessionConfig::default()
            }
        };

        apply_overrides(&mut config, |key| std::env::var(key).ok());
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> ConfigResult<Option<PathBuf>> {
        // An explicit path that does not exist is an error, not a fallback
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::NotFound(path.clone()));
        }

        if let Ok(env_path) = std::env::var("TLSPROBE_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok(Some(path));
            }
            warn!("TLSPROBE_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Ok(Some(path));
            }
        }

        let system = PathBuf::from("/etc/tlsprobe/config.toml");
        if system.exists() {
            return Ok(Some(system));
        }

        Ok(None)
    }

    /// Load configuration from a TOML file
    fn load_from_file(&self, path: &Path) -> ConfigResult<SessionConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate the shape of the configuration
    pub fn validate(&self, config: &SessionConfig) -> ConfigResult<()> {
        let session = &config.session;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&session.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                session.log_level, valid_levels
            )));
        }

        if session.transport_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "transport_capacity must be greater than 0".to_string(),
            ));
        }

        if session.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if session.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if session.max_payload == 0 || session.max_payload > crate::events::MAX_DATA_LEN {
            return Err(ConfigError::ValidationError(format!(
                "max_payload must be between 1 and {}",
                crate::events::MAX_DATA_LEN
            )));
        }

        if session.modules.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one module must be configured".to_string(),
            ));
        }

        for (name, settings) in &config.modules {
            if settings.library.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
                return Err(ConfigError::ValidationError(format!(
                    "modules.{}.library must not be empty",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tlsprobe").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `TLSPROBE_*` overrides looked up through `lookup`
pub fn apply_overrides<F>(config: &mut SessionConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("TLSPROBE_LOG_LEVEL") {
        config.session.log_level = val;
    }
    if let Some(val) = lookup("TLSPROBE_PID") {
        match val.parse() {
            Ok(pid) => config.session.pid = pid,
            Err(_) => warn!("Ignoring TLSPROBE_PID={}: not a pid", val),
        }
    }
    if let Some(val) = lookup("TLSPROBE_DEBUG") {
        config.session.debug = val.parse().unwrap_or(config.session.debug);
    }
    if let Some(val) = lookup("TLSPROBE_HEX") {
        config.session.hex_output = val.parse().unwrap_or(config.session.hex_output);
    }
    if let Some(val) = lookup("TLSPROBE_POLICY") {
        match val.parse() {
            Ok(policy) => config.session.policy = policy,
            Err(e) => warn!("Ignoring TLSPROBE_POLICY: {}", e),
        }
    }
    if let Some(val) = lookup("TLSPROBE_EBPF_OBJECT") {
        config.session.ebpf_object = Some(PathBuf::from(val));
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.session.log_level, "info");
        assert_eq!(config.session.pid, 0);
        assert_eq!(config.session.policy, SessionPolicy::FailFast);
        assert_eq!(config.session.modules, vec!["openssl", "gnutls", "nspr"]);
        assert!(config.output.console);
        assert!(ConfigLoader::new().validate(&config).is_ok());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
            [session]
            log_level = "debug"
            pid = 4242
            hex_output = true
            policy = "best-effort"
            transport_capacity = 32
            modules = ["openssl", "nspr"]

            [modules.openssl]
            library = "/opt/ssl/lib/libssl.so.3"

            [modules.nspr]
            hint_binary = "/usr/lib/firefox/firefox"
            search_dirs = ["/usr/lib/firefox"]

            [output]
            console = false
            jsonl = "/tmp/tlsprobe.jsonl"
        "#;

        let config: SessionConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.session.pid, 4242);
        assert!(config.session.hex_output);
        assert_eq!(config.session.policy, SessionPolicy::BestEffort);
        assert_eq!(config.session.transport_capacity, 32);
        assert_eq!(config.session.modules, vec!["openssl", "nspr"]);
        assert!(!config.output.console);
        assert_eq!(
            config.output.jsonl.as_deref(),
            Some(Path::new("/tmp/tlsprobe.jsonl"))
        );

        let openssl = config.module_config("openssl");
        assert_eq!(
            openssl.library.as_deref(),
            Some(Path::new("/opt/ssl/lib/libssl.so.3"))
        );
        assert_eq!(openssl.global.pid, 4242);
        assert!(openssl.global.hex_output);
        assert_eq!(openssl.global.transport_capacity, 32);

        let nspr = config.module_config("nspr");
        assert!(nspr.library.is_none());
        assert_eq!(
            nspr.hint_binary.as_deref(),
            Some(Path::new("/usr/lib/firefox/firefox"))
        );
        assert_eq!(nspr.search_dirs, vec![PathBuf::from("/usr/lib/firefox")]);
    }

    #[test]
    fn test_unconfigured_module_gets_globals_only() {
        let mut config = SessionConfig::default();
        config.session.debug = true;
        let gnutls = config.module_config("gnutls");
        assert_eq!(gnutls.name, "gnutls");
        assert!(gnutls.global.debug);
        assert!(gnutls.library.is_none());
        assert!(gnutls.hint_binary.is_none());
    }

    #[test]
    fn test_validation_rejects_bad_shapes() {
        let loader = ConfigLoader::new();

        let mut config = SessionConfig::default();
        config.session.log_level = "loud".into();
        assert!(loader.validate(&config).is_err());

        let mut config = SessionConfig::default();
        config.session.transport_capacity = 0;
        assert!(loader.validate(&config).is_err());

        let mut config = SessionConfig::default();
        config.session.max_payload = crate::events::MAX_DATA_LEN + 1;
        assert!(loader.validate(&config).is_err());

        let mut config = SessionConfig::default();
        config.session.modules.clear();
        assert!(loader.validate(&config).is_err());

        let mut config = SessionConfig::default();
        config.library_mut("openssl").library = Some(PathBuf::new());
        assert!(loader.validate(&config).is_err());
    }

    #[test]
    fn test_validation_does_not_touch_library_paths() {
        let mut config = SessionConfig::default();
        config.library_mut("openssl").library = Some(PathBuf::from("/does/not/exist.so"));
        assert!(ConfigLoader::new().validate(&config).is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TLSPROBE_PID", "77"),
            ("TLSPROBE_HEX", "true"),
            ("TLSPROBE_POLICY", "best-effort"),
            ("TLSPROBE_EBPF_OBJECT", "/opt/tlsprobe/probe.o"),
        ]
        .into_iter()
        .collect();

        let mut config = SessionConfig::default();
        apply_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.session.pid, 77);
        assert!(config.session.hex_output);
        assert_eq!(config.session.policy, SessionPolicy::BestEffort);
        assert_eq!(
            config.session.ebpf_object.as_deref(),
            Some(Path::new("/opt/tlsprobe/probe.o"))
        );
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let mut config = SessionConfig::default();
        apply_overrides(&mut config, |k| match k {
            "TLSPROBE_PID" => Some("not-a-pid".to_string()),
            "TLSPROBE_POLICY" => Some("whatever".to_string()),
            _ => None,
        });
        assert_eq!(config.session.pid, 0);
        assert_eq!(config.session.policy, SessionPolicy::FailFast);
    }

    #[test]
    fn test_missing_cli_config_is_an_error() {
        let loader = ConfigLoader::new().with_cli_path(Some(PathBuf::from(
            "/nonexistent/tlsprobe/config.toml",
        )));
        assert!(matches!(loader.load(), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_from_cli_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nlog_level = \"warn\"\n").unwrap();

        let config = ConfigLoader::new()
            .with_cli_path(Some(path))
            .load()
            .unwrap();
        assert_eq!(config.session.log_level, "warn");
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("fail-fast".parse::<SessionPolicy>().unwrap(), SessionPolicy::FailFast);
        assert_eq!("best-effort".parse::<SessionPolicy>().unwrap(), SessionPolicy::BestEffort);
        assert!("maybe".parse::<SessionPolicy>().is_err());
    }

    #[test]
    fn test_serialize_config() {
        let config = SessionConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[session]"));
        assert!(toml_str.contains("policy = \"fail-fast\""));
    }
}

//! TOML configuration for checkrun.
//!
//! Layered lookup: an explicit path, then the `CHECKRUN_CONFIG` environment
//! variable, then `/etc/checkrun/checkrun.toml`, then compiled-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::checks::Suite;

const SYSTEM_CONFIG_PATH: &str = "/etc/checkrun/checkrun.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub external: Vec<ExternalCheckConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("target.base_url must start with http:// or https:// (got '{0}')")]
    BadBaseUrl(String),

    #[error("{0} must be greater than 0")]
    Zero(&'static str),

    #[error("external check '{name}' names unknown suite '{suite}'")]
    UnknownSuite { name: String, suite: String },
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.apply_env();
        config.validate()?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration: `explicit` if given (errors are fatal),
    /// otherwise `CHECKRUN_CONFIG`, the system path, then defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var("CHECKRUN_CONFIG") {
            let path = PathBuf::from(&env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "CHECKRUN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(password) = std::env::var("CHECKRUN_AUTH_PASSWORD") {
            self.auth.password = Some(password);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.target.base_url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::BadBaseUrl(url.clone()));
        }
        if self.target.request_timeout_secs == 0 {
            return Err(ConfigError::Zero("target.request_timeout_secs"));
        }
        if self.runner.run_timeout_secs == 0 {
            return Err(ConfigError::Zero("runner.run_timeout_secs"));
        }
        if self.runner.cancel_grace_secs == 0 {
            return Err(ConfigError::Zero("runner.cancel_grace_secs"));
        }
        if self.runner.max_parallel_checks == 0 {
            return Err(ConfigError::Zero("runner.max_parallel_checks"));
        }
        if self.auth.cache_ttl_secs == 0 {
            return Err(ConfigError::Zero("auth.cache_ttl_secs"));
        }
        for ext in &self.external {
            match ext.suite.parse::<Suite>() {
                Ok(suite) if suite != Suite::All => {}
                _ => {
                    return Err(ConfigError::UnknownSuite {
                        name: ext.name.clone(),
                        suite: ext.suite.clone(),
                    })
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the administrative HTTP API listens on.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "data/checkrun.db".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// The live system checks are executed against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub base_url: String,
    /// Per-request timeout applied by the shared HTTP client.
    pub request_timeout_secs: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl TargetConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Credentials used to obtain the bearer token handed to checks.
///
/// When `static_token` is set it is used verbatim and no login happens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub login_path: String,
    pub email: Option<String>,
    pub password: Option<String>,
    pub static_token: Option<String>,
    /// How long an acquired token is reused. Keep it below the real expiry.
    pub cache_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            login_path: "/api/v1/auth/login".to_string(),
            email: None,
            password: None,
            static_token: None,
            cache_ttl_secs: 50 * 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Hard ceiling on a run's execution, independent of any caller.
    pub run_timeout_secs: u64,
    /// How long `cancel` waits for a run to wind down.
    pub cancel_grace_secs: u64,
    /// Upper bound on simultaneously executing checks in parallel mode.
    pub max_parallel_checks: usize,
    /// Number of log lines returned with a run's detail.
    pub log_tail: u32,
    /// Budget used by the built-in latency checks.
    pub latency_budget_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: 30 * 60,
            cancel_grace_secs: 10,
            max_parallel_checks: 8,
            log_tail: 100,
            latency_budget_ms: 1500,
        }
    }
}

impl RunnerConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

// ---------------------------------------------------------------------------
// External checks
// ---------------------------------------------------------------------------

/// A check implemented by an external program (e.g. a browser-automation
/// runner). Exit status 0 passes; anything else fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalCheckConfig {
    pub suite: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = Config::default();

        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert_eq!(cfg.storage.db_path, "data/checkrun.db");
        assert_eq!(cfg.target.base_url, "http://localhost:3000");
        assert_eq!(cfg.target.request_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.auth.login_path, "/api/v1/auth/login");
        assert_eq!(cfg.auth.cache_ttl_secs, 3000);
        assert_eq!(cfg.runner.run_timeout(), Duration::from_secs(1800));
        assert_eq!(cfg.runner.cancel_grace(), Duration::from_secs(10));
        assert_eq!(cfg.runner.max_parallel_checks, 8);
        assert_eq!(cfg.runner.log_tail, 100);
        assert!(cfg.external.is_empty());
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[server]
bind = "127.0.0.1:9000"

[storage]
db_path = "/var/lib/checkrun/runs.db"

[target]
base_url = "https://staging.example.com"
request_timeout_secs = 5

[auth]
email = "qa@example.com"
password = "hunter2"
cache_ttl_secs = 600

[runner]
run_timeout_secs = 900
cancel_grace_secs = 3
max_parallel_checks = 2

[[external]]
suite = "accessibility"
name = "a11y-wcag-compliance"
description = "WCAG 2.1 AA via axe-core"
program = "npx"
args = ["playwright", "test", "a11y-wcag-compliance.spec.ts"]
working_dir = "/opt/frontend"

[logging]
level = "debug"
json = true
"#;

        let cfg: Config = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        assert_eq!(cfg.storage.db_path, "/var/lib/checkrun/runs.db");
        assert_eq!(cfg.target.base_url, "https://staging.example.com");
        assert_eq!(cfg.target.request_timeout_secs, 5);
        assert_eq!(cfg.auth.email.as_deref(), Some("qa@example.com"));
        assert_eq!(cfg.auth.password.as_deref(), Some("hunter2"));
        assert_eq!(cfg.auth.login_path, "/api/v1/auth/login");
        assert_eq!(cfg.auth.cache_ttl_secs, 600);
        assert_eq!(cfg.runner.run_timeout_secs, 900);
        assert_eq!(cfg.runner.cancel_grace_secs, 3);
        assert_eq!(cfg.runner.max_parallel_checks, 2);
        assert_eq!(cfg.runner.log_tail, 100);
        assert_eq!(cfg.external.len(), 1);
        assert_eq!(cfg.external[0].args.len(), 3);
        assert_eq!(
            cfg.external[0].working_dir,
            Some(PathBuf::from("/opt/frontend"))
        );
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        let defaults = Config::default();
        assert_eq!(cfg.server.bind, defaults.server.bind);
        assert_eq!(cfg.runner.max_parallel_checks, defaults.runner.max_parallel_checks);
        assert_eq!(cfg.target.base_url, defaults.target.base_url);
    }

    #[test]
    fn test_validation() {
        let mut cfg = Config::default();
        cfg.target.base_url = "localhost:3000".to_string();
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::BadBaseUrl("localhost:3000".to_string()))
        );

        let mut cfg = Config::default();
        cfg.runner.max_parallel_checks = 0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::Zero("runner.max_parallel_checks"))
        );

        let mut cfg = Config::default();
        cfg.external.push(ExternalCheckConfig {
            suite: "all".to_string(),
            name: "x".to_string(),
            description: String::new(),
            program: "true".to_string(),
            args: vec![],
            working_dir: None,
        });
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownSuite { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkrun.toml");
        std::fs::write(&path, "[runner]\nlog_tail = 20\n").unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.runner.log_tail, 20);

        std::fs::write(&path, "[runner]\nmax_parallel_checks = 0\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}

use crate::error::{Result, ServiceError};
use crate::format::secs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const MIN_STATS_PERIOD: Duration = Duration::from_millis(100);
const MIN_GRACEFUL_EXIT: Duration = Duration::from_secs(1);
const DEFAULT_VERSION: &str = "0.0.0";

/// Settings of a single service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServiceConfig {
    pub name: String,
    pub description: String,
    /// Broker path tasks are pulled from.
    pub path: String,
    /// Number of pull workers.
    pub pulls: usize,
    #[serde(with = "secs")]
    pub pull_timeout: Duration,
    /// Cap on pulled-but-unfinished tasks.
    pub max_threads: usize,
    /// Period of the stats log. Zero disables it.
    #[serde(with = "secs")]
    pub stats_period: Duration,
    #[serde(with = "secs")]
    pub graceful_exit: Duration,
    pub testing: bool,
    pub version: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            name: "service".to_string(),
            description: String::new(),
            path: String::new(),
            pulls: 1,
            pull_timeout: Duration::from_secs(3600),
            max_threads: 4,
            stats_period: Duration::from_secs(300),
            graceful_exit: Duration::from_secs(20),
            testing: false,
            version: DEFAULT_VERSION.to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        ServiceConfig {
            name: name.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn set_version(&mut self, major: u32, minor: u32, patch: u32) {
        self.version = format!("{}.{}.{}", major, minor, patch);
    }

    /// Clamp values into their usable ranges. Afterwards `max_threads >= pulls >= 1`.
    pub fn normalize(&mut self) {
        self.pulls = self.pulls.max(1);
        self.max_threads = self.max_threads.max(1).max(self.pulls);
        if !self.stats_period.is_zero() && self.stats_period < MIN_STATS_PERIOD {
            self.stats_period = MIN_STATS_PERIOD;
        }
        if self.graceful_exit < MIN_GRACEFUL_EXIT {
            self.graceful_exit = MIN_GRACEFUL_EXIT;
        }
        if self.version.is_empty() {
            self.version = DEFAULT_VERSION.to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(ServiceError::invalid(
                format!("services.{}.path", self.name),
                "must not be empty",
            ));
        }
        Ok(())
    }
}

/// Config file: server-wide defaults plus one entry per service.
///
/// ```yaml
/// server:
///   url: tcp://localhost:1717
///   user: root
///   pass: root
///   log-level: debug
///   pulls: 2
/// services:
///   fibsrv:
///     path: test.fibsrv
///     max-threads: 8
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerSettings {
    /// Handed to the application's connector; the engine never dials itself.
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_graceful_exit", with = "secs")]
    pub graceful_exit: Duration,
    #[serde(default)]
    pub testing: bool,
    #[serde(default = "default_pulls")]
    pub pulls: usize,
    #[serde(default = "default_pull_timeout", with = "secs")]
    pub pull_timeout: Duration,
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    #[serde(default = "default_stats_period", with = "secs")]
    pub stats_period: Duration,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceEntry {
    #[serde(default)]
    pub description: String,
    pub path: String,
    pub pulls: Option<usize>,
    #[serde(default, with = "secs::option")]
    pub pull_timeout: Option<Duration>,
    pub max_threads: Option<usize>,
    pub version: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_graceful_exit() -> Duration {
    Duration::from_secs(20)
}

fn default_pulls() -> usize {
    1
}

fn default_pull_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_max_threads() -> usize {
    4
}

fn default_stats_period() -> Duration {
    Duration::from_secs(1800)
}

impl ServerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.server.tracing_level()?;
        if self.server.pulls < 1 {
            return Err(ServiceError::invalid("server.pulls", "must be positive"));
        }
        if self.server.max_threads < 1 {
            return Err(ServiceError::invalid("server.max-threads", "must be positive"));
        }
        for (name, entry) in &self.services {
            if entry.path.is_empty() {
                return Err(ServiceError::invalid(
                    format!("services.{}.path", name),
                    "must not be empty",
                ));
            }
            if entry.pulls == Some(0) {
                return Err(ServiceError::invalid(
                    format!("services.{}.pulls", name),
                    "must be positive",
                ));
            }
            if entry.max_threads == Some(0) {
                return Err(ServiceError::invalid(
                    format!("services.{}.max-threads", name),
                    "must be positive",
                ));
            }
        }
        Ok(())
    }

    /// Server-wide defaults as a service config with no name or path.
    pub fn defaults(&self) -> ServiceConfig {
        let s = &self.server;
        ServiceConfig {
            name: String::new(),
            description: String::new(),
            path: String::new(),
            pulls: s.pulls,
            pull_timeout: s.pull_timeout,
            max_threads: s.max_threads,
            stats_period: s.stats_period,
            graceful_exit: s.graceful_exit,
            testing: s.testing,
            version: s.version.clone(),
        }
    }

    /// Config of service `name`, with unset values inherited from the server section.
    pub fn service(&self, name: &str) -> Result<ServiceConfig> {
        let entry = self
            .services
            .get(name)
            .ok_or_else(|| ServiceError::MissingConfig(format!("services.{}", name)))?;

        let mut config = self.defaults();
        config.name = name.to_string();
        config.description = entry.description.clone();
        config.path = entry.path.clone();
        if let Some(pulls) = entry.pulls {
            config.pulls = pulls;
        }
        if let Some(timeout) = entry.pull_timeout {
            config.pull_timeout = timeout;
        }
        if let Some(max_threads) = entry.max_threads {
            config.max_threads = max_threads;
        }
        if let Some(version) = &entry.version {
            config.version = version.clone();
        }
        Ok(config)
    }
}

impl ServerSettings {
    /// Map the configured level onto tracing levels. `fatal` and `panic` log as errors.
    pub fn tracing_level(&self) -> Result<tracing::Level> {
        match self.log_level.to_lowercase().as_str() {
            "debug" => Ok(tracing::Level::DEBUG),
            "info" => Ok(tracing::Level::INFO),
            "warn" => Ok(tracing::Level::WARN),
            "error" | "fatal" | "panic" => Ok(tracing::Level::ERROR),
            _ => Err(ServiceError::invalid(
                "server.log-level",
                "must be one of [debug info warn error fatal panic]",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    const CONFIG: &str = r#"
server:
  url: tcp://localhost:1717
  user: root
  pass: root
  log-level: debug
  pulls: 2
  pull-timeout: 10
  graceful-exit: 5.5
services:
  fibsrv:
    description: computes fibonacci
    path: test.fibsrv
    max-threads: 8
  echo:
    path: test.echo
    pulls: 3
"#;

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let config = ServerConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.tracing_level().unwrap(), tracing::Level::DEBUG);

        let fib = config.service("fibsrv").unwrap();
        assert_eq!(fib.name, "fibsrv");
        assert_eq!(fib.path, "test.fibsrv");
        assert_eq!(fib.pulls, 2);
        assert_eq!(fib.max_threads, 8);
        assert_eq!(fib.pull_timeout, Duration::from_secs(10));
        assert_eq!(fib.graceful_exit, Duration::from_millis(5500));
        assert_eq!(fib.stats_period, Duration::from_secs(1800));

        let echo = config.service("echo").unwrap();
        assert_eq!(echo.pulls, 3);
        assert_eq!(echo.max_threads, 4);

        assert_eq!(
            config.service("missing").unwrap_err(),
            ServiceError::MissingConfig("services.missing".to_string())
        );
    }

    #[test]
    fn test_invalid_values() {
        let bad_level = CONFIG.replace("log-level: debug", "log-level: loud");
        let config: ServerConfig = serde_yaml::from_str(&bad_level).unwrap();
        assert!(config.validate().is_err());

        let negative = CONFIG.replace("pull-timeout: 10", "pull-timeout: -1");
        assert!(serde_yaml::from_str::<ServerConfig>(&negative).is_err());

        let empty_path = CONFIG.replace("path: test.echo", "path: \"\"");
        let config: ServerConfig = serde_yaml::from_str(&empty_path).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ServiceError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_normalize_clamps() {
        let mut config = ServiceConfig::new("svc", "test.svc");
        config.pulls = 0;
        config.max_threads = 0;
        config.stats_period = Duration::from_millis(10);
        config.graceful_exit = Duration::ZERO;
        config.version.clear();
        config.normalize();

        assert_eq!(config.pulls, 1);
        assert_eq!(config.max_threads, 1);
        assert_eq!(config.stats_period, MIN_STATS_PERIOD);
        assert_eq!(config.graceful_exit, MIN_GRACEFUL_EXIT);
        assert_eq!(config.version, "0.0.0");

        config.stats_period = Duration::ZERO;
        config.normalize();
        assert!(config.stats_period.is_zero());
    }

    proptest! {
        #[test]
        fn prop_max_threads_covers_pulls(pulls in 0usize..64, max_threads in 0usize..64) {
            let mut config = ServiceConfig::new("svc", "test.svc");
            config.pulls = pulls;
            config.max_threads = max_threads;
            config.normalize();
            prop_assert!(config.pulls >= 1);
            prop_assert!(config.max_threads >= config.pulls);
            prop_assert!(config.max_threads >= max_threads);
        }
    }
}

use crate::registry::{DEFAULT_HEALTH_PATH, DEFAULT_PROBE_TIMEOUT};
use crate::targets::TargetFile;
use crate::util::{resolve_relative, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Tcp,
    #[default]
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub kind: ProbeKind,
    pub timeout_ms: u64,
    pub health_path: String,
    pub interval_ms: u64,
    /// Probe on registration; when off, new nodes wait for the scheduler.
    pub on_register: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            kind: ProbeKind::default(),
            timeout_ms: DEFAULT_PROBE_TIMEOUT.as_millis() as u64,
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            interval_ms: 30_000,
            on_register: true,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub binary: PathBuf,
    pub scheme: String,
    pub access_key: String,
    pub secret_key: String,
    pub attempt_timeout_ms: u64,
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub reset_before_apply: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("mc"),
            scheme: "http".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            attempt_timeout_ms: 60_000,
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            reset_before_apply: true,
        }
    }
}

impl ReplicationConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            max_delay_ms: 10_000,
        }
    }
}

impl RefreshConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::unbounded(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_jitter(0.1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub ledger_path: PathBuf,
    pub probe: ProbeConfig,
    pub targets: Vec<TargetFile>,
    pub replication: ReplicationConfig,
    pub refresh: RefreshConfig,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from("bloomnet-ledger.json"),
            probe: ProbeConfig::default(),
            targets: vec![TargetFile::service("targets_storage.json").with_label("job", "minio")],
            replication: ReplicationConfig::default(),
            refresh: RefreshConfig::default(),
        }
    }
}

impl ControlPlaneConfig {
    /// Loads YAML from `path`; relative paths inside resolve against the
    /// config file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&raw).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(config.resolve_paths(&base))
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn resolve_paths(mut self, base: &Path) -> Self {
        self.ledger_path = resolve_relative(base, &self.ledger_path);
        for file in &mut self.targets {
            file.path = resolve_relative(base, &file.path);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid("at least one target file is required".into()));
        }
        for file in &self.targets {
            if file.ports.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "target file {} selects no ports",
                    file.path.display()
                )));
            }
        }
        let mut paths: Vec<&Path> = self.targets.iter().map(|file| file.path.as_path()).collect();
        paths.sort();
        if paths.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::Invalid("target file paths must be unique".into()));
        }
        if self.probe.timeout_ms == 0 {
            return Err(ConfigError::Invalid("probe.timeout_ms must be > 0".into()));
        }
        if self.probe.interval_ms == 0 {
            return Err(ConfigError::Invalid("probe.interval_ms must be > 0".into()));
        }
        if self.replication.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "replication.max_attempts must be >= 1".into(),
            ));
        }
        if self.replication.attempt_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "replication.attempt_timeout_ms must be > 0".into(),
            ));
        }
        if !matches!(self.replication.scheme.as_str(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "replication.scheme must be http or https, got {:?}",
                self.replication.scheme
            )));
        }
        Ok(())
    }
}

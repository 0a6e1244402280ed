// Application configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::output::errors::SylvaError;

/// Status poll interval. Fixed; the file may only restate it.
pub const POLL_INTERVAL_SECS: u64 = 30;

/// Top-level configuration, loaded from YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub remote: RemoteConfig,
    pub storage: StorageConfig,
    pub poller: PollerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Prefix for every route (e.g. "/api")
    pub base_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: SocketAddr::from(([0, 0, 0, 0], 3000)),
            base_path: String::new(),
        }
    }
}

/// Batch cluster login node and staging layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    /// 0 disables the per-command timeout
    pub command_timeout_secs: u64,
    pub scratch_root: String,
    pub input_subpath: String,
    pub output_subpath: String,
    pub submit_command: String,
    pub queue_command: String,
    /// Callers allowed to wait for a pending connection
    pub max_waiters: usize,
    pub wait_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            host: "localhost".to_string(),
            port: 22,
            user: String::new(),
            password: None,
            private_key: None,
            connect_timeout_secs: 30,
            command_timeout_secs: 300,
            scratch_root: "/scratch".to_string(),
            input_subpath: "/input".to_string(),
            output_subpath: "/output".to_string(),
            submit_command: "sbatch $HOME/auto/launch.sh".to_string(),
            queue_command: "squeue".to_string(),
            max_waiters: 64,
            wait_timeout_secs: 60,
        }
    }
}

impl RemoteConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        match self.command_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            root: PathBuf::from("./data"),
        }
    }
}

impl StorageConfig {
    pub fn store_file(&self) -> PathBuf {
        self.root.join("sylva.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            interval_secs: POLL_INTERVAL_SECS,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl AppConfig {
    /// Load configuration from a YAML file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self, SylvaError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SylvaError::io(format!("Failed to read config file: {}", e), path)
        })?;
        let config = Self::from_yaml(&content)?;
        Ok(config.with_env_overrides())
    }

    pub fn from_yaml(content: &str) -> Result<Self, SylvaError> {
        let config: AppConfig = serde_yaml::from_str(content).map_err(|e| SylvaError::Config {
            message: format!("Invalid config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Self {
        AppConfig::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(password) = std::env::var("SYLVA_SSH_PASSWORD") {
            self.remote.password = Some(password);
        }
        if let Some(bind) = std::env::var("SYLVA_BIND")
            .ok()
            .and_then(|b| b.parse().ok())
        {
            self.server.bind = bind;
        }
        self
    }

    pub fn validate(&self) -> Result<(), SylvaError> {
        if self.poller.interval_secs != POLL_INTERVAL_SECS {
            return Err(SylvaError::Config {
                message: format!(
                    "poller.interval_secs is fixed at {}s (got {})",
                    POLL_INTERVAL_SECS, self.poller.interval_secs
                ),
            });
        }
        if self.remote.max_waiters == 0 {
            return Err(SylvaError::Config {
                message: "remote.max_waiters must be at least 1".to_string(),
            });
        }
        if !self.server.base_path.is_empty() && !self.server.base_path.starts_with('/') {
            return Err(SylvaError::Config {
                message: "server.base_path must start with '/'".to_string(),
            });
        }
        Ok(())
    }
}

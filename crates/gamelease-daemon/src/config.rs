// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonToml {
    pub database: DatabaseSection,
    pub lifecycle: LifecycleSection,
    pub rcon: RconSection,
    pub ftp: FtpSection,
    pub ssh: SshSection,
    pub mitigation: MitigationSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/gamelease".into(),
            max_connections: 8,
            acquire_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    /// Consecutive empty health checks before an auto-end reservation is ended.
    pub idle_threshold_minutes: i32,
    pub extension_minutes: i64,
    /// Extension is only allowed when less than this much time remains.
    pub extend_window_minutes: i64,
    pub health_queue_capacity: usize,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            idle_threshold_minutes: 30,
            extension_minutes: 60,
            extend_window_minutes: 60,
            health_queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RconSection {
    pub timeout_secs: u64,
    /// Text a healthy `status` response must contain.
    pub status_marker: String,
    pub kick_message: String,
}

impl Default for RconSection {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            status_marker: "hostname".into(),
            kick_message: "Server is being prepared for a new reservation".into(),
        }
    }
}

impl RconSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FtpSection {
    pub batch_size: usize,
    pub batch_timeout_secs: u64,
    pub max_concurrent_batches: usize,
    pub connect_timeout_secs: u64,
    pub download_dir: PathBuf,
}

impl Default for FtpSection {
    fn default() -> Self {
        Self {
            batch_size: 4,
            batch_timeout_secs: 30,
            max_concurrent_batches: 4,
            connect_timeout_secs: 10,
            download_dir: PathBuf::from("/var/lib/gamelease/artifacts"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSection {
    pub timeout_secs: u64,
}

impl Default for SshSection {
    fn default() -> Self {
        Self { timeout_secs: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MitigationSection {
    /// Operator host or network that always passes the chain, in CIDR notation.
    pub management_host: Option<String>,
    pub lock_wait_secs: u64,
    pub udp_limit_per_sec: u32,
    pub tcp_limit_per_sec: u32,
    pub sdr_udp_limit_per_sec: u32,
}

impl Default for MitigationSection {
    fn default() -> Self {
        Self {
            management_host: None,
            lock_wait_secs: 5,
            udp_limit_per_sec: 256,
            tcp_limit_per_sec: 32,
            sdr_udp_limit_per_sec: 64,
        }
    }
}

impl MitigationSection {
    pub fn management_network(&self) -> Result<Option<IpNetwork>, ConfigError> {
        self.management_host
            .as_deref()
            .map(|s| {
                s.parse::<IpNetwork>()
                    .map_err(|_| ConfigError::InvalidManagementHost(s.to_string()))
            })
            .transpose()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid management host: {0}")]
    InvalidManagementHost(String),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

pub async fn load(path: &Path) -> Result<DaemonToml, ConfigError> {
    debug!(path = %path.display(), "loading config");

    let mut config = match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let config: DaemonToml = toml::from_str(&contents)?;
            info!(path = %path.display(), "loaded config");
            config
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config file not found, using defaults");
            DaemonToml::default()
        }
        Err(e) => return Err(ConfigError::Read(e)),
    };

    apply_env(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Environment overrides, typically populated from `.env` by dotenvy.
pub fn apply_env(config: &mut DaemonToml) {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        debug!("database url taken from environment");
        config.database.url = url;
    }
}

pub fn validate(config: &DaemonToml) -> Result<(), ConfigError> {
    let nonzero = [
        ("lifecycle.idle_threshold_minutes", config.lifecycle.idle_threshold_minutes as i64),
        ("lifecycle.extension_minutes", config.lifecycle.extension_minutes),
        ("lifecycle.health_queue_capacity", config.lifecycle.health_queue_capacity as i64),
        ("ftp.batch_size", config.ftp.batch_size as i64),
        ("ftp.batch_timeout_secs", config.ftp.batch_timeout_secs as i64),
        ("ftp.max_concurrent_batches", config.ftp.max_concurrent_batches as i64),
        ("rcon.timeout_secs", config.rcon.timeout_secs as i64),
        ("ssh.timeout_secs", config.ssh.timeout_secs as i64),
        ("mitigation.lock_wait_secs", config.mitigation.lock_wait_secs as i64),
    ];
    for (field, value) in nonzero {
        if value <= 0 {
            return Err(ConfigError::Zero { field });
        }
    }
    config.mitigation.management_network()?;
    Ok(())
}

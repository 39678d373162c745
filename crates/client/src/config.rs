//! Client configuration management

use anyhow::{Context, Result, anyhow};
use common::{DEFAULT_BROKER_CID, DEFAULT_BROKER_PORT, Endpoint};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::listener::{DEFAULT_RECONNECT_DELAY, ListenerConfig};
use crate::store::{DEFAULT_REFRESH_ATTEMPTS, DEFAULT_REFRESH_DELAY, RefreshPolicy};
use crate::transport::{BrokerConnector, UnixConnector, VsockConnector};

/// How to reach the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// vsock to (cid, port)
    #[default]
    Vsock,
    /// Unix stream socket at `socket_path`
    Unix,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub client: ClientSettings,
    pub broker: BrokerSettings,
    pub listener: ListenerSettings,
    pub refresh: RefreshSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub log_level: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub transport: TransportKind,
    pub cid: u32,
    pub port: u32,
    /// Only used with `transport = "unix"`; `~` and `$VARS` are expanded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            transport: TransportKind::Vsock,
            cid: DEFAULT_BROKER_CID,
            port: DEFAULT_BROKER_PORT,
            socket_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    pub reconnect_delay_ms: u64,
    /// Upper bound for one incoming frame; unbounded when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_frame_size: Option<usize>,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY.as_millis() as u64,
            max_frame_size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub notify_errors: bool,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_REFRESH_ATTEMPTS,
            retry_delay_ms: DEFAULT_REFRESH_DELAY.as_millis() as u64,
            notify_errors: true,
        }
    }
}

impl ClientConfig {
    /// vsock endpoint from the `[broker]` section
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.broker.cid, self.broker.port)
    }

    /// Connector for the configured transport
    pub fn connector(&self) -> Result<BrokerConnector> {
        match self.broker.transport {
            TransportKind::Vsock => Ok(BrokerConnector::Vsock(VsockConnector::new(self.endpoint()))),
            TransportKind::Unix => {
                let path = self
                    .broker
                    .socket_path
                    .as_deref()
                    .ok_or_else(|| anyhow!("transport = \"unix\" requires broker.socket_path"))?;
                let path = shellexpand::full(path)
                    .with_context(|| format!("Failed to expand socket path: {}", path))?;
                Ok(BrokerConnector::Unix(UnixConnector::new(path.into_owned())))
            }
        }
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            reconnect_delay: Duration::from_millis(self.listener.reconnect_delay_ms),
            max_frame_size: self.listener.max_frame_size,
        }
    }

    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            max_attempts: self.refresh.max_attempts,
            retry_delay: Duration::from_millis(self.refresh.retry_delay_ms),
            notify_errors: self.refresh.notify_errors,
        }
    }
}

impl ClientConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).into_owned())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-passthrough/client.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ClientConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        tracing::debug!(
            "Config: transport={:?}, endpoint={}, socket_path={:?}",
            config.broker.transport,
            config.endpoint(),
            config.broker.socket_path
        );
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Print to stderr since logging might not be initialized yet
                eprintln!("Config: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-passthrough").join("client.toml")
        } else {
            PathBuf::from(".config/usb-passthrough/client.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.client.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.client.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.broker.transport == TransportKind::Vsock && self.broker.port == 0 {
            return Err(anyhow!("broker.port must be greater than 0"));
        }

        if self.broker.transport == TransportKind::Unix
            && self.broker.socket_path.as_deref().is_none_or(str::is_empty)
        {
            return Err(anyhow!("transport = \"unix\" requires broker.socket_path"));
        }

        if self.refresh.max_attempts == 0 {
            return Err(anyhow!("refresh.max_attempts must be at least 1"));
        }

        if self.listener.max_frame_size == Some(0) {
            return Err(anyhow!("listener.max_frame_size must be greater than 0"));
        }

        Ok(())
    }
}

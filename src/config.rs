//! # Configuration Management
//!
//! Loads the bridge configuration from layered sources:
//! - built-in defaults (the `Default` impl below)
//! - an optional `config.toml` next to the binary
//! - environment variables with the `APP_` prefix, `__` between section and
//!   field (`APP_MEDIA__READ_TIMEOUT_SECS`) so field names keep their `_`
//! - the bare `HOST` / `PORT` variables used by deployment platforms
//!
//! ## Sections
//! - **server**: where the admin HTTP API listens
//! - **media**: where the media stream socket listens and how each stream is
//!   buffered and timed out
//! - **performance**: global limits
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (admin server only)
//! 2. Environment variables (`APP_MEDIA__PORT`, `APP_SERVER__HOST`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values
//!
//! ## Rust Concepts Used:
//! - **Serde derive**: the same structs are read from TOML/env, returned as
//!   JSON by the admin API and dumped back to TOML for the startup log
//! - **Builder pattern**: `config::Config::builder()` stacks the sources

use crate::media::{ConnectionConfig, ProviderConfig};
use anyhow::Result;
use config::builder::{ConfigBuilder, DefaultState};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Complete application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub performance: PerformanceConfig,
}

/// Admin HTTP API listener.
///
/// - `host = "127.0.0.1"` keeps the admin API private to the machine
/// - `host = "0.0.0.0"` exposes it on every interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Media stream socket listener and per-stream tuning.
///
/// ## Fields:
/// - `path`: request path the telephony side connects to; only connections
///   upgraded on this path are handed to the bridge driver
/// - `buffer_capacity`: chunks held by each direction's audio buffer
///   (one chunk is ~20ms of 8kHz μ-law audio)
/// - `event_capacity`: lifecycle events queued per connection
/// - `listener_capacity`: accepted connections waiting for the driver
/// - `read_timeout_secs` / `write_timeout_secs`: socket deadlines,
///   `0` disables the deadline
/// - `echo`: write every inbound chunk straight back to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub buffer_capacity: usize,
    pub event_capacity: usize,
    pub listener_capacity: usize,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub echo: bool,
}

/// Global limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Upgrades are refused once this many streams are live.
    pub max_concurrent_streams: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            media: MediaConfig {
                host: "0.0.0.0".to_string(),
                port: 8081,
                path: "/media-stream".to_string(),
                buffer_capacity: 100,
                event_capacity: 100,
                listener_capacity: 10,
                read_timeout_secs: 30,
                write_timeout_secs: 10,
                echo: false,
            },
            performance: PerformanceConfig {
                max_concurrent_streams: 100,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_MEDIA__PORT=9000`: move the media socket
    /// - `APP_MEDIA__ECHO=true`: turn on echo mode
    /// - `APP_MEDIA__READ_TIMEOUT_SECS=0`: no read deadline
    /// - `PORT=3000`: move the admin API (deployment platforms)
    pub fn load() -> Result<Self> {
        let mut settings = Self::layered(Self::environment())?;

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// `APP_` variables; `__` separates the section from the field.
    fn environment() -> config::Environment {
        config::Environment::with_prefix("APP")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// Defaults, then `config.toml`, then the given environment.
    fn layered(environment: config::Environment) -> Result<ConfigBuilder<DefaultState>> {
        Ok(config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(environment))
    }

    /// Reject configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.media.port == 0 {
            return Err(anyhow::anyhow!("Media port cannot be 0"));
        }

        if !self.media.path.starts_with('/') {
            return Err(anyhow::anyhow!(
                "Media path must start with '/', got {:?}",
                self.media.path
            ));
        }

        if self.media.buffer_capacity == 0 {
            return Err(anyhow::anyhow!("Media buffer capacity must be greater than 0"));
        }

        if self.media.event_capacity == 0 {
            return Err(anyhow::anyhow!("Media event capacity must be greater than 0"));
        }

        if self.media.listener_capacity == 0 {
            return Err(anyhow::anyhow!("Media listener capacity must be greater than 0"));
        }

        if self.performance.max_concurrent_streams == 0 {
            return Err(anyhow::anyhow!("Max concurrent streams must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial JSON update, e.g. `{"media": {"echo": true}}`.
    ///
    /// Fields that are absent keep their value. Listener addresses and the
    /// media path are read once at startup, so changing them here only takes
    /// effect after a restart. The result is validated before it is kept.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                updated.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                updated.server.port = port_from(port)?;
            }
        }

        if let Some(media) = partial.get("media") {
            if let Some(host) = media.get("host").and_then(|v| v.as_str()) {
                updated.media.host = host.to_string();
            }
            if let Some(port) = media.get("port").and_then(|v| v.as_u64()) {
                updated.media.port = port_from(port)?;
            }
            if let Some(path) = media.get("path").and_then(|v| v.as_str()) {
                updated.media.path = path.to_string();
            }
            if let Some(capacity) = media.get("buffer_capacity").and_then(|v| v.as_u64()) {
                updated.media.buffer_capacity = capacity as usize;
            }
            if let Some(capacity) = media.get("event_capacity").and_then(|v| v.as_u64()) {
                updated.media.event_capacity = capacity as usize;
            }
            if let Some(capacity) = media.get("listener_capacity").and_then(|v| v.as_u64()) {
                updated.media.listener_capacity = capacity as usize;
            }
            if let Some(secs) = media.get("read_timeout_secs").and_then(|v| v.as_u64()) {
                updated.media.read_timeout_secs = secs;
            }
            if let Some(secs) = media.get("write_timeout_secs").and_then(|v| v.as_u64()) {
                updated.media.write_timeout_secs = secs;
            }
            if let Some(echo) = media.get("echo").and_then(|v| v.as_bool()) {
                updated.media.echo = echo;
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(streams) = performance
                .get("max_concurrent_streams")
                .and_then(|v| v.as_u64())
            {
                updated.performance.max_concurrent_streams = streams as usize;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Render the configuration as TOML for the startup log.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl MediaConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        seconds(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        seconds(self.write_timeout_secs)
    }

    /// Settings for the media core built from this section.
    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            connection: ConnectionConfig {
                buffer_capacity: self.buffer_capacity,
                event_capacity: self.event_capacity,
                read_timeout: self.read_timeout(),
                write_timeout: self.write_timeout(),
            },
            listener_capacity: self.listener_capacity,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn port_from(value: u64) -> Result<u16> {
    u16::try_from(value).map_err(|_| anyhow::anyhow!("Port {} is out of range", value))
}

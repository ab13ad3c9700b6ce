//! Tracker configuration.
//!
//! Values resolve in three layers: built-in defaults, then an optional JSON
//! file at `<config_dir>/ridetrack/config.json`, then `RIDETRACK_*`
//! environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TrackerError};

pub const DEFAULT_API_BASE: &str = "http://devse.gonetis.com:12589/api";
pub const DEFAULT_STREAM_URL: &str = "ws://devse.gonetis.com:12599/bus-location";
pub const DEFAULT_STREAM_TOPIC: &str = "/topic/bus-locations";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ETA_CACHE_TTL_SECS: u64 = 30;
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Backend REST base, without trailing slash.
    pub api_base: String,
    pub stream_url: String,
    pub stream_topic: String,
    /// Route (bus number) whose stops are tracked. Required.
    pub route_id: String,
    /// Stream vehicle id to follow; the route id when unset.
    pub vehicle_id: Option<String>,
    /// Bearer credential forwarded on outgoing calls.
    pub token: Option<String>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub eta_cache_ttl: Duration,
    pub bind_addr: String,
    pub port: u16,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            stream_url: DEFAULT_STREAM_URL.to_string(),
            stream_topic: DEFAULT_STREAM_TOPIC.to_string(),
            route_id: String::new(),
            vehicle_id: None,
            token: None,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            eta_cache_ttl: Duration::from_secs(DEFAULT_ETA_CACHE_TTL_SECS),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// On-disk overrides; every field is optional.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    api_base: Option<String>,
    stream_url: Option<String>,
    stream_topic: Option<String>,
    route_id: Option<String>,
    vehicle_id: Option<String>,
    token: Option<String>,
    poll_interval_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    eta_cache_ttl_secs: Option<u64>,
    bind_addr: Option<String>,
    port: Option<u16>,
}

impl TrackerConfig {
    /// Load defaults, the config file if present, then the environment.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = Self::config_path() {
            if path.exists() {
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    TrackerError::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                config.apply_file(&text)?;
                tracing::info!(path = %path.display(), "Loaded config file");
            }
        }

        config.apply_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ridetrack").join("config.json"))
    }

    /// The stream vehicle id this route follows.
    pub fn tracked_vehicle(&self) -> &str {
        self.vehicle_id.as_deref().unwrap_or(&self.route_id)
    }

    fn apply_file(&mut self, text: &str) -> Result<()> {
        let file: ConfigFile = serde_json::from_str(text)
            .map_err(|e| TrackerError::Config(format!("Invalid config file: {}", e)))?;

        if let Some(v) = file.api_base {
            self.api_base = v;
        }
        if let Some(v) = file.stream_url {
            self.stream_url = v;
        }
        if let Some(v) = file.stream_topic {
            self.stream_topic = v;
        }
        if let Some(v) = file.route_id {
            self.route_id = v;
        }
        if file.vehicle_id.is_some() {
            self.vehicle_id = file.vehicle_id;
        }
        if file.token.is_some() {
            self.token = file.token;
        }
        if let Some(v) = file.poll_interval_secs {
            self.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.request_timeout_secs {
            self.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.eta_cache_ttl_secs {
            self.eta_cache_ttl = Duration::from_secs(v);
        }
        if let Some(v) = file.bind_addr {
            self.bind_addr = v;
        }
        if let Some(v) = file.port {
            self.port = v;
        }
        Ok(())
    }

    fn apply_lookup<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RIDETRACK_API_BASE") {
            self.api_base = v;
        }
        if let Some(v) = lookup("RIDETRACK_STREAM_URL") {
            self.stream_url = v;
        }
        if let Some(v) = lookup("RIDETRACK_STREAM_TOPIC") {
            self.stream_topic = v;
        }
        if let Some(v) = lookup("RIDETRACK_ROUTE") {
            self.route_id = v;
        }
        if let Some(v) = lookup("RIDETRACK_VEHICLE") {
            self.vehicle_id = Some(v);
        }
        if let Some(v) = lookup("RIDETRACK_TOKEN") {
            self.token = Some(v);
        }
        if let Some(v) = lookup("RIDETRACK_POLL_SECS") {
            self.poll_interval = Duration::from_secs(parse_number("RIDETRACK_POLL_SECS", &v)?);
        }
        if let Some(v) = lookup("RIDETRACK_TIMEOUT_SECS") {
            self.request_timeout =
                Duration::from_secs(parse_number("RIDETRACK_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("RIDETRACK_ETA_TTL_SECS") {
            self.eta_cache_ttl = Duration::from_secs(parse_number("RIDETRACK_ETA_TTL_SECS", &v)?);
        }
        if let Some(v) = lookup("RIDETRACK_BIND") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("RIDETRACK_PORT") {
            self.port = parse_number("RIDETRACK_PORT", &v)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.route_id.trim().is_empty() {
            return Err(TrackerError::Config(
                "No route configured (set RIDETRACK_ROUTE)".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(TrackerError::Config(
                "Poll interval must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| TrackerError::Config(format!("{} is not a valid number: {:?}", key, value)))
}

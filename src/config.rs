//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (APP prefix, `__` between levels)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (APP__SERVER__PORT, APP__MODEL__PATH, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::inference::architecture::ModelFamily;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Upper bound for the fallback classifier's emulated latency.
pub const MAX_FALLBACK_DELAY_MS: u64 = 50;

/// Longest accepted session TTL and sweep interval (30 days).
pub const MAX_SESSION_TTL_SECS: u64 = 30 * 24 * 3600;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub fallback: FallbackConfig,
    pub sessions: SessionsConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Where the VAD model comes from and how it is run.
///
/// ## Artifact source:
/// `path` is used when it exists on disk. Otherwise, when both `hub_repo` and
/// `hub_file` are set, the file is fetched from the Hugging Face Hub cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model family, decides inputs and recurrent state shapes ("silero" or "ten")
    pub family: String,

    /// Local path of the ONNX artifact
    pub path: String,

    /// Optional Hugging Face repository holding the artifact
    pub hub_repo: Option<String>,

    /// File name inside `hub_repo`
    pub hub_file: Option<String>,

    /// Seconds to wait after a failed load before trying again
    pub load_retry_secs: u64,

    /// Run at most one inference at a time (for runtimes that are not reentrant)
    pub serialize_inference: bool,
}

/// Fallback classifier distribution.
///
/// A fallback frame is "noisy" with probability `noise_rate`; its probability is
/// then drawn from `[min_probability, 0.5]`, otherwise from `(0.5, max_probability]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackConfig {
    pub min_probability: f32,
    pub max_probability: f32,
    pub noise_rate: f32,
    pub delay_ms: u64,
}

/// Session registry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionsConfig {
    /// Lifetime of a registry entry without activity (seconds)
    pub ttl_secs: u64,

    /// How often expired entries are swept (seconds)
    pub sweep_interval_secs: u64,

    /// Maximum number of live sessions
    pub max_concurrent_sessions: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            min_probability: 0.1,
            max_probability: 1.0,
            noise_rate: 0.3,
            delay_ms: 10,
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600, // one hour, same as the connection table TTL
            sweep_interval_secs: 60,
            max_concurrent_sessions: 1000,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            model: ModelConfig {
                family: "silero".to_string(),
                path: "/opt/model/silero_vad.onnx".to_string(),
                hub_repo: None,
                hub_file: None,
                load_retry_secs: 30,
                serialize_inference: false,
            },
            fallback: FallbackConfig::default(),
            sessions: SessionsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__HOST=0.0.0.0`
    /// - `APP__MODEL__FAMILY=ten`
    /// - `APP__FALLBACK__DELAY_MS=5`
    /// - `HOST=0.0.0.0` / `PORT=3000`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Parsed model family.
    pub fn model_family(&self) -> Result<ModelFamily> {
        self.model.family.parse()
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        self.model_family()?;

        if self.model.path.trim().is_empty() && self.model.hub_repo.is_none() {
            return Err(anyhow!("Either model.path or model.hub_repo must be set"));
        }

        if self.model.hub_repo.is_some() != self.model.hub_file.is_some() {
            return Err(anyhow!("model.hub_repo and model.hub_file must be set together"));
        }

        self.fallback.validate()?;
        self.sessions.validate()?;

        Ok(())
    }

    /// Update configuration from a JSON string (runtime config updates).
    ///
    /// Only the fields present in the JSON are touched, for example
    /// `{"fallback": {"delay_ms": 5}}` changes just the fallback delay.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port).map_err(|_| anyhow!("Port out of range: {}", port))?;
            }
        }

        if let Some(model) = partial_config.get("model") {
            if let Some(retry) = model.get("load_retry_secs").and_then(|v| v.as_u64()) {
                self.model.load_retry_secs = retry;
            }
        }

        if let Some(fallback) = partial_config.get("fallback") {
            if let Some(min) = fallback.get("min_probability").and_then(|v| v.as_f64()) {
                self.fallback.min_probability = min as f32;
            }
            if let Some(max) = fallback.get("max_probability").and_then(|v| v.as_f64()) {
                self.fallback.max_probability = max as f32;
            }
            if let Some(rate) = fallback.get("noise_rate").and_then(|v| v.as_f64()) {
                self.fallback.noise_rate = rate as f32;
            }
            if let Some(delay) = fallback.get("delay_ms").and_then(|v| v.as_u64()) {
                self.fallback.delay_ms = delay;
            }
        }

        if let Some(sessions) = partial_config.get("sessions") {
            if let Some(ttl) = sessions.get("ttl_secs").and_then(|v| v.as_u64()) {
                self.sessions.ttl_secs = ttl;
            }
            if let Some(sweep) = sessions.get("sweep_interval_secs").and_then(|v| v.as_u64()) {
                self.sessions.sweep_interval_secs = sweep;
            }
            if let Some(max) = sessions.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.sessions.max_concurrent_sessions = max as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

impl FallbackConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_probability) || !(0.0..=1.0).contains(&self.max_probability) {
            return Err(anyhow!("Fallback probabilities must lie in [0, 1]"));
        }
        if self.min_probability > 0.5 || self.max_probability <= 0.5 {
            return Err(anyhow!(
                "Fallback bounds must straddle the 0.5 threshold (min <= 0.5 < max), got [{}, {}]",
                self.min_probability,
                self.max_probability
            ));
        }
        if !(0.0..=1.0).contains(&self.noise_rate) {
            return Err(anyhow!("Fallback noise_rate must lie in [0, 1]"));
        }
        if self.delay_ms > MAX_FALLBACK_DELAY_MS {
            return Err(anyhow!(
                "Fallback delay_ms must not exceed {}ms, got {}",
                MAX_FALLBACK_DELAY_MS,
                self.delay_ms
            ));
        }
        Ok(())
    }
}

impl SessionsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 || self.ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(anyhow!(
                "Session ttl_secs must lie in 1..={}, got {}",
                MAX_SESSION_TTL_SECS,
                self.ttl_secs
            ));
        }
        if self.sweep_interval_secs == 0 || self.sweep_interval_secs > MAX_SESSION_TTL_SECS {
            return Err(anyhow!(
                "Session sweep_interval_secs must lie in 1..={}, got {}",
                MAX_SESSION_TTL_SECS,
                self.sweep_interval_secs
            ));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(anyhow!("Max concurrent sessions must be greater than 0"));
        }
        Ok(())
    }
}

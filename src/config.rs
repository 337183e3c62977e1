use std::path::Path;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize, Serializer};
use validator::{Validate, ValidationError};

use crate::domain::loads::LoadConfig;
use crate::domain::plant::PlantConfig;

/// Top-level application configuration, loaded from YAML at startup.
/// Unknown fields are rejected everywhere.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_unique_load_ids"))]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub provider: ProviderConfig,

    #[serde(default)]
    #[validate(nested)]
    pub ems: EmsSettings,

    #[validate(nested)]
    pub plant: PlantConfig,

    #[serde(default)]
    pub loads: Vec<LoadConfig>,
}

fn validate_unique_load_ids(config: &AppConfig) -> Result<(), ValidationError> {
    let mut seen = std::collections::HashSet::new();
    for load in &config.loads {
        if !seen.insert(load.id()) {
            return Err(ValidationError::new("load ids must be unique"));
        }
    }
    Ok(())
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    #[validate(length(min = 1))]
    pub host: String,

    #[serde(default = "default_port")]
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Failed to parse socket address")
    }
}

/// Home-automation provider connection.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[validate(url)]
    pub base_url: String,

    /// Access token; always redacted on serialization.
    #[serde(serialize_with = "redact")]
    pub token: String,

    #[serde(default = "default_provider_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub timeout_secs: u64,
}

fn redact<S: Serializer>(_token: &str, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str("**redacted**")
}

/// Terminal battery SoC enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TerminalSocMode {
    Hard,
    #[default]
    Adaptive,
}

/// Penalty applied per kWh of terminal SoC shortfall in adaptive mode:
/// either a fixed value or a statistic of the effective import prices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TerminalSocPenalty {
    Statistic(PenaltyStatistic),
    PerKwh(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PenaltyStatistic {
    Mean,
    Median,
}

impl Default for TerminalSocPenalty {
    fn default() -> Self {
        TerminalSocPenalty::Statistic(PenaltyStatistic::Median)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_terminal_soc"))]
pub struct TerminalSocSettings {
    #[serde(default)]
    pub mode: TerminalSocMode,
    #[serde(default)]
    pub penalty_per_kwh: TerminalSocPenalty,
}

impl Default for TerminalSocSettings {
    fn default() -> Self {
        Self { mode: TerminalSocMode::default(), penalty_per_kwh: TerminalSocPenalty::default() }
    }
}

fn validate_terminal_soc(settings: &TerminalSocSettings) -> Result<(), ValidationError> {
    if let TerminalSocPenalty::PerKwh(value) = settings.penalty_per_kwh {
        if value < 0.0 {
            return Err(ValidationError::new("penalty_per_kwh must be >= 0"));
        }
    }
    Ok(())
}

/// Planning cadence and horizon discretization.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_interval_settings"))]
pub struct EmsSettings {
    #[serde(default = "default_timestep_minutes")]
    #[validate(range(min = 1, max = 1440))]
    pub timestep_minutes: u32,

    #[serde(default = "default_min_horizon_minutes")]
    #[validate(range(min = 1, max = 525600))]
    pub min_horizon_minutes: u32,

    #[serde(default)]
    #[validate(range(min = 1, max = 1440))]
    pub high_res_timestep_minutes: Option<u32>,

    #[serde(default)]
    #[validate(range(min = 1, max = 525600))]
    pub high_res_horizon_minutes: Option<u32>,

    #[serde(default)]
    #[validate(nested)]
    pub terminal_soc: TerminalSocSettings,

    /// Coalescing window for externally triggered replans.
    #[serde(default = "default_replan_debounce_seconds")]
    #[validate(range(min = 1, max = 3600))]
    pub replan_debounce_seconds: u64,
}

impl Default for EmsSettings {
    fn default() -> Self {
        Self {
            timestep_minutes: default_timestep_minutes(),
            min_horizon_minutes: default_min_horizon_minutes(),
            high_res_timestep_minutes: None,
            high_res_horizon_minutes: None,
            terminal_soc: TerminalSocSettings::default(),
            replan_debounce_seconds: default_replan_debounce_seconds(),
        }
    }
}

impl EmsSettings {
    /// Interval used to size the forecast horizon and align forecasts.
    pub fn base_interval_minutes(&self) -> u32 {
        self.high_res_timestep_minutes.unwrap_or(self.timestep_minutes)
    }
}

fn validate_interval_settings(settings: &EmsSettings) -> Result<(), ValidationError> {
    match (settings.high_res_timestep_minutes, settings.high_res_horizon_minutes) {
        (None, None) => Ok(()),
        (Some(step), Some(span)) => {
            if span % step != 0 {
                return Err(ValidationError::new(
                    "high_res_horizon_minutes must be a multiple of high_res_timestep_minutes",
                ));
            }
            Ok(())
        }
        _ => Err(ValidationError::new(
            "high_res_timestep_minutes and high_res_horizon_minutes must be set together",
        )),
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    6070
}
fn default_provider_timeout_secs() -> u64 {
    30
}
fn default_timestep_minutes() -> u32 {
    5
}
fn default_min_horizon_minutes() -> u32 {
    120
}
fn default_replan_debounce_seconds() -> u64 {
    2
}

impl AppConfig {
    /// Load configuration from a YAML file with `EMS__`-prefixed
    /// environment overrides (`EMS__SERVER__PORT` -> `server.port`).
    pub fn load(path: &Path) -> Result<Self> {
        let config: AppConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("EMS__").split("__"))
            .extract()
            .context("Failed to parse configuration")?;

        config.validate().context("Configuration validation failed")?;
        for load in &config.loads {
            load.validate().context("Configuration validation failed")?;
        }
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: AppConfig = Figment::new()
            .merge(Yaml::string(yaml))
            .extract()
            .context("Failed to parse configuration")?;
        config.validate().context("Configuration validation failed")?;
        for load in &config.loads {
            load.validate().context("Configuration validation failed")?;
        }
        Ok(config)
    }
}

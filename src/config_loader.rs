/// Pump configuration and settings file locations
///
/// Config is a flat JSON object (port, baudrate, diameter, max_volume, max_rate).
/// Loading merges whatever keys the file has over the defaults, so a partial or
/// older file still yields a complete config.

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "chemyx_config.json";
pub const DEFAULT_STEPS_FILE: &str = "chemyx_steps.json";

/// Baud rates offered by the configuration tab
pub const BAUD_RATES: [u32; 6] = [9600, 14400, 19200, 38400, 57600, 115200];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpConfig {
    pub port: String,
    pub baudrate: u32,
    /// Syringe inner diameter in mm
    pub diameter: f64,
    /// mL
    pub max_volume: f64,
    /// mL/min
    pub max_rate: f64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            port: "COM4".to_string(),
            baudrate: 38400,
            diameter: 28.6,
            max_volume: 20.0,
            max_rate: 100.0,
        }
    }
}

/// Same shape as PumpConfig with every key optional, for merging over defaults.
#[derive(Debug, Default, Deserialize)]
struct PartialPumpConfig {
    port: Option<String>,
    baudrate: Option<u32>,
    diameter: Option<f64>,
    max_volume: Option<f64>,
    max_rate: Option<f64>,
}

impl PumpConfig {
    fn merge(mut self, partial: PartialPumpConfig) -> Self {
        if let Some(v) = partial.port { self.port = v; }
        if let Some(v) = partial.baudrate { self.baudrate = v; }
        if let Some(v) = partial.diameter { self.diameter = v; }
        if let Some(v) = partial.max_volume { self.max_volume = v; }
        if let Some(v) = partial.max_rate { self.max_rate = v; }
        self
    }
}

/// Resolve the config file location: PUMPDRIVER_CONFIG (env or .env), else chemyx_config.json
pub fn config_path() -> PathBuf {
    let _ = dotenv();
    env::var("PUMPDRIVER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Resolve the auto-saved program location: PUMPDRIVER_STEPS (env or .env), else chemyx_steps.json
pub fn steps_path() -> PathBuf {
    let _ = dotenv();
    env::var("PUMPDRIVER_STEPS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_STEPS_FILE))
}

/// Load config from `path`, merged over defaults.
/// A missing file is not an error: defaults are returned.
pub fn load_config(path: &Path) -> Result<PumpConfig> {
    if !path.exists() {
        log::info!(target: "config_loader", "No config at {:?}, using defaults", path);
        return Ok(PumpConfig::default());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {:?}", path))?;
    let partial: PartialPumpConfig = serde_json::from_str(&text)
        .map_err(|e| anyhow!("Invalid config JSON in {:?}: {}", path, e))?;
    let cfg = PumpConfig::default().merge(partial);
    log::info!(target: "config_loader", "Loaded config: port={}, baud={}, diameter={}",
               cfg.port, cfg.baudrate, cfg.diameter);
    Ok(cfg)
}

pub fn save_config(path: &Path, cfg: &PumpConfig) -> Result<()> {
    let text = serde_json::to_string_pretty(cfg)?;
    fs::write(path, text).with_context(|| format!("Failed to write config {:?}", path))?;
    log::debug!(target: "config_loader", "Saved config to {:?}", path);
    Ok(())
}

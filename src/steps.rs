/// Step programs
///
/// A program is an ordered list of steps, each a function name plus numeric
/// parameters. Programs are stored as a JSON array of `{function, params}`
/// objects with 2-space indentation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFunction {
    PumpVolume,
    PumpTime,
    Wait,
    StartLoop,
    EndLoop,
}

impl StepFunction {
    pub const ALL: [StepFunction; 5] = [
        StepFunction::PumpVolume,
        StepFunction::PumpTime,
        StepFunction::Wait,
        StepFunction::StartLoop,
        StepFunction::EndLoop,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StepFunction::PumpVolume => "pump_volume",
            StepFunction::PumpTime => "pump_time",
            StepFunction::Wait => "wait",
            StepFunction::StartLoop => "start_loop",
            StepFunction::EndLoop => "end_loop",
        }
    }

    /// Editable parameters: (name, label, unit suffix, min, max, default for new steps)
    pub fn param_specs(self) -> &'static [ParamSpec] {
        match self {
            StepFunction::PumpVolume => &[
                ParamSpec { name: "volume", label: "Volume", suffix: "mL", min: -1000.0, max: 1000.0, initial: 0.0 },
                ParamSpec { name: "rate", label: "Rate", suffix: "mL/min", min: 0.1, max: 1000.0, initial: 10.0 },
            ],
            StepFunction::PumpTime => &[
                ParamSpec { name: "time", label: "Time", suffix: "sec", min: 0.1, max: 10000.0, initial: 1.0 },
                ParamSpec { name: "rate", label: "Rate", suffix: "mL/min", min: -1000.0, max: 1000.0, initial: 10.0 },
            ],
            StepFunction::Wait => &[
                ParamSpec { name: "time", label: "Wait Time", suffix: "sec", min: 0.1, max: 10000.0, initial: 1.0 },
            ],
            StepFunction::StartLoop => &[
                ParamSpec { name: "iterations", label: "Iterations", suffix: "", min: 1.0, max: 1000.0, initial: 2.0 },
            ],
            StepFunction::EndLoop => &[],
        }
    }

    /// Value the interpreter uses when a parameter is missing from a step
    fn fallback(self, param: &str) -> f64 {
        match (self, param) {
            (StepFunction::PumpVolume, "volume") => 0.0,
            _ => 1.0,
        }
    }
}

impl fmt::Display for StepFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub suffix: &'static str,
    pub min: f64,
    pub max: f64,
    pub initial: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum StepError {
    #[error("{function}: parameter '{param}' must be a finite number")]
    NotFinite { function: StepFunction, param: String },
    #[error("start_loop: iterations must be at least 1, got {0}")]
    BadIterations(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub function: StepFunction,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

impl Step {
    pub fn new(function: StepFunction, params: BTreeMap<String, f64>) -> Self {
        Self { function, params }
    }

    /// Step with the defaults offered when adding it to a program
    pub fn with_defaults(function: StepFunction) -> Self {
        let params = function
            .param_specs()
            .iter()
            .map(|spec| (spec.name.to_string(), spec.initial))
            .collect();
        Self { function, params }
    }

    /// Parameter value, or the interpreter default when absent
    pub fn param(&self, name: &str) -> f64 {
        self.params.get(name).copied().unwrap_or_else(|| self.function.fallback(name))
    }

    pub fn set_param(&mut self, name: &str, value: f64) {
        self.params.insert(name.to_string(), value);
    }

    /// `k=v, k=v` summary for tables and status lines
    pub fn describe(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn validate(&self) -> std::result::Result<(), StepError> {
        for (name, value) in &self.params {
            if !value.is_finite() {
                return Err(StepError::NotFinite { function: self.function, param: name.clone() });
            }
        }
        if self.function == StepFunction::StartLoop {
            let iterations = self.param("iterations");
            if iterations < 1.0 {
                return Err(StepError::BadIterations(iterations));
            }
        }
        Ok(())
    }
}

pub fn load_program(path: &Path) -> Result<Vec<Step>> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read program {:?}", path))?;
    let steps: Vec<Step> = serde_json::from_str(&text).with_context(|| format!("Invalid program file {:?}", path))?;
    log::info!(target: "steps", "Loaded {} steps from {:?}", steps.len(), path);
    Ok(steps)
}

pub fn save_program(path: &Path, steps: &[Step]) -> Result<()> {
    let text = serde_json::to_string_pretty(steps)?;
    fs::write(path, text).with_context(|| format!("Failed to write program {:?}", path))?;
    log::info!(target: "steps", "Saved {} steps to {:?}", steps.len(), path);
    Ok(())
}

/// Load the auto-saved program; a missing file is an empty program
pub fn auto_load_steps(path: &Path) -> Result<Vec<Step>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    load_program(path)
}

/// Persist the program after an edit. Failures are logged, not returned.
pub fn auto_save_steps(path: &Path, steps: &[Step]) {
    if let Err(e) = save_program(path, steps) {
        log::warn!(target: "steps", "Auto-save failed: {:#}", e);
    }
}

/// Swap step `row` with the one above it. Returns false when out of range.
pub fn move_up(steps: &mut [Step], row: usize) -> bool {
    if row == 0 || row >= steps.len() {
        return false;
    }
    steps.swap(row, row - 1);
    true
}

pub fn move_down(steps: &mut [Step], row: usize) -> bool {
    if row + 1 >= steps.len() {
        return false;
    }
    steps.swap(row, row + 1);
    true
}

//! Run configuration for the evolution engine.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{FieldError, FieldResult};
use crate::gpu::KernelParams;
use crate::{Scalar, GOLDEN_RATIO};

/// Upper bound on the node count. Each node adds at most `1/(2e)` to the metric, so this keeps
/// a full step's fixed-point sum well below `u32::MAX`.
pub const MAX_NODES: u32 = 16_384;

/// Engine settings. Missing fields in a config file fall back to [`EngineConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub nodes: u32,
    /// Curvature constant `c` of the Möbius update. Must be negative.
    pub curvature: Scalar,
    /// Simulation time advanced per step (`time = step * time_step`).
    pub time_step: Scalar,
    /// The alignment projection runs on every step divisible by this interval.
    pub alignment_interval: u32,
    /// The run halts once a step's metric is strictly greater than this value.
    pub halt_threshold: f64,
    pub max_iterations: u32,
    /// Emit an `info` progress line every this many steps (0 disables).
    pub progress_interval: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nodes: 512,
            curvature: -1.0,
            time_step: 0.01,
            alignment_interval: 10,
            halt_threshold: 0.89,
            max_iterations: 1000,
            progress_interval: 100,
        }
    }
}

impl EngineConfig {
    /// Loads a JSON config file and validates it.
    pub fn from_json_path<P: AsRef<Path>>(path: P) -> FieldResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            FieldError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|err| {
            FieldError::Config(format!("failed to parse {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FieldResult<()> {
        if self.nodes == 0 || self.nodes > MAX_NODES {
            return Err(FieldError::Config(format!(
                "nodes must be in 1..={MAX_NODES}, got {}",
                self.nodes
            )));
        }
        if !(self.curvature.is_finite() && self.curvature < 0.0) {
            return Err(FieldError::Config(format!(
                "curvature must be a finite negative value, got {}",
                self.curvature
            )));
        }
        if !self.time_step.is_finite() {
            return Err(FieldError::Config(format!(
                "time_step must be finite, got {}",
                self.time_step
            )));
        }
        if self.alignment_interval == 0 {
            return Err(FieldError::Config(
                "alignment_interval must be at least 1".into(),
            ));
        }
        if !(self.halt_threshold.is_finite() && self.halt_threshold > 0.0) {
            return Err(FieldError::Config(format!(
                "halt_threshold must be finite and positive, got {}",
                self.halt_threshold
            )));
        }
        Ok(())
    }

    /// Builds the uniform payload for `step`.
    pub fn kernel_params(&self, step: u32) -> KernelParams {
        KernelParams {
            curvature: self.curvature,
            golden_ratio: GOLDEN_RATIO,
            time: step as Scalar * self.time_step,
            step_index: step,
        }
    }

    pub fn aligns_on(&self, step: u32) -> bool {
        step % self.alignment_interval == 0
    }
}

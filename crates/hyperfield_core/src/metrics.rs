//! Fixed-point metric encoding and the per-run metric history.
//!
//! Lanes cannot atomically add floats, so every node contribution is converted to an
//! unsigned fixed-point word before the atomic add. The conversion is part of the kernel
//! contract and must match `encode_fixed_point` in the WGSL module:
//!
//! - scale factor [`FIXED_POINT_SCALE`] (`1e6`)
//! - negative contributions clamp to zero
//! - round half up (`floor(x * scale + 0.5)`), saturating at `u32::MAX`
//!
//! Sums wrap modulo 2^32 exactly like WGSL `atomicAdd`.

use serde::{Deserialize, Serialize};

use crate::Scalar;

pub const FIXED_POINT_SCALE: Scalar = 1_000_000.0;

/// Encodes one node contribution as a fixed-point word.
pub fn encode_fixed_point(contribution: Scalar) -> u32 {
    // `as` saturates (and maps NaN to 0), matching WGSL's float→u32 conversion.
    (contribution.max(0.0) * FIXED_POINT_SCALE + 0.5).floor() as u32
}

/// Decodes an accumulated fixed-point word back into the metric value.
pub fn decode_fixed_point(word: u32) -> f64 {
    f64::from(word) / f64::from(FIXED_POINT_SCALE)
}

/// Append-only record of decoded metric samples, one per completed step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvolutionHistory {
    samples: Vec<f64>,
}

impl EvolutionHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: f64) {
        self.samples.push(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last(&self) -> Option<f64> {
        self.samples.last().copied()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.samples
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    pub fn peak(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::max)
    }
}

//! Field evolution cases and their sequential CPU reference.

use glam::Vec2;
use hyperfield_core::{kernels, metrics::decode_fixed_point, state::initial_layout, EngineConfig};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// A starting state plus the handful of settings that shape a short run. Cases never halt on
/// the metric: every case runs exactly `steps` steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCase {
    pub curvature: f32,
    pub time_step: f32,
    pub alignment_interval: u32,
    pub steps: u32,
    pub nodes: Vec<[f32; 2]>,
}

impl FieldCase {
    pub fn vectors(&self) -> Vec<Vec2> {
        self.nodes.iter().copied().map(Vec2::from_array).collect()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            nodes: self.nodes.len() as u32,
            curvature: self.curvature,
            time_step: self.time_step,
            alignment_interval: self.alignment_interval,
            halt_threshold: f64::MAX,
            max_iterations: self.steps,
            progress_interval: 0,
        }
    }

    /// Replays the case one node at a time, in index order.
    pub fn reference(&self) -> FieldOutcome {
        let config = self.engine_config();
        let mut state = self.vectors();
        let mut history = Vec::with_capacity(self.steps as usize);

        for step in 0..self.steps {
            let params = config.kernel_params(step);
            let mut sum = 0u32;
            let next: Vec<Vec2> = (0..state.len())
                .map(|idx| {
                    let update = kernels::field_update_node(&state, idx, &params);
                    sum = sum.wrapping_add(update.encoded);
                    update.next
                })
                .collect();
            state = next;
            history.push(decode_fixed_point(sum));
            if config.aligns_on(step) {
                state = state.into_iter().map(kernels::align_node).collect();
            }
        }

        FieldOutcome {
            history,
            nodes: state.iter().map(|v| v.to_array()).collect(),
        }
    }
}

/// Metric history and final state of one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOutcome {
    pub history: Vec<f64>,
    pub nodes: Vec<[f32; 2]>,
}

/// Largest componentwise disagreement between two outcomes of the same case.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Residuals {
    pub max_state: f32,
    /// Relative to the larger of the two samples (absolute below 1e-6).
    pub max_metric: f64,
    /// Set when the outcomes disagree on node count or history length.
    pub shape_mismatch: bool,
}

impl Residuals {
    pub fn between(expected: &FieldOutcome, actual: &FieldOutcome) -> Self {
        let shape_mismatch = expected.nodes.len() != actual.nodes.len()
            || expected.history.len() != actual.history.len();

        let max_state = expected
            .nodes
            .iter()
            .zip(actual.nodes.iter())
            .map(|(lhs, rhs)| (Vec2::from_array(*lhs) - Vec2::from_array(*rhs)).abs().max_element())
            .fold(0.0f32, f32::max);

        let max_metric = expected
            .history
            .iter()
            .zip(actual.history.iter())
            .map(|(lhs, rhs)| (lhs - rhs).abs() / lhs.abs().max(rhs.abs()).max(1e-6))
            .fold(0.0f64, f64::max);

        Self {
            max_state,
            max_metric,
            shape_mismatch,
        }
    }

    /// Running maximum over several cases.
    pub fn merge(self, other: Residuals) -> Self {
        Self {
            max_state: self.max_state.max(other.max_state),
            max_metric: self.max_metric.max(other.max_metric),
            shape_mismatch: self.shape_mismatch || other.shape_mismatch,
        }
    }

    pub fn within(&self, state_tolerance: f32, metric_tolerance: f64) -> bool {
        !self.shape_mismatch
            && self.max_state <= state_tolerance
            && self.max_metric <= metric_tolerance
    }
}

/// Deterministic generator for random field cases. Nodes lie strictly inside the Poincaré
/// disk of each case's curvature.
pub fn generate_field_cases(count: usize, seed: u64) -> Vec<FieldCase> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut cases = Vec::with_capacity(count);
    for _ in 0..count {
        let curvature: f32 = rng.gen_range(-2.0..=-0.1);
        let disk_radius = (-curvature).sqrt().recip();
        let node_count = rng.gen_range(1..=200usize);
        let nodes = (0..node_count)
            .map(|_| {
                let radius = rng.gen_range(0.0..0.9f32) * disk_radius;
                let angle = rng.gen_range(0.0..std::f32::consts::TAU);
                [radius * angle.cos(), radius * angle.sin()]
            })
            .collect();
        cases.push(FieldCase {
            curvature,
            time_step: rng.gen_range(0.0..=0.05),
            alignment_interval: rng.gen_range(1..=5),
            steps: rng.gen_range(1..=4),
            nodes,
        });
    }
    cases
}

/// Edge cases: a lone node, an all-zero field, nodes hugging the disk boundary, a partial
/// trailing workgroup, vanishing magnitudes and the default golden-spiral layout.
pub fn field_stress_cases() -> Vec<FieldCase> {
    let base = |nodes: Vec<[f32; 2]>| FieldCase {
        curvature: -1.0,
        time_step: 0.01,
        alignment_interval: 2,
        steps: 3,
        nodes,
    };

    let boundary = (0..16)
        .map(|i| {
            let angle = i as f32 * std::f32::consts::TAU / 16.0;
            [0.999 * angle.cos(), 0.999 * angle.sin()]
        })
        .collect();
    let partial_workgroup = (0..65)
        .map(|i| {
            let t = i as f32 / 65.0;
            [0.5 * t - 0.25, 0.25 - 0.5 * t]
        })
        .collect();
    let spiral = initial_layout(512).iter().map(|v| v.to_array()).collect();

    vec![
        base(vec![[0.3, -0.2]]),
        base(vec![[0.0, 0.0]; 8]),
        base(boundary),
        base(partial_workgroup),
        base(vec![[1e-20, -1e-20]; 4]),
        FieldCase {
            alignment_interval: 10,
            steps: 1,
            ..base(spiral)
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_cases_stay_inside_the_disk() {
        for case in generate_field_cases(32, 0xC0FFEE) {
            let limit = (-case.curvature).sqrt().recip();
            assert!(case.curvature < 0.0);
            assert!(!case.nodes.is_empty());
            assert!(case.alignment_interval >= 1);
            assert!(case.engine_config().validate().is_ok());
            assert!(case.vectors().iter().all(|v| v.length() < limit));
        }
    }

    #[test]
    fn reference_history_has_one_sample_per_step() {
        for case in field_stress_cases() {
            let outcome = case.reference();
            assert_eq!(outcome.history.len(), case.steps as usize);
            assert_eq!(outcome.nodes.len(), case.nodes.len());
            assert!(outcome.nodes.iter().all(|n| n[0].is_finite() && n[1].is_finite()));
        }
    }

    #[test]
    fn residuals_flag_shape_and_value_differences() {
        let case = field_stress_cases().remove(0);
        let expected = case.reference();
        assert_eq!(Residuals::between(&expected, &expected), Residuals::default());

        let mut shifted = expected.clone();
        shifted.nodes[0][1] += 0.5;
        let residuals = Residuals::between(&expected, &shifted);
        assert!((residuals.max_state - 0.5).abs() < 1e-6);
        assert!(!residuals.within(0.1, 1.0));

        let mut truncated = expected.clone();
        truncated.history.pop();
        assert!(Residuals::between(&expected, &truncated).shape_mismatch);
    }
}

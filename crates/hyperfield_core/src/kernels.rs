//! Per-node kernel math. These functions are the CPU reference for the WGSL entry points in
//! `hyperfield_shaders` and are what the CPU backend runs in each lane.
//!
//! All arithmetic stays in `f32` to track the GPU within tolerance. The noise hash amplifies
//! `sin` rounding differences, so cross-backend agreement is tolerance-bounded, never bit-exact.

use glam::Vec2;

use crate::gpu::KernelParams;
use crate::metrics::encode_fixed_point;
use crate::Scalar;

/// Guards logarithms, divisions and the Möbius denominator against zero.
pub const EPSILON: Scalar = 1e-6;

/// Fixed-stride ring neighborhood size.
pub const RING_NEIGHBORS: u32 = 7;

/// Fixed reference direction `L` of the alignment projection.
pub const REFERENCE: Vec2 = Vec2::new(1.0, 0.0);

pub const ALIGNMENT_TARGET: Scalar = 0.95;
pub const ALIGNMENT_GAIN: Scalar = 0.1;

/// Curvature-parameterized Möbius addition.
///
/// `[(1 + 2c⟨u,v⟩ + c|v|²)u + (1 − c|u|²)v] / (1 + 2c⟨u,v⟩ + c²|u|²|v|²)`
///
/// The denominator is non-negative for any real `c`; it is clamped to [`EPSILON`] so
/// near-degenerate pairs stay finite.
pub fn mobius_add(u: Vec2, v: Vec2, curvature: Scalar) -> Vec2 {
    let c = curvature;
    let u_sq = u.dot(u);
    let v_sq = v.dot(v);
    let uv = u.dot(v);

    let numerator = (1.0 + 2.0 * c * uv + c * v_sq) * u + (1.0 - c * u_sq) * v;
    let denominator = (1.0 + 2.0 * c * uv + c * c * u_sq * v_sq).max(EPSILON);
    numerator / denominator
}

/// Standard counter-clockwise rotation.
pub fn rotate(v: Vec2, angle: Scalar) -> Vec2 {
    let (sin_a, cos_a) = angle.sin_cos();
    Vec2::new(v.x * cos_a - v.y * sin_a, v.x * sin_a + v.y * cos_a)
}

/// GLSL/WGSL `fract`: `x - floor(x)`, always in `[0, 1)` (unlike `f32::fract`).
fn fract(x: Scalar) -> Scalar {
    x - x.floor()
}

/// Deterministic scalar hash of a position and a time value, in `[-φ, φ)`.
pub fn hash_noise(pos: Vec2, time: Scalar, golden_ratio: Scalar) -> Scalar {
    let p = fract((pos.dot(Vec2::new(12.9898, 78.233)) + time).sin() * 43758.5453);
    let swapped = Vec2::new(pos.y, pos.x);
    let q = fract((swapped.dot(Vec2::new(23.321, 46.123)) + time).sin() * 65432.1234);
    (p + q - 1.0) * golden_ratio
}

/// 2D noise vector for a node. Only the x component takes the extra φ factor, so x lies in
/// `[-φ², φ²)` and y in `[-φ, φ)`.
pub fn noise_vector(pos: Vec2, time: Scalar, golden_ratio: Scalar) -> Vec2 {
    Vec2::new(
        hash_noise(pos, time, golden_ratio) * golden_ratio,
        hash_noise(Vec2::new(pos.y, pos.x), time + 1.0, golden_ratio),
    )
}

/// Folds the seven rotated ring neighbors of `idx` in increasing offset order and averages.
pub fn ring_aggregate(state: &[Vec2], idx: usize, params: &KernelParams) -> Vec2 {
    let n = state.len();
    let mut acc = Vec2::ZERO;
    for d in 0..RING_NEIGHBORS {
        let angle = d as Scalar * std::f32::consts::TAU / RING_NEIGHBORS as Scalar;
        let neighbor = state[(idx + d as usize) % n];
        let rotated = rotate(neighbor, angle) * params.golden_ratio;
        acc = mobius_add(acc, rotated, params.curvature);
    }
    acc / RING_NEIGHBORS as Scalar
}

/// Metric contribution of one saturated node: `-|C|² · ln(|C| + ε)`.
pub fn metric_contribution(saturated: Vec2) -> Scalar {
    -saturated.length_squared() * (saturated.length() + EPSILON).ln()
}

/// Output of one field-update lane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeUpdate {
    pub next: Vec2,
    pub contribution: Scalar,
    /// Fixed-point word this lane adds to the metric accumulator.
    pub encoded: u32,
}

impl NodeUpdate {
    pub fn is_finite(&self) -> bool {
        self.next.is_finite()
    }
}

/// Field update for node `idx`, reading the previous step's `state`.
pub fn field_update_node(state: &[Vec2], idx: usize, params: &KernelParams) -> NodeUpdate {
    let psi = state[idx];
    let aggregate = ring_aggregate(state, idx, params);
    let noise = noise_vector(psi, params.time, params.golden_ratio);

    let pre = aggregate + noise;
    let saturated = Vec2::new(pre.x.tanh(), pre.y.tanh());

    let contribution = metric_contribution(saturated);
    NodeUpdate {
        next: mobius_add(psi, saturated * params.golden_ratio, params.curvature),
        contribution,
        encoded: encode_fixed_point(contribution),
    }
}

/// Cosine between `v` and the reference direction, guarded by [`EPSILON`].
pub fn alignment(v: Vec2) -> Scalar {
    v.dot(REFERENCE) / (v.length() * REFERENCE.length() + EPSILON)
}

/// Soft alignment projection toward [`REFERENCE`]. Nodes already aligned are returned as is.
pub fn align_node(v: Vec2) -> Vec2 {
    let a = alignment(v);
    if a < ALIGNMENT_TARGET {
        let correction = ALIGNMENT_GAIN * (ALIGNMENT_TARGET - a);
        (1.0 - correction) * v + correction * REFERENCE
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GOLDEN_RATIO;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn params() -> KernelParams {
        KernelParams {
            curvature: -1.0,
            golden_ratio: GOLDEN_RATIO,
            time: 0.0,
            step_index: 0,
        }
    }

    fn random_vec(rng: &mut StdRng, range: Scalar) -> Vec2 {
        Vec2::new(rng.gen_range(-range..range), rng.gen_range(-range..range))
    }

    #[test]
    fn mobius_zero_is_right_identity() {
        let mut rng = StdRng::seed_from_u64(0xF1E1D);
        for _ in 0..256 {
            let v = random_vec(&mut rng, 4.0);
            let c = rng.gen_range(-2.0..-0.01);
            let got = mobius_add(v, Vec2::ZERO, c);
            assert!(
                (got - v).abs().max_element() <= 1e-6 * v.length().max(1.0),
                "identity failed: {v:?} -> {got:?}"
            );
        }
    }

    #[test]
    fn mobius_zero_is_left_identity() {
        let v = Vec2::new(0.3, -0.7);
        assert!((mobius_add(Vec2::ZERO, v, -1.0) - v).length() < 1e-6);
    }

    #[test]
    fn mobius_denominator_guard_keeps_result_finite() {
        // c = -1 with aligned unit vectors drives the raw denominator to zero.
        let u = Vec2::new(1.0, 0.0);
        let v = Vec2::new(1.0, 0.0);
        assert!(mobius_add(u, v, -1.0).is_finite());
    }

    #[test]
    fn rotation_is_counter_clockwise() {
        let r = rotate(Vec2::X, std::f32::consts::FRAC_PI_2);
        assert!((r - Vec2::Y).length() < 1e-6);
    }

    #[test]
    fn noise_is_deterministic_and_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..128 {
            let pos = random_vec(&mut rng, 2.0);
            let t: Scalar = rng.gen_range(0.0..10.0);
            let a = noise_vector(pos, t, GOLDEN_RATIO);
            let b = noise_vector(pos, t, GOLDEN_RATIO);
            assert_eq!(a, b);
            assert!(a.x.abs() <= GOLDEN_RATIO * GOLDEN_RATIO + 1e-6);
            assert!(a.y.abs() <= GOLDEN_RATIO + 1e-6);
        }
    }

    #[test]
    fn noise_scales_only_the_x_component_twice() {
        let pos = Vec2::new(0.3, -0.2);
        let t = 0.0;
        let noise = noise_vector(pos, t, GOLDEN_RATIO);
        let x = hash_noise(pos, t, GOLDEN_RATIO) * GOLDEN_RATIO;
        let y = hash_noise(Vec2::new(-0.2, 0.3), t + 1.0, GOLDEN_RATIO);
        assert_eq!(noise, Vec2::new(x, y));
        assert!(y != 0.0);
        assert_ne!(noise.y, y * GOLDEN_RATIO);
    }

    #[test]
    fn noise_depends_on_time() {
        let pos = Vec2::new(0.2, 0.1);
        assert_ne!(
            noise_vector(pos, 0.0, GOLDEN_RATIO),
            noise_vector(pos, 0.37, GOLDEN_RATIO)
        );
    }

    #[test]
    fn contribution_is_guarded_at_zero() {
        assert_eq!(metric_contribution(Vec2::ZERO), 0.0);
        let c = metric_contribution(Vec2::new(0.5, 0.0));
        assert!((c - 0.25 * -(0.5f32 + EPSILON).ln()).abs() < 1e-6);
    }

    #[test]
    fn field_update_is_finite_for_initial_like_states() {
        let state: Vec<Vec2> = (0..16)
            .map(|i| Vec2::splat(0.5 * GOLDEN_RATIO.powi(i)))
            .collect();
        for idx in 0..state.len() {
            let update = field_update_node(&state, idx, &params());
            assert!(update.is_finite());
            assert!(update.contribution <= 1.0 / (2.0 * std::f32::consts::E) + 1e-4);
            assert_eq!(update.encoded, encode_fixed_point(update.contribution));
        }
    }

    #[test]
    fn ring_wraps_for_small_populations() {
        let state = vec![Vec2::new(0.1, 0.0), Vec2::new(0.0, 0.2)];
        let agg = ring_aggregate(&state, 1, &params());
        assert!(agg.is_finite());
    }

    #[test]
    fn projection_strictly_improves_misaligned_nodes() {
        let mut rng = StdRng::seed_from_u64(0xA11);
        let mut corrected = 0;
        for _ in 0..512 {
            let v = random_vec(&mut rng, 3.0);
            let before = alignment(v);
            let after_v = align_node(v);
            if before < ALIGNMENT_TARGET {
                corrected += 1;
                assert!(
                    alignment(after_v) > before,
                    "{v:?}: {before} -> {}",
                    alignment(after_v)
                );
            } else {
                assert_eq!(after_v, v);
            }
        }
        assert!(corrected > 0);
    }

    #[test]
    fn projection_leaves_aligned_nodes_untouched() {
        let v = Vec2::new(2.0, 0.1);
        assert!(alignment(v) >= ALIGNMENT_TARGET);
        assert_eq!(align_node(v), v);
    }

    #[test]
    fn projection_is_soft() {
        let v = Vec2::new(-1.0, 0.0);
        let after = align_node(v);
        // One pass moves at most ALIGNMENT_GAIN * (0.95 + 1) of the way toward L.
        assert!(after.x < 0.0);
        assert!((after.x - (-(1.0 - 0.195) + 0.195)).abs() < 1e-5);
    }

    #[test]
    fn projection_of_zero_vector_points_along_reference() {
        let after = align_node(Vec2::ZERO);
        assert!(after.x > 0.0);
        assert_eq!(after.y, 0.0);
    }
}

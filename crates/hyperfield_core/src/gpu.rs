//! GPU-facing data structures shared between host code and WGSL shaders.

use crate::Scalar;

/// Per-step uniform payload (`Params` in WGSL). Replaced wholesale every step.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct KernelParams {
    pub curvature: Scalar,
    pub golden_ratio: Scalar,
    pub time: Scalar,
    pub step_index: u32,
}

const _: () = assert!(core::mem::size_of::<KernelParams>() == 16);

/// Storage layout of the global metric accumulator (`GlobalMetric` in WGSL).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MetricWords {
    /// Fixed-point sum of node contributions, see [`crate::metrics::encode_fixed_point`].
    pub value: u32,
    /// Number of lanes whose updated state was NaN or infinite.
    pub non_finite: u32,
}

const _: () = assert!(core::mem::size_of::<MetricWords>() == 8);

impl MetricWords {
    pub fn zeroed() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let size = core::mem::size_of::<Self>();
        if bytes.len() < size {
            return None;
        }
        Some(bytemuck::pod_read_unaligned(&bytes[..size]))
    }
}

/// Wire layout of one node: `vec2<f32>` with an 8-byte stride.
pub type GpuNode = [Scalar; 2];

pub const NODE_STRIDE: usize = core::mem::size_of::<GpuNode>();

/// Decodes a raw state buffer into node vectors. Trailing partial nodes are ignored.
pub fn nodes_from_bytes(bytes: &[u8]) -> Vec<GpuNode> {
    bytes
        .chunks_exact(NODE_STRIDE)
        .map(|chunk| bytemuck::pod_read_unaligned::<GpuNode>(chunk))
        .collect()
}

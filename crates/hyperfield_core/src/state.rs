//! Device-resident node state and its deterministic initial layout.

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::device::{BufferId, BufferUsage, ComputeDevice};
use crate::error::{FieldError, FieldResult};
use crate::gpu::{nodes_from_bytes, GpuNode, NODE_STRIDE};

const GOLDEN_RATIO_F64: f64 = 0.618_033_988_749_894_9;
const INITIAL_RADIUS: f64 = 0.5;

/// Radius of node `i` in the initial layout: `φ^i · 0.5`.
pub fn layout_radius(i: u32) -> f64 {
    GOLDEN_RATIO_F64.powi(i as i32) * INITIAL_RADIUS
}

/// Angle of node `i` in the initial layout: `(i · 2π · φ) mod 2π`.
pub fn layout_angle(i: u32) -> f64 {
    (f64::from(i) * std::f64::consts::TAU * GOLDEN_RATIO_F64) % std::f64::consts::TAU
}

/// Golden-angle spiral with geometrically shrinking radii. Computed in `f64` so deep nodes
/// underflow to zero cleanly instead of accumulating `f32` error.
pub fn initial_layout(nodes: u32) -> Vec<Vec2> {
    (0..nodes)
        .map(|i| {
            let (sin_a, cos_a) = layout_angle(i).sin_cos();
            let radius = layout_radius(i);
            Vec2::new((radius * cos_a) as f32, (radius * sin_a) as f32)
        })
        .collect()
}

/// Host copy of the node state taken between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub nodes: Vec<GpuNode>,
}

impl StateSnapshot {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn vectors(&self) -> impl Iterator<Item = Vec2> + '_ {
        self.nodes.iter().copied().map(Vec2::from_array)
    }

    pub fn all_finite(&self) -> bool {
        self.vectors().all(|v| v.is_finite())
    }
}

/// Owns the live node buffer plus the scratch buffer the field update writes into.
///
/// The store never hands out the live buffer; every read is a copy.
#[derive(Debug)]
pub struct StateStore {
    live: BufferId,
    next: BufferId,
    nodes: u32,
}

impl StateStore {
    /// Allocates `nodes` vectors in the golden-spiral layout.
    pub fn init<D: ComputeDevice + ?Sized>(device: &mut D, nodes: u32) -> FieldResult<Self> {
        Self::from_vectors(device, &initial_layout(nodes))
    }

    /// Allocates a store seeded with explicit vectors.
    pub fn from_vectors<D: ComputeDevice + ?Sized>(
        device: &mut D,
        vectors: &[Vec2],
    ) -> FieldResult<Self> {
        if vectors.is_empty() {
            return Err(FieldError::Config("state store needs at least one node".into()));
        }
        let nodes = u32::try_from(vectors.len())
            .map_err(|_| FieldError::Config(format!("{} nodes exceed u32", vectors.len())))?;
        let payload: Vec<GpuNode> = vectors.iter().map(|v| v.to_array()).collect();
        let size = (payload.len() * NODE_STRIDE) as u64;

        let live = device.create_buffer(size, BufferUsage::Storage)?;
        let next = match device.create_buffer(size, BufferUsage::Storage) {
            Ok(next) => next,
            Err(err) => {
                device.release_buffer(live);
                return Err(err);
            }
        };
        let store = Self { live, next, nodes };
        if let Err(err) = device.write_buffer(live, 0, bytemuck::cast_slice(&payload)) {
            store.release(device);
            return Err(err);
        }
        Ok(store)
    }

    pub fn len(&self) -> u32 {
        self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes == 0
    }

    pub fn live_buffer(&self) -> BufferId {
        self.live
    }

    pub fn next_buffer(&self) -> BufferId {
        self.next
    }

    /// Independent snapshot of the live state.
    pub fn read<D: ComputeDevice + ?Sized>(&self, device: &mut D) -> FieldResult<StateSnapshot> {
        let bytes = device.map_and_read(self.live)?;
        let nodes = nodes_from_bytes(&bytes);
        if nodes.len() != self.nodes as usize {
            return Err(FieldError::Buffer(format!(
                "state readback returned {} nodes, expected {}",
                nodes.len(),
                self.nodes
            )));
        }
        Ok(StateSnapshot { nodes })
    }

    pub fn release<D: ComputeDevice + ?Sized>(self, device: &mut D) {
        device.release_buffer(self.live);
        device.release_buffer(self.next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuDevice;

    #[test]
    fn first_node_sits_on_the_positive_axis() {
        let layout = initial_layout(512);
        assert_eq!(layout.len(), 512);
        assert_eq!(layout[0], Vec2::new(0.5, 0.0));
    }

    #[test]
    fn radii_strictly_decrease() {
        for i in 1..512 {
            assert!(layout_radius(i) < layout_radius(i - 1), "radius {i}");
        }
        // Squared lengths stay normal floats for the first 64 nodes.
        let layout = initial_layout(64);
        for pair in layout.windows(2) {
            assert!(pair[1].length() < pair[0].length());
        }
    }

    #[test]
    fn layout_is_reproducible() {
        assert_eq!(initial_layout(64), initial_layout(64));
        let angle = layout_angle(1);
        assert!((angle - std::f64::consts::TAU * GOLDEN_RATIO_F64).abs() < 1e-12);
        assert!((0..512).all(|i| (0.0..std::f64::consts::TAU).contains(&layout_angle(i))));
    }

    #[test]
    fn read_returns_a_copy() {
        let mut device = CpuDevice::new();
        let store = StateStore::init(&mut device, 8).unwrap();
        let first = store.read(&mut device).unwrap();
        let mut copy = first.clone();
        copy.nodes[0] = [9.0, 9.0];
        let second = store.read(&mut device).unwrap();
        assert_eq!(first, second);
        assert_ne!(copy, second);
        assert_eq!(second.len(), 8);
        assert!(second.all_finite());
    }

    #[test]
    fn release_frees_both_buffers() {
        let mut device = CpuDevice::new();
        let store = StateStore::init(&mut device, 4).unwrap();
        assert_eq!(device.live_buffers(), 2);
        store.release(&mut device);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn empty_store_is_rejected() {
        let mut device = CpuDevice::new();
        assert!(StateStore::from_vectors(&mut device, &[]).is_err());
    }
}

//! Host backend that runs each kernel lane on the rayon thread pool.
//!
//! Buffers are plain word vectors. A dispatch snapshots its inputs, runs one lane per node in
//! parallel, and writes results back once every lane has finished, so a dispatch behaves like
//! a completed GPU submission. The metric accumulator is a step-scoped [`AtomicU32`] shared by
//! all lanes; integer addition is order independent, which makes this backend bit-reproducible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use glam::Vec2;
use rayon::prelude::*;

use crate::device::{BufferId, BufferUsage, ComputeDevice, KernelBindings, KernelId, WORKGROUP_SIZE};
use crate::error::{FieldError, FieldResult};
use crate::gpu::{nodes_from_bytes, GpuNode, KernelParams, MetricWords, NODE_STRIDE};
use crate::kernels;

#[derive(Debug)]
struct CpuBuffer {
    words: Vec<u32>,
    usage: BufferUsage,
}

impl CpuBuffer {
    fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.words)
    }
}

#[derive(Debug, Default)]
pub struct CpuDevice {
    buffers: HashMap<BufferId, CpuBuffer>,
    next_id: u32,
}

impl CpuDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unreleased) buffers.
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    fn buffer(&self, id: BufferId) -> FieldResult<&CpuBuffer> {
        self.buffers
            .get(&id)
            .ok_or_else(|| FieldError::Buffer(format!("unknown buffer {id:?}")))
    }

    fn buffer_mut(&mut self, id: BufferId) -> FieldResult<&mut CpuBuffer> {
        self.buffers
            .get_mut(&id)
            .ok_or_else(|| FieldError::Buffer(format!("unknown buffer {id:?}")))
    }

    fn bound(
        &self,
        kernel: KernelId,
        id: BufferId,
        usage: BufferUsage,
        min_len: usize,
    ) -> FieldResult<&CpuBuffer> {
        let buffer = self.buffers.get(&id).ok_or_else(|| FieldError::Dispatch {
            kernel,
            reason: format!("binding refers to unknown buffer {id:?}"),
        })?;
        if buffer.usage != usage {
            return Err(FieldError::Dispatch {
                kernel,
                reason: format!(
                    "buffer {id:?} bound as {usage:?} but created as {:?}",
                    buffer.usage
                ),
            });
        }
        if buffer.bytes().len() < min_len {
            return Err(FieldError::Dispatch {
                kernel,
                reason: format!(
                    "buffer {id:?} holds {} bytes, binding needs at least {min_len}",
                    buffer.bytes().len()
                ),
            });
        }
        Ok(buffer)
    }

    fn state_nodes(&self, kernel: KernelId, id: BufferId) -> FieldResult<Vec<Vec2>> {
        let buffer = self.bound(kernel, id, BufferUsage::Storage, NODE_STRIDE)?;
        Ok(nodes_from_bytes(buffer.bytes())
            .into_iter()
            .map(Vec2::from_array)
            .collect())
    }

    fn params(&self, kernel: KernelId, id: BufferId) -> FieldResult<KernelParams> {
        let size = std::mem::size_of::<KernelParams>();
        let buffer = self.bound(kernel, id, BufferUsage::Uniform, size)?;
        Ok(bytemuck::pod_read_unaligned(&buffer.bytes()[..size]))
    }

    fn metric(&self, kernel: KernelId, id: BufferId) -> FieldResult<MetricWords> {
        let min_len = std::mem::size_of::<MetricWords>();
        let buffer = self.bound(kernel, id, BufferUsage::Storage, min_len)?;
        MetricWords::from_bytes(buffer.bytes()).ok_or_else(|| FieldError::Dispatch {
            kernel,
            reason: "metric buffer too small".into(),
        })
    }

    fn store_nodes(&mut self, id: BufferId, nodes: &[Vec2]) -> FieldResult<()> {
        let payload: Vec<GpuNode> = nodes.iter().map(|v| v.to_array()).collect();
        self.write_buffer(id, 0, bytemuck::cast_slice(&payload))
    }

    fn field_update(&mut self, bindings: &KernelBindings, workgroups: u32) -> FieldResult<()> {
        let kernel = KernelId::FieldUpdate;
        let state = self.state_nodes(kernel, bindings.state)?;
        let params = self.params(kernel, bindings.params)?;
        let metric = self.metric(kernel, bindings.metric)?;
        ensure_same_len(kernel, &state, &self.state_nodes(kernel, bindings.next_state)?)?;

        let accumulator = AtomicU32::new(metric.value);
        let non_finite = AtomicU32::new(metric.non_finite);
        let lanes = active_lanes(state.len(), workgroups);

        let next: Vec<Vec2> = (0..lanes)
            .into_par_iter()
            .map(|idx| {
                let update = kernels::field_update_node(&state, idx, &params);
                accumulator.fetch_add(update.encoded, Ordering::Relaxed);
                if !update.is_finite() {
                    non_finite.fetch_add(1, Ordering::Relaxed);
                }
                update.next
            })
            .collect();

        self.store_nodes(bindings.next_state, &next)?;
        let words = MetricWords {
            value: accumulator.into_inner(),
            non_finite: non_finite.into_inner(),
        };
        self.write_buffer(bindings.metric, 0, bytemuck::bytes_of(&words))
    }

    fn commit_state(&mut self, bindings: &KernelBindings, workgroups: u32) -> FieldResult<()> {
        let kernel = KernelId::CommitState;
        let state = self.state_nodes(kernel, bindings.state)?;
        let next = self.state_nodes(kernel, bindings.next_state)?;
        ensure_same_len(kernel, &state, &next)?;
        let lanes = active_lanes(next.len(), workgroups);
        self.store_nodes(bindings.state, &next[..lanes])
    }

    fn align_to_reference(
        &mut self,
        bindings: &KernelBindings,
        workgroups: u32,
    ) -> FieldResult<()> {
        let state = self.state_nodes(KernelId::AlignToReference, bindings.state)?;
        let lanes = active_lanes(state.len(), workgroups);
        let aligned: Vec<Vec2> = state[..lanes]
            .par_iter()
            .map(|v| kernels::align_node(*v))
            .collect();
        self.store_nodes(bindings.state, &aligned)
    }
}

impl ComputeDevice for CpuDevice {
    fn name(&self) -> &str {
        "cpu"
    }

    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> FieldResult<BufferId> {
        if size == 0 || size % 4 != 0 {
            return Err(FieldError::Buffer(format!(
                "buffer size must be a non-zero multiple of 4, got {size}"
            )));
        }
        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.buffers.insert(
            id,
            CpuBuffer {
                words: vec![0; (size / 4) as usize],
                usage,
            },
        );
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, bytes: &[u8]) -> FieldResult<()> {
        let target = self.buffer_mut(buffer)?.bytes_mut();
        let start = offset as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|end| *end <= target.len())
            .ok_or_else(|| {
                FieldError::Buffer(format!(
                    "write of {} bytes at offset {offset} overruns buffer {buffer:?} ({} bytes)",
                    bytes.len(),
                    target.len()
                ))
            })?;
        target[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn dispatch(
        &mut self,
        kernel: KernelId,
        bindings: &KernelBindings,
        workgroups: u32,
    ) -> FieldResult<()> {
        match kernel {
            KernelId::FieldUpdate => self.field_update(bindings, workgroups),
            KernelId::CommitState => self.commit_state(bindings, workgroups),
            KernelId::AlignToReference => self.align_to_reference(bindings, workgroups),
        }
    }

    fn map_and_read(&mut self, buffer: BufferId) -> FieldResult<Vec<u8>> {
        Ok(self.buffer(buffer)?.bytes().to_vec())
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
    }
}

/// Lanes past the node count exit immediately, like the `idx >= n` guard in WGSL.
fn active_lanes(nodes: usize, workgroups: u32) -> usize {
    nodes.min(workgroups as usize * WORKGROUP_SIZE as usize)
}

fn ensure_same_len(kernel: KernelId, state: &[Vec2], next: &[Vec2]) -> FieldResult<()> {
    if state.len() != next.len() {
        return Err(FieldError::Dispatch {
            kernel,
            reason: format!(
                "state holds {} nodes but next_state holds {}",
                state.len(),
                next.len()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::workgroups_for;
    use crate::GOLDEN_RATIO;

    struct Fixture {
        device: CpuDevice,
        bindings: KernelBindings,
    }

    fn fixture(nodes: &[GpuNode]) -> Fixture {
        let mut device = CpuDevice::new();
        let size = (nodes.len() * NODE_STRIDE) as u64;
        let state = device.create_buffer(size, BufferUsage::Storage).unwrap();
        let next_state = device.create_buffer(size, BufferUsage::Storage).unwrap();
        let metric = device.create_buffer(8, BufferUsage::Storage).unwrap();
        let params = device.create_buffer(16, BufferUsage::Uniform).unwrap();
        device
            .write_buffer(state, 0, bytemuck::cast_slice(nodes))
            .unwrap();
        let kernel_params = KernelParams {
            curvature: -1.0,
            golden_ratio: GOLDEN_RATIO,
            time: 0.0,
            step_index: 0,
        };
        device
            .write_buffer(params, 0, bytemuck::bytes_of(&kernel_params))
            .unwrap();
        Fixture {
            device,
            bindings: KernelBindings {
                state,
                metric,
                params,
                next_state,
            },
        }
    }

    fn read_nodes(device: &mut CpuDevice, id: BufferId) -> Vec<GpuNode> {
        nodes_from_bytes(&device.map_and_read(id).unwrap())
    }

    #[test]
    fn field_update_matches_sequential_reference() {
        let nodes: Vec<GpuNode> = (0..100)
            .map(|i| [0.01 * i as f32, -0.005 * i as f32])
            .collect();
        let mut fx = fixture(&nodes);
        fx.device
            .dispatch(KernelId::FieldUpdate, &fx.bindings, workgroups_for(100))
            .unwrap();

        let state: Vec<Vec2> = nodes.iter().copied().map(Vec2::from_array).collect();
        let params: KernelParams =
            bytemuck::pod_read_unaligned(&fx.device.map_and_read(fx.bindings.params).unwrap());
        let mut expected_sum = 0u32;
        let next = read_nodes(&mut fx.device, fx.bindings.next_state);
        for idx in 0..state.len() {
            let update = kernels::field_update_node(&state, idx, &params);
            expected_sum = expected_sum.wrapping_add(update.encoded);
            assert_eq!(next[idx], update.next.to_array());
        }
        let bytes = fx.device.map_and_read(fx.bindings.metric).unwrap();
        let words = MetricWords::from_bytes(&bytes).unwrap();
        assert_eq!(words.value, expected_sum);
        assert_eq!(words.non_finite, 0);

        // The live state is untouched until the commit pass.
        assert_eq!(read_nodes(&mut fx.device, fx.bindings.state), nodes);
        fx.device
            .dispatch(KernelId::CommitState, &fx.bindings, workgroups_for(100))
            .unwrap();
        assert_eq!(read_nodes(&mut fx.device, fx.bindings.state), next);
    }

    #[test]
    fn non_finite_lanes_are_counted() {
        let nodes = vec![[f32::NAN, 0.0], [0.1, 0.1], [0.2, 0.0]];
        let mut fx = fixture(&nodes);
        fx.device
            .dispatch(KernelId::FieldUpdate, &fx.bindings, 1)
            .unwrap();
        let bytes = fx.device.map_and_read(fx.bindings.metric).unwrap();
        let words = MetricWords::from_bytes(&bytes).unwrap();
        assert!(words.non_finite >= 1);
    }

    #[test]
    fn alignment_runs_in_place() {
        let nodes = vec![[-1.0, 0.0], [1.0, 0.0]];
        let mut fx = fixture(&nodes);
        fx.device
            .dispatch(KernelId::AlignToReference, &fx.bindings, 1)
            .unwrap();
        let after = read_nodes(&mut fx.device, fx.bindings.state);
        assert!(after[0][0] > -1.0);
        assert_eq!(after[1], [1.0, 0.0]);
    }

    #[test]
    fn too_few_workgroups_leave_tail_untouched() {
        let nodes: Vec<GpuNode> = (0..70).map(|_| [-0.5, 0.0]).collect();
        let mut fx = fixture(&nodes);
        fx.device
            .dispatch(KernelId::AlignToReference, &fx.bindings, 1)
            .unwrap();
        let after = read_nodes(&mut fx.device, fx.bindings.state);
        assert_ne!(after[63], [-0.5, 0.0]);
        assert_eq!(after[64], [-0.5, 0.0]);
    }

    #[test]
    fn dispatch_rejects_mismatched_bindings() {
        let nodes = vec![[0.0, 0.0]; 4];
        let mut fx = fixture(&nodes);
        let bad = KernelBindings {
            params: fx.bindings.state,
            ..fx.bindings
        };
        let err = fx.device.dispatch(KernelId::FieldUpdate, &bad, 1).unwrap_err();
        assert!(matches!(
            err,
            FieldError::Dispatch {
                kernel: KernelId::FieldUpdate,
                ..
            }
        ));

        let missing = KernelBindings {
            next_state: BufferId(999),
            ..fx.bindings
        };
        assert!(fx.device.dispatch(KernelId::CommitState, &missing, 1).is_err());
    }

    #[test]
    fn buffer_writes_are_bounds_checked() {
        let mut device = CpuDevice::new();
        let id = device.create_buffer(8, BufferUsage::Storage).unwrap();
        assert!(device.write_buffer(id, 4, &[0u8; 8]).is_err());
        device.write_buffer(id, 4, &[1u8; 4]).unwrap();
        assert_eq!(device.map_and_read(id).unwrap(), vec![0, 0, 0, 0, 1, 1, 1, 1]);
        assert!(device.create_buffer(6, BufferUsage::Storage).is_err());
        device.release_buffer(id);
        assert_eq!(device.live_buffers(), 0);
        assert!(device.map_and_read(id).is_err());
    }
}

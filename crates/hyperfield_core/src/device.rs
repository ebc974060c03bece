//! Compute device abstraction.
//!
//! Any backend that can allocate buffers, write them, dispatch the three kernels and read a
//! buffer back satisfies the engine. Bindings follow the WGSL module in `hyperfield_shaders`:
//!
//! | binding | buffer | WGSL |
//! |---|---|---|
//! | 0 | live state | `array<vec2<f32>>` |
//! | 1 | global metric | `GlobalMetric` (two atomic `u32`) |
//! | 2 | step params | `Params` uniform |
//! | 3 | next state | `array<vec2<f32>>` |

use std::fmt;

use crate::error::FieldResult;

/// Lanes per workgroup; matches `@workgroup_size(64)` in every entry point.
pub const WORKGROUP_SIZE: u32 = 64;

/// Opaque handle to a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Read-write storage that can be written from the host and read back.
    Storage,
    /// Small host-written uniform block.
    Uniform,
}

/// Kernels the engine dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelId {
    /// Ring aggregation, saturation, metric accumulation; writes `next_state`.
    FieldUpdate,
    /// Copies `next_state` into the live state.
    CommitState,
    /// Soft projection of the live state toward the reference direction.
    AlignToReference,
}

impl KernelId {
    pub const ALL: [KernelId; 3] = [
        KernelId::FieldUpdate,
        KernelId::CommitState,
        KernelId::AlignToReference,
    ];

    /// WGSL entry point implementing this kernel.
    pub fn entry_point(self) -> &'static str {
        match self {
            KernelId::FieldUpdate => "field_update",
            KernelId::CommitState => "commit_state",
            KernelId::AlignToReference => "align_to_reference",
        }
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry_point())
    }
}

/// Buffers bound to group 0 for a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelBindings {
    pub state: BufferId,
    pub metric: BufferId,
    pub params: BufferId,
    pub next_state: BufferId,
}

/// Minimal capability set the engine needs from a compute backend.
///
/// Calls are strictly sequential: `dispatch` may return before the device finishes, but a
/// later `map_and_read` must observe every earlier dispatch and write. Errors are terminal
/// for the current run and are never retried.
pub trait ComputeDevice {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> FieldResult<BufferId>;

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, bytes: &[u8]) -> FieldResult<()>;

    fn dispatch(
        &mut self,
        kernel: KernelId,
        bindings: &KernelBindings,
        workgroups: u32,
    ) -> FieldResult<()>;

    /// Waits for outstanding work and returns a copy of the buffer contents.
    fn map_and_read(&mut self, buffer: BufferId) -> FieldResult<Vec<u8>>;

    fn release_buffer(&mut self, buffer: BufferId);
}

impl<D: ComputeDevice + ?Sized> ComputeDevice for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> FieldResult<BufferId> {
        (**self).create_buffer(size, usage)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, bytes: &[u8]) -> FieldResult<()> {
        (**self).write_buffer(buffer, offset, bytes)
    }

    fn dispatch(
        &mut self,
        kernel: KernelId,
        bindings: &KernelBindings,
        workgroups: u32,
    ) -> FieldResult<()> {
        (**self).dispatch(kernel, bindings, workgroups)
    }

    fn map_and_read(&mut self, buffer: BufferId) -> FieldResult<Vec<u8>> {
        (**self).map_and_read(buffer)
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        (**self).release_buffer(buffer)
    }
}

impl<D: ComputeDevice + ?Sized> ComputeDevice for &mut D {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> FieldResult<BufferId> {
        (**self).create_buffer(size, usage)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, bytes: &[u8]) -> FieldResult<()> {
        (**self).write_buffer(buffer, offset, bytes)
    }

    fn dispatch(
        &mut self,
        kernel: KernelId,
        bindings: &KernelBindings,
        workgroups: u32,
    ) -> FieldResult<()> {
        (**self).dispatch(kernel, bindings, workgroups)
    }

    fn map_and_read(&mut self, buffer: BufferId) -> FieldResult<Vec<u8>> {
        (**self).map_and_read(buffer)
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        (**self).release_buffer(buffer)
    }
}

/// Number of workgroups covering `nodes` lanes.
pub const fn workgroups_for(nodes: u32) -> u32 {
    if nodes == 0 {
        0
    } else {
        ((nodes - 1) / WORKGROUP_SIZE) + 1
    }
}

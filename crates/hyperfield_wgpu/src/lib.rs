//! `wgpu` backend for the hyperfield compute device abstraction.
//!
//! All three kernels share one bind group layout (state, metric, params, next state) and one
//! shader module. Every dispatch runs inside a validation error scope so a rejected dispatch
//! surfaces as [`FieldError::Dispatch`] instead of the default uncaptured-error panic.

use std::{borrow::Cow, collections::HashMap, sync::mpsc};

use hyperfield_core::{
    BufferId, BufferUsage, ComputeDevice, FieldError, FieldResult, KernelBindings, KernelId,
};
use hyperfield_shaders::compute;
use tracing::{debug, info};
use wgpu::{
    AdapterInfo, Backends, BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout,
    BindGroupLayoutDescriptor, BindGroupLayoutEntry, BindingType, BufferBindingType,
    BufferDescriptor, BufferUsages, CommandEncoderDescriptor, ComputePassDescriptor,
    ComputePipeline, ComputePipelineDescriptor, Device, DeviceDescriptor, ErrorFilter, Features,
    Instance, InstanceDescriptor, Limits, MapMode, PipelineLayoutDescriptor, PowerPreference,
    Queue, RequestAdapterOptions, ShaderStages,
};

struct DeviceBuffer {
    buffer: wgpu::Buffer,
    usage: BufferUsage,
    size: u64,
}

struct Pipelines {
    field_update: ComputePipeline,
    commit_state: ComputePipeline,
    align_to_reference: ComputePipeline,
}

impl Pipelines {
    fn get(&self, kernel: KernelId) -> &ComputePipeline {
        match kernel {
            KernelId::FieldUpdate => &self.field_update,
            KernelId::CommitState => &self.commit_state,
            KernelId::AlignToReference => &self.align_to_reference,
        }
    }
}

pub struct WgpuDevice {
    adapter_info: AdapterInfo,
    device: Device,
    queue: Queue,
    layout: BindGroupLayout,
    pipelines: Pipelines,
    buffers: HashMap<BufferId, DeviceBuffer>,
    bind_groups: HashMap<KernelBindings, BindGroup>,
    next_id: u32,
}

impl WgpuDevice {
    /// Acquires an adapter and device and builds the kernel pipelines. Any failure here is a
    /// setup error ([`FieldError::DeviceUnavailable`]), distinct from per-step errors.
    pub async fn new_async() -> FieldResult<Self> {
        let instance = Instance::new(&InstanceDescriptor {
            backends: Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| {
                FieldError::DeviceUnavailable("no compatible GPU adapter found".into())
            })?;
        let adapter_info = adapter.get_info();

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("Hyperfield Device"),
                    required_features: Features::empty(),
                    required_limits: Limits::downlevel_defaults(),
                    ..Default::default()
                },
                None,
            )
            .await
            .map_err(|err| {
                FieldError::DeviceUnavailable(format!("failed to request wgpu device: {err}"))
            })?;

        device.push_error_scope(ErrorFilter::Validation);
        let layout = create_bind_group_layout(&device);
        let pipelines = create_pipelines(&device, &layout);
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(FieldError::DeviceUnavailable(format!(
                "kernel pipelines rejected by {}: {err}",
                adapter_info.name
            )));
        }

        info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            "wgpu compute device ready"
        );

        Ok(Self {
            adapter_info,
            device,
            queue,
            layout,
            pipelines,
            buffers: HashMap::new(),
            bind_groups: HashMap::new(),
            next_id: 0,
        })
    }

    pub fn new() -> FieldResult<Self> {
        pollster::block_on(Self::new_async())
    }

    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.adapter_info
    }

    fn buffer(&self, id: BufferId) -> FieldResult<&DeviceBuffer> {
        self.buffers
            .get(&id)
            .ok_or_else(|| FieldError::Buffer(format!("unknown buffer {id:?}")))
    }

    fn check_binding(&self, kernel: KernelId, id: BufferId, usage: BufferUsage) -> FieldResult<()> {
        let entry = self.buffers.get(&id).ok_or_else(|| FieldError::Dispatch {
            kernel,
            reason: format!("binding refers to unknown buffer {id:?}"),
        })?;
        if entry.usage != usage {
            return Err(FieldError::Dispatch {
                kernel,
                reason: format!(
                    "buffer {id:?} bound as {usage:?} but created as {:?}",
                    entry.usage
                ),
            });
        }
        Ok(())
    }

    /// Validates `bindings` against the registered buffers and caches their bind group.
    fn prepare_bind_group(
        &mut self,
        kernel: KernelId,
        bindings: &KernelBindings,
    ) -> FieldResult<()> {
        self.check_binding(kernel, bindings.state, BufferUsage::Storage)?;
        self.check_binding(kernel, bindings.metric, BufferUsage::Storage)?;
        self.check_binding(kernel, bindings.params, BufferUsage::Uniform)?;
        self.check_binding(kernel, bindings.next_state, BufferUsage::Storage)?;

        if self.bind_groups.contains_key(bindings) {
            return Ok(());
        }

        let resource = |id: BufferId| self.buffers[&id].buffer.as_entire_binding();
        let group = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("Field Bind Group"),
            layout: &self.layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: resource(bindings.state),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: resource(bindings.metric),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: resource(bindings.params),
                },
                BindGroupEntry {
                    binding: 3,
                    resource: resource(bindings.next_state),
                },
            ],
        });
        self.bind_groups.insert(*bindings, group);
        Ok(())
    }
}

impl ComputeDevice for WgpuDevice {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> FieldResult<BufferId> {
        if size == 0 || size % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(FieldError::Buffer(format!(
                "buffer size must be a non-zero multiple of {}, got {size}",
                wgpu::COPY_BUFFER_ALIGNMENT
            )));
        }

        self.device.push_error_scope(ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&BufferDescriptor {
            label: Some(match usage {
                BufferUsage::Storage => "Hyperfield Storage Buffer",
                BufferUsage::Uniform => "Hyperfield Uniform Buffer",
            }),
            size,
            usage: buffer_usages(usage),
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(FieldError::Buffer(format!(
                "failed to allocate {size} bytes: {err}"
            )));
        }

        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.buffers.insert(id, DeviceBuffer { buffer, usage, size });
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, bytes: &[u8]) -> FieldResult<()> {
        let entry = self.buffer(buffer)?;
        let len = bytes.len() as u64;
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0
            || len % wgpu::COPY_BUFFER_ALIGNMENT != 0
            || offset + len > entry.size
        {
            return Err(FieldError::Buffer(format!(
                "write of {len} bytes at offset {offset} does not fit buffer {buffer:?} ({} bytes)",
                entry.size
            )));
        }
        self.queue.write_buffer(&entry.buffer, offset, bytes);
        Ok(())
    }

    fn dispatch(
        &mut self,
        kernel: KernelId,
        bindings: &KernelBindings,
        workgroups: u32,
    ) -> FieldResult<()> {
        self.prepare_bind_group(kernel, bindings)?;
        if workgroups == 0 {
            return Ok(());
        }
        let bind_group = &self.bind_groups[bindings];

        self.device.push_error_scope(ErrorFilter::Validation);
        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("Field Encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                label: Some(kernel.entry_point()),
                timestamp_writes: None,
            });
            pass.set_pipeline(self.pipelines.get(kernel));
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(workgroups, 1, 1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(FieldError::Dispatch {
                kernel,
                reason: err.to_string(),
            });
        }
        debug!(%kernel, workgroups, "dispatched");
        Ok(())
    }

    fn map_and_read(&mut self, buffer: BufferId) -> FieldResult<Vec<u8>> {
        let entry = self.buffer(buffer)?;
        let staging = self.device.create_buffer(&BufferDescriptor {
            label: Some("Hyperfield Readback Staging"),
            size: entry.size,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(&entry.buffer, 0, &staging, 0, entry.size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.device.poll(wgpu::MaintainBase::Wait);

        receiver
            .recv()
            .map_err(|_| FieldError::Buffer("readback callback was dropped".into()))?
            .map_err(|err| FieldError::Buffer(format!("failed to map readback buffer: {err}")))?;

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        if let Some(entry) = self.buffers.remove(&buffer) {
            self.bind_groups.retain(|bindings, _| {
                ![
                    bindings.state,
                    bindings.metric,
                    bindings.params,
                    bindings.next_state,
                ]
                .contains(&buffer)
            });
            entry.buffer.destroy();
        }
    }
}

fn buffer_usages(usage: BufferUsage) -> BufferUsages {
    let base = BufferUsages::COPY_DST | BufferUsages::COPY_SRC;
    match usage {
        BufferUsage::Storage => BufferUsages::STORAGE | base,
        BufferUsage::Uniform => BufferUsages::UNIFORM | base,
    }
}

fn create_bind_group_layout(device: &Device) -> BindGroupLayout {
    let buffer_entry = |binding, ty: BufferBindingType| BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };

    device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Some("field_bind_group_layout"),
        entries: &[
            buffer_entry(0, BufferBindingType::Storage { read_only: false }),
            buffer_entry(1, BufferBindingType::Storage { read_only: false }),
            buffer_entry(2, BufferBindingType::Uniform),
            buffer_entry(3, BufferBindingType::Storage { read_only: false }),
        ],
    })
}

fn create_pipelines(device: &Device, layout: &BindGroupLayout) -> Pipelines {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("field.wgsl"),
        source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(compute::FIELD)),
    });
    let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
        label: Some("Field Pipeline Layout"),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });

    let pipeline = |label: &str, entry_point: &str| {
        device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some(entry_point),
            compilation_options: Default::default(),
            cache: None,
        })
    };

    Pipelines {
        field_update: pipeline("Field Update Pipeline", compute::FIELD_UPDATE_ENTRY),
        commit_state: pipeline("Commit State Pipeline", compute::COMMIT_STATE_ENTRY),
        align_to_reference: pipeline(
            "Align To Reference Pipeline",
            compute::ALIGN_TO_REFERENCE_ENTRY,
        ),
    }
}

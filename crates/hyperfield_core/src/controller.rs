//! Sequential host controller driving the evolution loop.
//!
//! One step is: reset metric → upload params → field update → read back metric → commit →
//! record sample → (every K steps) alignment → halt check. The readback is a hard barrier:
//! the next step's params and the halt decision depend on it, so steps never overlap.

use std::fmt;

use glam::Vec2;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::device::{workgroups_for, BufferId, BufferUsage, ComputeDevice, KernelBindings, KernelId};
use crate::error::{FieldError, FieldResult};
use crate::gpu::{KernelParams, MetricWords};
use crate::metrics::{decode_fixed_point, EvolutionHistory};
use crate::state::{StateSnapshot, StateStore};

/// Lifecycle of a controller. `Failed` is terminal and reachable from `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Init,
    Running,
    HaltedSafety,
    Completed,
    Exported,
    Failed,
}

impl ControllerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ControllerState::HaltedSafety
                | ControllerState::Completed
                | ControllerState::Exported
                | ControllerState::Failed
        )
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ControllerState::Init => "init",
            ControllerState::Running => "running",
            ControllerState::HaltedSafety => "halted (safety)",
            ControllerState::Completed => "completed",
            ControllerState::Exported => "exported",
            ControllerState::Failed => "failed",
        };
        f.write_str(label)
    }
}

enum StepOutcome {
    Continue,
    Halt,
}

pub struct EvolutionController<D: ComputeDevice> {
    device: D,
    config: EngineConfig,
    store: Option<StateStore>,
    metric: BufferId,
    params: BufferId,
    history: EvolutionHistory,
    state: ControllerState,
}

impl<D: ComputeDevice> EvolutionController<D> {
    /// Validates `config` and allocates the golden-spiral state on `device`.
    pub fn new(device: D, config: EngineConfig) -> FieldResult<Self> {
        config.validate()?;
        let nodes = crate::state::initial_layout(config.nodes);
        Self::with_state(device, config, &nodes)
    }

    /// Like [`EvolutionController::new`] but seeds the store with explicit vectors. The
    /// node count is taken from `vectors` and overrides `config.nodes`.
    pub fn with_state(
        mut device: D,
        mut config: EngineConfig,
        vectors: &[Vec2],
    ) -> FieldResult<Self> {
        config.nodes = u32::try_from(vectors.len()).unwrap_or(u32::MAX);
        config.validate()?;

        let store = StateStore::from_vectors(&mut device, vectors)?;
        let (metric, params) = match allocate_step_buffers(&mut device) {
            Ok(buffers) => buffers,
            Err(err) => {
                store.release(&mut device);
                return Err(err);
            }
        };

        info!(
            backend = device.name(),
            nodes = config.nodes,
            curvature = config.curvature,
            threshold = config.halt_threshold,
            "evolution controller initialised"
        );

        Ok(Self {
            device,
            config,
            store: Some(store),
            metric,
            params,
            history: EvolutionHistory::default(),
            state: ControllerState::Init,
        })
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn history(&self) -> &EvolutionHistory {
        &self.history
    }

    pub fn last_metric(&self) -> Option<f64> {
        self.history.last()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn node_count(&self) -> u32 {
        self.config.nodes
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Runs up to `max_iterations` steps, stopping early when the metric crosses the halt
    /// threshold. Only valid once, from `Init`.
    pub fn run(&mut self, max_iterations: u32) -> FieldResult<EvolutionHistory> {
        if self.state != ControllerState::Init {
            return Err(FieldError::InvalidState {
                state: self.state,
                action: "run",
            });
        }
        self.state = ControllerState::Running;
        self.history = EvolutionHistory::with_capacity(max_iterations as usize);
        info!(max_iterations, "evolution started");

        for step in 0..max_iterations {
            match self.step(step) {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Halt) => {
                    self.state = ControllerState::HaltedSafety;
                    return Ok(self.history.clone());
                }
                Err(err) => {
                    error!(step, %err, "evolution failed");
                    self.state = ControllerState::Failed;
                    return Err(err);
                }
            }
        }

        self.state = ControllerState::Completed;
        info!(
            steps = self.history.len(),
            peak = self.history.peak().unwrap_or(0.0),
            "evolution completed"
        );
        Ok(self.history.clone())
    }

    fn step(&mut self, step: u32) -> FieldResult<StepOutcome> {
        let bindings = self.bindings()?;
        let workgroups = workgroups_for(self.config.nodes);

        self.device
            .write_buffer(self.metric, 0, bytemuck::bytes_of(&MetricWords::zeroed()))?;
        let params = self.config.kernel_params(step);
        self.device
            .write_buffer(self.params, 0, bytemuck::bytes_of(&params))?;

        self.device
            .dispatch(KernelId::FieldUpdate, &bindings, workgroups)?;
        let words = self.read_metric()?;
        if words.non_finite > 0 {
            return Err(FieldError::NonFinite {
                step,
                count: words.non_finite,
            });
        }
        self.device
            .dispatch(KernelId::CommitState, &bindings, workgroups)?;

        let value = decode_fixed_point(words.value);
        self.history.push(value);
        debug!(step, metric = value, "step complete");

        if self.config.aligns_on(step) {
            self.device
                .dispatch(KernelId::AlignToReference, &bindings, workgroups)?;
        }

        if self.config.progress_interval > 0 && step % self.config.progress_interval == 0 {
            info!(step, metric = value, "evolution progress");
        }

        if value > self.config.halt_threshold {
            warn!(
                step,
                metric = value,
                threshold = self.config.halt_threshold,
                "metric exceeded safety threshold, halting"
            );
            return Ok(StepOutcome::Halt);
        }
        Ok(StepOutcome::Continue)
    }

    fn read_metric(&mut self) -> FieldResult<MetricWords> {
        let bytes = self.device.map_and_read(self.metric)?;
        MetricWords::from_bytes(&bytes).ok_or_else(|| {
            FieldError::Buffer(format!(
                "metric readback returned {} bytes, expected {}",
                bytes.len(),
                std::mem::size_of::<MetricWords>()
            ))
        })
    }

    fn bindings(&self) -> FieldResult<KernelBindings> {
        let store = self.store_ref()?;
        Ok(KernelBindings {
            state: store.live_buffer(),
            metric: self.metric,
            params: self.params,
            next_state: store.next_buffer(),
        })
    }

    fn store_ref(&self) -> FieldResult<&StateStore> {
        self.store
            .as_ref()
            .ok_or_else(|| FieldError::Buffer("state store already released".into()))
    }

    /// Snapshot of the current node state. Finishing a run (halt or completion) and exporting
    /// moves the controller to `Exported`; exporting again returns the same snapshot.
    pub fn export_state(&mut self) -> FieldResult<StateSnapshot> {
        if self.state == ControllerState::Running {
            return Err(FieldError::InvalidState {
                state: self.state,
                action: "export state",
            });
        }
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| FieldError::Buffer("state store already released".into()))?;
        let snapshot = store.read(&mut self.device)?;
        if matches!(
            self.state,
            ControllerState::HaltedSafety | ControllerState::Completed
        ) {
            self.state = ControllerState::Exported;
        }
        Ok(snapshot)
    }
}

/// Metric and params buffers; nothing stays allocated when either fails.
fn allocate_step_buffers<D: ComputeDevice>(device: &mut D) -> FieldResult<(BufferId, BufferId)> {
    let metric = device.create_buffer(
        std::mem::size_of::<MetricWords>() as u64,
        BufferUsage::Storage,
    )?;
    match device.create_buffer(
        std::mem::size_of::<KernelParams>() as u64,
        BufferUsage::Uniform,
    ) {
        Ok(params) => Ok((metric, params)),
        Err(err) => {
            device.release_buffer(metric);
            Err(err)
        }
    }
}

impl<D: ComputeDevice> Drop for EvolutionController<D> {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            store.release(&mut self.device);
        }
        self.device.release_buffer(self.metric);
        self.device.release_buffer(self.params);
    }
}
